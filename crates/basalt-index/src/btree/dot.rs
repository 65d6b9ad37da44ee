//! Graphviz dump of the tree structure.
//!
//! Internal nodes render as pink tables whose cells are ports named after
//! their child pages, leaves as green tables of keys. Each node emits the
//! edge from its parent's port to itself; leaf siblings are chained with
//! rank=same hints so the bottom row lays out in key order.

use super::{internal, leaf, node};
use crate::keys::{IndexKey, IndexValue};
use basalt_buffer::BufferPoolManager;
use basalt_common::page::PageId;
use basalt_common::Result;
use std::fmt::Write;

/// Appends the DOT body for the subtree rooted at `root`.
pub(crate) fn render<K: IndexKey, V: IndexValue>(
    pool: &BufferPoolManager,
    root: PageId,
    out: &mut String,
) -> Result<()> {
    let mut queue = vec![root];

    while let Some(page_id) = queue.pop() {
        let frame = pool.fetch_page(page_id)?;
        let guard = frame.latch_read();
        let data = &guard[..];

        if node::is_leaf(data) {
            render_leaf::<K, V>(data, page_id, out);
        } else {
            let children = render_internal::<K>(data, page_id, out);
            queue.extend(children);
        }

        drop(guard);
        pool.unpin_page(page_id, false);
    }
    Ok(())
}

fn table_open(out: &mut String, color: &str) {
    let _ = writeln!(
        out,
        "[shape=plain color={} label=<<TABLE BORDER=\"0\" CELLBORDER=\"1\" CELLSPACING=\"0\" CELLPADDING=\"4\">",
        color
    );
}

fn size_row(out: &mut String, data: &[u8], cols: usize) {
    let _ = writeln!(
        out,
        "<TR><TD COLSPAN=\"{}\">max_size={},min_size={}</TD></TR>",
        cols,
        node::max_size(data),
        node::min_size(data)
    );
}

fn parent_edge(out: &mut String, data: &[u8], page_id: PageId, prefix: &str) {
    let parent = node::parent_page_id(data);
    if parent.is_valid() {
        let _ = writeln!(
            out,
            "INT_{}:p{} -> {}_{};",
            parent.0, page_id.0, prefix, page_id.0
        );
    }
}

fn render_leaf<K: IndexKey, V: IndexValue>(data: &[u8], page_id: PageId, out: &mut String) {
    let size = node::size(data);
    let cols = size.max(1);

    let _ = write!(out, "LEAF_{} ", page_id.0);
    table_open(out, "green");
    let _ = writeln!(out, "<TR><TD COLSPAN=\"{}\">P={}</TD></TR>", cols, page_id.0);
    size_row(out, data, cols);
    out.push_str("<TR>");
    for i in 0..size {
        let _ = writeln!(out, "<TD>{}</TD>", leaf::key_at::<K, V>(data, i));
    }
    out.push_str("</TR></TABLE>>];\n");

    let next = node::next_page_id(data);
    if next.is_valid() {
        let _ = writeln!(out, "LEAF_{} -> LEAF_{};", page_id.0, next.0);
        let _ = writeln!(out, "{{rank=same LEAF_{} LEAF_{}}};", page_id.0, next.0);
    }

    parent_edge(out, data, page_id, "LEAF");
}

/// Emits one internal node and returns its child ids for the walk.
fn render_internal<K: IndexKey>(data: &[u8], page_id: PageId, out: &mut String) -> Vec<PageId> {
    let size = node::size(data);
    let cols = size.max(1);
    let children: Vec<PageId> = (0..size).map(|i| internal::value_at::<K>(data, i)).collect();

    let _ = write!(out, "INT_{} ", page_id.0);
    table_open(out, "pink");
    let _ = writeln!(out, "<TR><TD COLSPAN=\"{}\">P={}</TD></TR>", cols, page_id.0);
    size_row(out, data, cols);
    out.push_str("<TR>");
    for (i, child) in children.iter().enumerate() {
        let _ = write!(out, "<TD PORT=\"p{}\">", child.0);
        if i > 0 {
            let _ = write!(out, "{}", internal::key_at::<K>(data, i));
        } else {
            out.push(' ');
        }
        out.push_str("</TD>\n");
    }
    out.push_str("</TR></TABLE>>];\n");

    parent_edge(out, data, page_id, "INT");

    children
}
