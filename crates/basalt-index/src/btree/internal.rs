//! Internal node body: an array of (key, child page id) cells.
//!
//! Cell `i` sits at `NODE_HEADER_SIZE + i * (key_len + 4)`: the key bytes
//! followed by the child page id. The key in cell 0 is a dummy and is never
//! compared; `size` counts cells, i.e. children.
//!
//! Functions that move cells between nodes return the moved child page ids;
//! the tree layer reparents those children through the buffer pool.

use super::node::{self, NODE_HEADER_SIZE};
use crate::keys::{IndexKey, KeyComparator};
use basalt_common::page::{PageId, PageType};
use basalt_common::PAGE_SIZE;
use std::cmp::Ordering;

#[inline]
fn entry_size<K: IndexKey>() -> usize {
    K::encoded_len() + 4
}

/// Maximum number of children a page can physically hold for key type `K`.
pub fn capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - NODE_HEADER_SIZE) / entry_size::<K>()
}

#[inline]
fn key_offset<K: IndexKey>(index: usize) -> usize {
    NODE_HEADER_SIZE + index * entry_size::<K>()
}

#[inline]
fn child_offset<K: IndexKey>(index: usize) -> usize {
    key_offset::<K>(index) + K::encoded_len()
}

/// Initializes a zeroed page as an empty internal node.
pub fn init<K: IndexKey>(data: &mut [u8], page_id: PageId, parent: PageId, max_size: u16) {
    debug_assert!((max_size as usize) <= capacity::<K>());
    node::init(data, PageType::Internal, page_id, parent, max_size);
}

#[inline]
pub fn key_at<K: IndexKey>(data: &[u8], index: usize) -> K {
    debug_assert!(index < node::size(data));
    let offset = key_offset::<K>(index);
    K::decode(&data[offset..offset + K::encoded_len()])
}

#[inline]
pub fn set_key_at<K: IndexKey>(data: &mut [u8], index: usize, key: &K) {
    debug_assert!(index < node::size(data));
    let offset = key_offset::<K>(index);
    key.encode(&mut data[offset..offset + K::encoded_len()]);
}

#[inline]
pub fn value_at<K: IndexKey>(data: &[u8], index: usize) -> PageId {
    debug_assert!(index < node::size(data));
    let offset = child_offset::<K>(index);
    PageId(u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

#[inline]
fn set_value_at<K: IndexKey>(data: &mut [u8], index: usize, child: PageId) {
    let offset = child_offset::<K>(index);
    data[offset..offset + 4].copy_from_slice(&child.0.to_le_bytes());
}

/// Returns the cell index whose child pointer equals `child`, if any.
pub fn value_index<K: IndexKey>(data: &[u8], child: PageId) -> Option<usize> {
    (0..node::size(data)).find(|&i| value_at::<K>(data, i) == child)
}

/// Routes a key to the child whose range contains it.
///
/// Keys in cells [1, size) partition the range: child[i] covers
/// key[i] <= k < key[i+1], with key[0] = -inf and key[size] = +inf.
pub fn lookup<K: IndexKey, C: KeyComparator<K>>(data: &[u8], key: &K, comparator: &C) -> PageId {
    let size = node::size(data);
    debug_assert!(size >= 1);

    if size == 1 {
        return value_at::<K>(data, 0);
    }
    if comparator.compare(key, &key_at::<K>(data, 1)) == Ordering::Less {
        return value_at::<K>(data, 0);
    }
    if comparator.compare(key, &key_at::<K>(data, size - 1)) != Ordering::Less {
        return value_at::<K>(data, size - 1);
    }
    for i in 1..size - 1 {
        if comparator.compare(key, &key_at::<K>(data, i)) != Ordering::Less
            && comparator.compare(key, &key_at::<K>(data, i + 1)) == Ordering::Less
        {
            return value_at::<K>(data, i);
        }
    }
    value_at::<K>(data, size - 1)
}

/// Fills a fresh root after the old root split: child 0 is the old root,
/// cell 1 carries the promoted key and the new sibling.
pub fn populate_new_root<K: IndexKey>(data: &mut [u8], left: PageId, key: &K, right: PageId) {
    debug_assert_eq!(node::size(data), 0);
    set_value_at::<K>(data, 0, left);
    node::set_size(data, 2);
    set_key_at::<K>(data, 1, key);
    set_value_at::<K>(data, 1, right);
}

/// Inserts (key, new_child) immediately after the cell pointing at
/// `old_child`. Returns the new size.
pub fn insert_node_after<K: IndexKey>(
    data: &mut [u8],
    old_child: PageId,
    key: &K,
    new_child: PageId,
) -> usize {
    let size = node::size(data);
    debug_assert!(size < capacity::<K>());

    let point = value_index::<K>(data, old_child).expect("old child must be present");

    let src = key_offset::<K>(point + 1);
    let end = key_offset::<K>(size);
    data.copy_within(src..end, src + entry_size::<K>());

    node::set_size(data, size + 1);
    set_key_at::<K>(data, point + 1, key);
    set_value_at::<K>(data, point + 1, new_child);
    size + 1
}

/// Removes the cell at `index`, shifting later cells left.
pub fn remove_at<K: IndexKey>(data: &mut [u8], index: usize) {
    let size = node::size(data);
    debug_assert!(index < size);

    let src = key_offset::<K>(index + 1);
    let end = key_offset::<K>(size);
    data.copy_within(src..end, key_offset::<K>(index));
    node::set_size(data, size - 1);
}

/// Moves the upper half of this node's cells to an empty sibling.
///
/// Returns the promoted middle key and the moved child page ids. The middle
/// key lands in the sibling's cell 0 where it is dummy; the caller hands it
/// to the parent.
pub fn move_half_to<K: IndexKey>(src: &mut [u8], dst: &mut [u8]) -> (K, Vec<PageId>) {
    let total = node::size(src);
    debug_assert_eq!(node::size(dst), 0);

    let start = total / 2;
    let count = total - start;
    let middle_key = key_at::<K>(src, start);

    let from = key_offset::<K>(start);
    let to = key_offset::<K>(total);
    dst[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (to - from)].copy_from_slice(&src[from..to]);

    node::set_size(src, start);
    node::set_size(dst, count);

    let moved = (0..count).map(|i| value_at::<K>(dst, i)).collect();
    (middle_key, moved)
}

/// Moves every cell of `src` to the end of `dst`, folding the parent's
/// separating key into `src`'s dummy slot first. Returns the moved children.
pub fn move_all_to<K: IndexKey>(src: &mut [u8], dst: &mut [u8], middle_key: &K) -> Vec<PageId> {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(dst_size + src_size <= capacity::<K>());

    set_key_at::<K>(src, 0, middle_key);

    let from = key_offset::<K>(0);
    let to = key_offset::<K>(src_size);
    let dst_from = key_offset::<K>(dst_size);
    dst[dst_from..dst_from + (to - from)].copy_from_slice(&src[from..to]);

    node::set_size(dst, dst_size + src_size);
    node::set_size(src, 0);

    (dst_size..dst_size + src_size)
        .map(|i| value_at::<K>(dst, i))
        .collect()
}

/// Moves `src`'s first child to the end of `dst` (its left sibling), with
/// the parent's separating key coming down as the transferred cell's key.
/// Returns the moved child page id.
pub fn move_first_to_end_of<K: IndexKey>(src: &mut [u8], dst: &mut [u8], middle_key: &K) -> PageId {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(src_size > 1);

    let child = value_at::<K>(src, 0);
    node::set_size(dst, dst_size + 1);
    set_key_at::<K>(dst, dst_size, middle_key);
    set_value_at::<K>(dst, dst_size, child);

    let from = key_offset::<K>(1);
    let to = key_offset::<K>(src_size);
    src.copy_within(from..to, key_offset::<K>(0));
    node::set_size(src, src_size - 1);

    child
}

/// Moves `src`'s last cell to the front of `dst` (its right sibling). The
/// parent's separating key comes down as `dst`'s first real key; the moved
/// cell becomes the new dummy. Returns the moved child page id.
pub fn move_last_to_front_of<K: IndexKey>(src: &mut [u8], dst: &mut [u8], middle_key: &K) -> PageId {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(src_size > 1);

    let moved_key = key_at::<K>(src, src_size - 1);
    let child = value_at::<K>(src, src_size - 1);
    node::set_size(src, src_size - 1);

    let from = key_offset::<K>(0);
    let to = key_offset::<K>(dst_size);
    dst.copy_within(from..to, from + entry_size::<K>());
    node::set_size(dst, dst_size + 1);

    set_key_at::<K>(dst, 0, &moved_key);
    set_value_at::<K>(dst, 0, child);
    set_key_at::<K>(dst, 1, middle_key);

    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::OrdComparator;

    fn fresh_node(page_id: u32, max_size: u16) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        init::<i64>(&mut data, PageId(page_id), PageId::INVALID, max_size);
        data
    }

    /// Builds a node with children c0 | k1 c1 | k2 c2 | ...
    fn build_node(page_id: u32, max_size: u16, first_child: u32, entries: &[(i64, u32)]) -> Vec<u8> {
        let mut data = fresh_node(page_id, max_size);
        populate_new_root::<i64>(
            &mut data,
            PageId(first_child),
            &entries[0].0,
            PageId(entries[0].1),
        );
        for window in entries.windows(2) {
            let (_, prev_child) = window[0];
            let (key, child) = window[1];
            insert_node_after::<i64>(&mut data, PageId(prev_child), &key, PageId(child));
        }
        data
    }

    #[test]
    fn test_internal_capacity() {
        // (4096 - 28) / (8 + 4) = 339
        assert_eq!(capacity::<i64>(), 339);
    }

    #[test]
    fn test_internal_populate_new_root() {
        let mut data = fresh_node(1, 4);
        populate_new_root::<i64>(&mut data, PageId(10), &50, PageId(11));

        assert_eq!(node::size(&data), 2);
        assert_eq!(value_at::<i64>(&data, 0), PageId(10));
        assert_eq!(key_at::<i64>(&data, 1), 50);
        assert_eq!(value_at::<i64>(&data, 1), PageId(11));
    }

    #[test]
    fn test_internal_insert_node_after() {
        let data = build_node(1, 4, 10, &[(50, 11), (70, 12)]);

        assert_eq!(node::size(&data), 3);
        assert_eq!(value_at::<i64>(&data, 0), PageId(10));
        assert_eq!(key_at::<i64>(&data, 1), 50);
        assert_eq!(value_at::<i64>(&data, 1), PageId(11));
        assert_eq!(key_at::<i64>(&data, 2), 70);
        assert_eq!(value_at::<i64>(&data, 2), PageId(12));
    }

    #[test]
    fn test_internal_insert_in_middle() {
        let mut data = build_node(1, 4, 10, &[(50, 11), (70, 12)]);
        // Split of child 11 promotes key 60.
        insert_node_after::<i64>(&mut data, PageId(11), &60, PageId(13));

        assert_eq!(node::size(&data), 4);
        assert_eq!(key_at::<i64>(&data, 1), 50);
        assert_eq!(key_at::<i64>(&data, 2), 60);
        assert_eq!(value_at::<i64>(&data, 2), PageId(13));
        assert_eq!(key_at::<i64>(&data, 3), 70);
    }

    #[test]
    fn test_internal_value_index() {
        let data = build_node(1, 4, 10, &[(50, 11), (70, 12)]);

        assert_eq!(value_index::<i64>(&data, PageId(10)), Some(0));
        assert_eq!(value_index::<i64>(&data, PageId(12)), Some(2));
        assert_eq!(value_index::<i64>(&data, PageId(99)), None);
    }

    #[test]
    fn test_internal_lookup_routes() {
        let cmp = OrdComparator::<i64>::new();
        let data = build_node(1, 4, 10, &[(50, 11), (70, 12)]);

        assert_eq!(lookup(&data, &0, &cmp), PageId(10));
        assert_eq!(lookup(&data, &49, &cmp), PageId(10));
        assert_eq!(lookup(&data, &50, &cmp), PageId(11));
        assert_eq!(lookup(&data, &69, &cmp), PageId(11));
        assert_eq!(lookup(&data, &70, &cmp), PageId(12));
        assert_eq!(lookup(&data, &1000, &cmp), PageId(12));
    }

    #[test]
    fn test_internal_lookup_single_child() {
        let cmp = OrdComparator::<i64>::new();
        let mut data = fresh_node(1, 4);
        populate_new_root::<i64>(&mut data, PageId(5), &10, PageId(6));
        remove_at::<i64>(&mut data, 1);

        assert_eq!(node::size(&data), 1);
        assert_eq!(lookup(&data, &999, &cmp), PageId(5));
    }

    #[test]
    fn test_internal_remove_at() {
        let mut data = build_node(1, 4, 10, &[(50, 11), (70, 12)]);

        remove_at::<i64>(&mut data, 1);

        assert_eq!(node::size(&data), 2);
        assert_eq!(value_at::<i64>(&data, 0), PageId(10));
        assert_eq!(key_at::<i64>(&data, 1), 70);
        assert_eq!(value_at::<i64>(&data, 1), PageId(12));
    }

    #[test]
    fn test_internal_move_half_to() {
        let data_src = build_node(1, 6, 10, &[(20, 11), (40, 12), (60, 13)]);
        let mut src = data_src;
        let mut dst = fresh_node(2, 6);

        let (middle, moved) = move_half_to::<i64>(&mut src, &mut dst);

        // 4 children: left keeps 2, right takes 2, middle key = key_at(2).
        assert_eq!(middle, 40);
        assert_eq!(node::size(&src), 2);
        assert_eq!(node::size(&dst), 2);
        assert_eq!(moved, vec![PageId(12), PageId(13)]);
        assert_eq!(value_at::<i64>(&dst, 0), PageId(12));
        assert_eq!(key_at::<i64>(&dst, 1), 60);
    }

    #[test]
    fn test_internal_move_half_odd_gives_extra_right() {
        let mut src = build_node(1, 8, 10, &[(20, 11), (40, 12), (60, 13), (80, 14)]);
        let mut dst = fresh_node(2, 8);

        let (middle, moved) = move_half_to::<i64>(&mut src, &mut dst);

        assert_eq!(middle, 40);
        assert_eq!(node::size(&src), 2);
        assert_eq!(node::size(&dst), 3);
        assert_eq!(moved.len(), 3);
    }

    #[test]
    fn test_internal_move_all_to_folds_separator() {
        let mut left = build_node(1, 6, 10, &[(20, 11)]);
        let mut right = build_node(2, 6, 12, &[(60, 13)]);

        let moved = move_all_to::<i64>(&mut right, &mut left, &40);

        assert_eq!(node::size(&right), 0);
        assert_eq!(node::size(&left), 4);
        assert_eq!(moved, vec![PageId(12), PageId(13)]);
        // The separator replaced the dummy of the old right node.
        assert_eq!(key_at::<i64>(&left, 2), 40);
        assert_eq!(value_at::<i64>(&left, 2), PageId(12));
        assert_eq!(key_at::<i64>(&left, 3), 60);
    }

    #[test]
    fn test_internal_move_first_to_end_of() {
        let mut left = build_node(1, 6, 10, &[(20, 11)]);
        let mut right = build_node(2, 6, 12, &[(60, 13), (80, 14)]);

        // Separator 40 comes down; right's first child crosses to left.
        let child = move_first_to_end_of::<i64>(&mut right, &mut left, &40);

        assert_eq!(child, PageId(12));
        assert_eq!(node::size(&left), 3);
        assert_eq!(node::size(&right), 2);
        assert_eq!(key_at::<i64>(&left, 2), 40);
        assert_eq!(value_at::<i64>(&left, 2), PageId(12));
        // Right's new first real key is 80; 60 became its dummy.
        assert_eq!(value_at::<i64>(&right, 0), PageId(13));
        assert_eq!(key_at::<i64>(&right, 1), 80);
    }

    #[test]
    fn test_internal_move_last_to_front_of() {
        let mut left = build_node(1, 6, 10, &[(20, 11), (30, 12)]);
        let mut right = build_node(2, 6, 13, &[(60, 14)]);

        let child = move_last_to_front_of::<i64>(&mut left, &mut right, &40);

        assert_eq!(child, PageId(12));
        assert_eq!(node::size(&left), 2);
        assert_eq!(node::size(&right), 3);
        // Moved child leads, old separator is the first real key.
        assert_eq!(value_at::<i64>(&right, 0), PageId(12));
        assert_eq!(key_at::<i64>(&right, 1), 40);
        assert_eq!(value_at::<i64>(&right, 1), PageId(13));
        assert_eq!(key_at::<i64>(&right, 2), 60);
    }
}
