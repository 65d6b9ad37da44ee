//! The concurrent B+Tree.
//!
//! # Latch protocol
//!
//! Two latch kinds protect the tree: each frame's reader/writer latch, and
//! the pin count that keeps a frame resident. On top of those the tree keeps
//! a process-wide `op_latch` (shared for reads and inserts, exclusive for
//! removes) and a *pre-root page* whose frame latch serialises root-id
//! changes without blocking traversals below the root.
//!
//! - Point lookups crab downward holding at most two read latches (parent
//!   and child), releasing the parent as soon as the child is latched.
//! - Inserts crab downward with write latches. A node is safe when an
//!   insertion cannot split it (`size < max_size - 1`); once a safe child is
//!   latched every held ancestor is released. A split cascade therefore
//!   never reaches above the retained chain.
//! - Removes serialise against everything through the exclusive `op_latch`
//!   and descend with plain fetches.
//!
//! The held write latches form an explicit stack ([`LatchStack`]) whose drop
//! releases every latch and pin on every exit path.

use super::dot;
use super::{internal, leaf, node};
use crate::header::HeaderPage;
use crate::keys::{IndexKey, IndexValue, KeyComparator};
use basalt_buffer::BufferPoolManager;
use basalt_common::page::{PageId, HEADER_PAGE_ID, PAGE_SIZE};
use basalt_common::{BasaltError, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io::BufRead;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

type PageBuf = Box<[u8; PAGE_SIZE]>;

/// A page held with its write latch and pin.
struct WriteLatched<'a> {
    page_id: PageId,
    guard: RwLockWriteGuard<'a, PageBuf>,
    dirty: bool,
}

/// Ordered stack of write-latched pages, ancestors first.
///
/// Latches are acquired parent-before-child on the way down and released
/// child-last here; dropping the stack releases everything, so error paths
/// cannot leak a latch or a pin.
struct LatchStack<'a> {
    pool: &'a BufferPoolManager,
    held: Vec<WriteLatched<'a>>,
}

impl<'a> LatchStack<'a> {
    fn new(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            held: Vec::new(),
        }
    }

    fn push(&mut self, page_id: PageId, guard: RwLockWriteGuard<'a, PageBuf>) {
        self.held.push(WriteLatched {
            page_id,
            guard,
            dirty: false,
        });
    }

    fn len(&self) -> usize {
        self.held.len()
    }

    fn top(&self) -> &WriteLatched<'a> {
        self.held.last().expect("latch stack is empty")
    }

    fn top_mut(&mut self) -> &mut WriteLatched<'a> {
        self.held.last_mut().expect("latch stack is empty")
    }

    fn entry_mut(&mut self, index: usize) -> &mut WriteLatched<'a> {
        &mut self.held[index]
    }

    fn page_id_at(&self, index: usize) -> Option<PageId> {
        self.held.get(index).map(|e| e.page_id)
    }

    /// Releases every held latch, ancestors first, unpinning as it goes.
    fn release_all(&mut self) {
        let pool = self.pool;
        for entry in self.held.drain(..) {
            let WriteLatched {
                page_id,
                guard,
                dirty,
            } = entry;
            drop(guard);
            pool.unpin_page(page_id, dirty);
        }
    }
}

impl Drop for LatchStack<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// A freshly created page held outside the descent stack (a split sibling
/// or a new root). Released with its dirty bit set.
struct HeldPage<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    guard: RwLockWriteGuard<'a, PageBuf>,
}

impl HeldPage<'_> {
    fn release(self) {
        let HeldPage {
            pool,
            page_id,
            guard,
        } = self;
        drop(guard);
        pool.unpin_page(page_id, true);
    }
}

/// A page held with its read latch and pin, for read crabbing.
struct ReadLatched<'a> {
    page_id: PageId,
    guard: RwLockReadGuard<'a, PageBuf>,
}

/// Direction of a sibling search at one tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Unique-key B+Tree index stored one node per page.
pub struct BPlusTree<K, V, C> {
    index_name: String,
    pool: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: u16,
    internal_max_size: u16,
    /// Shared for reads and inserts, exclusive for removes.
    op_latch: RwLock<()>,
    /// Pinned for the tree's lifetime; its frame latch guards root changes.
    pre_root_page_id: PageId,
    root_page_id: AtomicU32,
    height: AtomicU32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
{
    /// Opens (or creates) the index named `index_name`.
    ///
    /// Bootstraps the header page when the file is empty and re-reads a
    /// previously published root id otherwise. Node fan-outs are given in
    /// entries per page and must fit the page size.
    pub fn open(
        index_name: &str,
        pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        if (leaf_max_size as usize) < 3 || leaf_max_size as usize > leaf::capacity::<K, V>() {
            return Err(BasaltError::InvalidParameter {
                name: "leaf_max_size".to_string(),
                value: leaf_max_size.to_string(),
            });
        }
        if (internal_max_size as usize) < 3 || internal_max_size as usize > internal::capacity::<K>()
        {
            return Err(BasaltError::InvalidParameter {
                name: "internal_max_size".to_string(),
                value: internal_max_size.to_string(),
            });
        }

        // Bootstrap page 0 on a fresh file.
        if pool.disk().num_pages() == 0 {
            let (page_id, frame) = pool.new_page()?;
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            {
                let mut guard = frame.latch_write();
                HeaderPage::init(&mut guard[..]);
            }
            pool.unpin_page(page_id, true);
        }

        let frame = pool.fetch_page(HEADER_PAGE_ID)?;
        let root = {
            let guard = frame.latch_read();
            HeaderPage::get_record(&guard[..], index_name)
        };
        pool.unpin_page(HEADER_PAGE_ID, false);
        let root = root.unwrap_or(PageId::INVALID);

        // The pre-root page stays pinned until the tree is dropped.
        let (pre_root_page_id, _pre_frame) = pool.new_page()?;

        let height = if root.is_valid() {
            Self::measure_height(&pool, root)?
        } else {
            0
        };

        Ok(Self {
            index_name: index_name.to_string(),
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            op_latch: RwLock::new(()),
            pre_root_page_id,
            root_page_id: AtomicU32::new(root.0),
            height: AtomicU32::new(height),
            _marker: PhantomData,
        })
    }

    fn measure_height(pool: &BufferPoolManager, root: PageId) -> Result<u32> {
        let mut height = 1;
        let mut current = root;
        loop {
            let frame = pool.fetch_page(current)?;
            let guard = frame.latch_read();
            let is_leaf = node::is_leaf(&guard[..]);
            let next = if is_leaf {
                PageId::INVALID
            } else {
                internal::value_at::<K>(&guard[..], 0)
            };
            drop(guard);
            pool.unpin_page(current, false);

            if is_leaf {
                return Ok(height);
            }
            height += 1;
            current = next;
        }
    }

    /// Name under which this index is registered in the header page.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Current root page id (invalid when empty).
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::Acquire))
    }

    /// Current tree height (0 when empty, 1 when the root is a leaf).
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    // =========================================================================
    // Search
    // =========================================================================

    fn read_fetch<'a>(&self, pool: &'a BufferPoolManager, page_id: PageId) -> Result<ReadLatched<'a>> {
        let frame = pool.fetch_page(page_id)?;
        Ok(ReadLatched {
            page_id,
            guard: frame.latch_read(),
        })
    }

    fn read_release(&self, pool: &BufferPoolManager, held: ReadLatched<'_>) {
        let ReadLatched { page_id, guard } = held;
        drop(guard);
        pool.unpin_page(page_id, false);
    }

    /// Point lookup. Crabs downward with read latches.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let _op = self.op_latch.read();
        let pool = self.pool.as_ref();

        let pre_root = self.read_fetch(pool, self.pre_root_page_id)?;
        if self.is_empty() {
            self.read_release(pool, pre_root);
            return Ok(None);
        }

        let mut current = match self.read_fetch(pool, self.root_page_id()) {
            Ok(held) => {
                self.read_release(pool, pre_root);
                held
            }
            Err(e) => {
                self.read_release(pool, pre_root);
                return Err(e);
            }
        };

        loop {
            if node::is_leaf(&current.guard[..]) {
                break;
            }
            let next = internal::lookup::<K, C>(&current.guard[..], key, &self.comparator);
            match self.read_fetch(pool, next) {
                Ok(child) => {
                    self.read_release(pool, current);
                    current = child;
                }
                Err(e) => {
                    self.read_release(pool, current);
                    return Err(e);
                }
            }
        }

        let result = leaf::lookup::<K, V, C>(&current.guard[..], key, &self.comparator);
        self.read_release(pool, current);
        Ok(result)
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a key/value pair. Returns false iff the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let _op = self.op_latch.read();
        let pool = self.pool.as_ref();

        let mut stack = LatchStack::new(pool);
        let pre_frame = pool.fetch_page(self.pre_root_page_id)?;
        stack.push(self.pre_root_page_id, pre_frame.latch_write());

        if self.is_empty() {
            self.start_new_tree(key, value)?;
            return Ok(true);
        }

        // Crab down with write latches, releasing ancestors at safe nodes.
        let mut current_id = self.root_page_id();
        loop {
            let frame = pool.fetch_page(current_id)?;
            let guard = frame.latch_write();

            let is_leaf = node::is_leaf(&guard[..]);
            // Safe for insert: one more entry cannot fill the node, so a
            // split cannot propagate past it (size < max_size - 1).
            let safe = node::size(&guard[..]) + 1 < node::max_size(&guard[..]);
            if safe {
                stack.release_all();
            }
            stack.push(current_id, guard);

            if is_leaf {
                break;
            }
            current_id = internal::lookup::<K, C>(&stack.top().guard[..], key, &self.comparator);
        }

        if leaf::lookup::<K, V, C>(&stack.top().guard[..], key, &self.comparator).is_some() {
            return Ok(false);
        }

        {
            let entry = stack.top_mut();
            leaf::insert::<K, V, C>(&mut entry.guard[..], key, value, &self.comparator);
            entry.dirty = true;
        }

        let full = {
            let top = stack.top();
            node::size(&top.guard[..]) == node::max_size(&top.guard[..])
        };
        if full {
            self.split_and_propagate(&mut stack)?;
        }

        Ok(true)
    }

    /// Creates the first leaf and publishes the root id. The pre-root write
    /// latch is held by the caller.
    fn start_new_tree(&self, key: &K, value: &V) -> Result<()> {
        let pool = self.pool.as_ref();
        let (root_id, frame) = pool.new_page()?;
        {
            let mut guard = frame.latch_write();
            leaf::init::<K, V>(&mut guard[..], root_id, PageId::INVALID, self.leaf_max_size);
            leaf::insert::<K, V, C>(&mut guard[..], key, value, &self.comparator);
        }
        pool.unpin_page(root_id, true);

        self.root_page_id.store(root_id.0, Ordering::Release);
        self.height.store(1, Ordering::Release);
        self.update_root_record()?;
        debug!(root = root_id.0, "started new tree");
        Ok(())
    }

    /// Splits the overfull leaf on top of the stack and walks the promoted
    /// key upward, splitting full ancestors as it goes. The cascade stays
    /// within the retained latch chain.
    fn split_and_propagate<'a>(&'a self, stack: &mut LatchStack<'a>) -> Result<()> {
        let mut node_idx = stack.len() - 1;
        let (mut promote, mut sibling) = self.split_leaf(stack, node_idx)?;

        loop {
            if node::is_root(&stack.entry_mut(node_idx).guard[..]) {
                return self.install_new_root(stack, node_idx, &promote, sibling);
            }

            // A splitting node was never safe, so its parent is retained
            // directly beneath it on the stack.
            let parent_idx = node_idx - 1;
            let old_id = stack.page_id_at(node_idx).expect("node on stack");
            let parent_id = stack.page_id_at(parent_idx).expect("parent on stack");

            {
                let entry = stack.entry_mut(parent_idx);
                internal::insert_node_after::<K>(
                    &mut entry.guard[..],
                    old_id,
                    &promote,
                    sibling.page_id,
                );
                entry.dirty = true;
            }
            node::set_parent_page_id(&mut sibling.guard[..], parent_id);
            sibling.release();

            let parent_full = {
                let entry = stack.entry_mut(parent_idx);
                node::size(&entry.guard[..]) == node::max_size(&entry.guard[..])
            };
            if !parent_full {
                return Ok(());
            }

            let (key, held) = self.split_internal(stack, parent_idx)?;
            promote = key;
            sibling = held;
            node_idx = parent_idx;
        }
    }

    /// Splits the leaf at `idx`, stitching the sibling chain. Returns the
    /// promoted key and the new right sibling, still latched.
    fn split_leaf<'a>(&'a self, stack: &mut LatchStack<'a>, idx: usize) -> Result<(K, HeldPage<'a>)> {
        let pool = self.pool.as_ref();
        let (sibling_id, sibling_frame) = pool.new_page()?;
        let mut sibling_guard = sibling_frame.latch_write();

        let entry = stack.entry_mut(idx);
        leaf::init::<K, V>(
            &mut sibling_guard[..],
            sibling_id,
            node::parent_page_id(&entry.guard[..]),
            self.leaf_max_size,
        );
        let promote = leaf::move_half_to::<K, V>(&mut entry.guard[..], &mut sibling_guard[..]);
        node::set_next_page_id(&mut sibling_guard[..], node::next_page_id(&entry.guard[..]));
        node::set_next_page_id(&mut entry.guard[..], sibling_id);
        entry.dirty = true;

        debug!(leaf = entry.page_id.0, sibling = sibling_id.0, "split leaf");
        Ok((
            promote,
            HeldPage {
                pool,
                page_id: sibling_id,
                guard: sibling_guard,
            },
        ))
    }

    /// Splits the full internal node at `idx`, reparenting the moved
    /// children through the buffer pool. Returns the promoted middle key and
    /// the new right sibling, still latched.
    fn split_internal<'a>(
        &'a self,
        stack: &mut LatchStack<'a>,
        idx: usize,
    ) -> Result<(K, HeldPage<'a>)> {
        let pool = self.pool.as_ref();
        let (sibling_id, sibling_frame) = pool.new_page()?;
        let mut sibling_guard = sibling_frame.latch_write();

        let (promote, moved) = {
            let entry = stack.entry_mut(idx);
            internal::init::<K>(
                &mut sibling_guard[..],
                sibling_id,
                node::parent_page_id(&entry.guard[..]),
                self.internal_max_size,
            );
            let result = internal::move_half_to::<K>(&mut entry.guard[..], &mut sibling_guard[..]);
            entry.dirty = true;
            result
        };

        // Children that crossed to the sibling need their parent pointer
        // rewritten. The descent child one level below may be among them and
        // is already write-latched on the stack; everyone else is fetched.
        let path_child_id = stack.page_id_at(idx + 1);
        for child_id in moved {
            if Some(child_id) == path_child_id {
                let entry = stack.entry_mut(idx + 1);
                node::set_parent_page_id(&mut entry.guard[..], sibling_id);
                entry.dirty = true;
                continue;
            }
            match pool.fetch_page(child_id) {
                Ok(frame) => {
                    let mut guard = frame.latch_write();
                    node::set_parent_page_id(&mut guard[..], sibling_id);
                    drop(guard);
                    pool.unpin_page(child_id, true);
                }
                Err(e) => {
                    drop(sibling_guard);
                    pool.unpin_page(sibling_id, true);
                    return Err(e);
                }
            }
        }

        let split_id = stack.page_id_at(idx).unwrap_or(PageId::INVALID);
        debug!(node = split_id.0, sibling = sibling_id.0, "split internal node");
        Ok((
            promote,
            HeldPage {
                pool,
                page_id: sibling_id,
                guard: sibling_guard,
            },
        ))
    }

    /// The root split: hoist a fresh internal root above both halves. The
    /// pre-root write latch is retained on the stack, so the root id change
    /// is serialised.
    fn install_new_root<'a>(
        &'a self,
        stack: &mut LatchStack<'a>,
        node_idx: usize,
        key: &K,
        sibling: HeldPage<'a>,
    ) -> Result<()> {
        let pool = self.pool.as_ref();
        let (root_id, frame) = match pool.new_page() {
            Ok(pair) => pair,
            Err(e) => {
                sibling.release();
                return Err(e);
            }
        };

        let old_id = stack.page_id_at(node_idx).expect("split node on stack");
        let mut root_guard = frame.latch_write();
        internal::init::<K>(&mut root_guard[..], root_id, PageId::INVALID, self.internal_max_size);
        internal::populate_new_root::<K>(&mut root_guard[..], old_id, key, sibling.page_id);
        drop(root_guard);

        {
            let entry = stack.entry_mut(node_idx);
            node::set_parent_page_id(&mut entry.guard[..], root_id);
            entry.dirty = true;
        }
        let mut sibling = sibling;
        node::set_parent_page_id(&mut sibling.guard[..], root_id);
        sibling.release();
        pool.unpin_page(root_id, true);

        self.root_page_id.store(root_id.0, Ordering::Release);
        self.height.fetch_add(1, Ordering::AcqRel);
        self.update_root_record()?;
        debug!(root = root_id.0, height = self.height(), "installed new root");
        Ok(())
    }

    /// Publishes the current root id in the header page: an insert the first
    /// time, an update thereafter.
    fn update_root_record(&self) -> Result<()> {
        let pool = self.pool.as_ref();
        let frame = pool.fetch_page(HEADER_PAGE_ID)?;
        let result = {
            let mut guard = frame.latch_write();
            let data = &mut guard[..];
            let root = self.root_page_id();
            if HeaderPage::get_record(data, &self.index_name).is_some() {
                HeaderPage::update_record(data, &self.index_name, root)
            } else {
                HeaderPage::insert_record(data, &self.index_name, root)
            }
        };
        pool.unpin_page(HEADER_PAGE_ID, true);
        result
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes a key if present. Underflow is repaired by redistribution or
    /// coalescing; an emptied tree clears its root id.
    ///
    /// Removal holds the tree-wide exclusive latch, serialising against all
    /// other operations.
    pub fn remove(&self, key: &K) -> Result<()> {
        let _op = self.op_latch.write();
        if self.is_empty() {
            return Ok(());
        }
        let pool = self.pool.as_ref();

        let leaf_id = self.find_leaf_exclusive(key)?;
        let frame = pool.fetch_page(leaf_id)?;
        let (found, size, is_root) = {
            let mut guard = frame.latch_write();
            let found = leaf::remove::<K, V, C>(&mut guard[..], key, &self.comparator).is_some();
            (
                found,
                node::size(&guard[..]),
                node::is_root(&guard[..]),
            )
        };
        pool.unpin_page(leaf_id, found);

        if !found {
            return Ok(());
        }

        if is_root {
            if size == 0 {
                self.adjust_root(leaf_id)?;
            }
        } else if size < self.leaf_min_size() {
            self.coalesce_or_redistribute(leaf_id)?;
        }
        Ok(())
    }

    #[inline]
    fn leaf_min_size(&self) -> usize {
        self.leaf_max_size as usize / 2
    }

    #[inline]
    fn internal_min_size(&self) -> usize {
        (self.internal_max_size as usize + 1) / 2
    }

    /// Descends to the leaf that would hold `key`, without latching. Only
    /// called under the exclusive op latch.
    fn find_leaf_exclusive(&self, key: &K) -> Result<PageId> {
        let pool = self.pool.as_ref();
        let mut current = self.root_page_id();
        loop {
            let frame = pool.fetch_page(current)?;
            let guard = frame.latch_read();
            if node::is_leaf(&guard[..]) {
                drop(guard);
                pool.unpin_page(current, false);
                return Ok(current);
            }
            let next = internal::lookup::<K, C>(&guard[..], key, &self.comparator);
            drop(guard);
            pool.unpin_page(current, false);
            current = next;
        }
    }

    /// Reads (is_leaf, size, parent) off a node and unpins it.
    fn peek_node(&self, page_id: PageId) -> Result<(bool, usize, PageId)> {
        let pool = self.pool.as_ref();
        let frame = pool.fetch_page(page_id)?;
        let guard = frame.latch_read();
        let info = (
            node::is_leaf(&guard[..]),
            node::size(&guard[..]),
            node::parent_page_id(&guard[..]),
        );
        drop(guard);
        pool.unpin_page(page_id, false);
        Ok(info)
    }

    /// Climbs from `page_id` to the nearest ancestor where the chain is not
    /// on the `side` boundary: the branch layer holding the separator
    /// between `page_id`'s subtree and its `side` neighbor.
    ///
    /// Returns (branch page id, separator index, levels climbed), or None
    /// when the node is on the tree's `side` edge.
    fn branch_layer(&self, page_id: PageId, side: Side) -> Result<Option<(PageId, usize, u32)>> {
        let pool = self.pool.as_ref();
        let mut current = page_id;
        let mut steps = 0u32;

        loop {
            let (_, _, parent) = self.peek_node(current)?;
            if !parent.is_valid() {
                return Ok(None);
            }

            let frame = pool.fetch_page(parent)?;
            let guard = frame.latch_read();
            let parent_size = node::size(&guard[..]);
            let pos = internal::value_index::<K>(&guard[..], current).ok_or_else(|| {
                BasaltError::TreeCorrupted(format!(
                    "{} missing from its parent {}",
                    current, parent
                ))
            })?;
            drop(guard);
            pool.unpin_page(parent, false);

            match side {
                Side::Right if pos + 1 < parent_size => {
                    return Ok(Some((parent, pos + 1, steps)));
                }
                Side::Left if pos > 0 => {
                    return Ok(Some((parent, pos, steps)));
                }
                _ => {}
            }

            current = parent;
            steps += 1;
        }
    }

    /// Finds the same-level neighbor of `page_id` on the given side via the
    /// branch layer, descending the inner spine back down.
    fn sibling(&self, page_id: PageId, side: Side) -> Result<Option<PageId>> {
        let pool = self.pool.as_ref();
        let Some((branch, sep_index, steps)) = self.branch_layer(page_id, side)? else {
            return Ok(None);
        };

        let frame = pool.fetch_page(branch)?;
        let guard = frame.latch_read();
        let mut current = match side {
            Side::Right => internal::value_at::<K>(&guard[..], sep_index),
            Side::Left => internal::value_at::<K>(&guard[..], sep_index - 1),
        };
        drop(guard);
        pool.unpin_page(branch, false);

        for _ in 0..steps {
            let frame = pool.fetch_page(current)?;
            let guard = frame.latch_read();
            let size = node::size(&guard[..]);
            let next = match side {
                Side::Right => internal::value_at::<K>(&guard[..], 0),
                Side::Left => internal::value_at::<K>(&guard[..], size - 1),
            };
            drop(guard);
            pool.unpin_page(current, false);
            current = next;
        }

        Ok(Some(current))
    }

    /// Repairs an underflowing node: borrow one entry from a sibling when
    /// the pair can spare it, merge otherwise. Merging recurses upward.
    fn coalesce_or_redistribute(&self, page_id: PageId) -> Result<()> {
        let (is_leaf, size, parent) = self.peek_node(page_id)?;

        if !parent.is_valid() {
            let needs_adjust = if is_leaf { size == 0 } else { size <= 1 };
            if needs_adjust {
                self.adjust_root(page_id)?;
            }
            return Ok(());
        }

        let min = if is_leaf {
            self.leaf_min_size()
        } else {
            self.internal_min_size()
        };
        if size >= min {
            return Ok(());
        }
        let max = if is_leaf {
            self.leaf_max_size as usize
        } else {
            self.internal_max_size as usize
        };

        // Prefer the right sibling (for leaves, the next pointer names it);
        // fall back to the left one on the tree's right edge.
        let right_sibling = if is_leaf {
            let pool = self.pool.as_ref();
            let frame = pool.fetch_page(page_id)?;
            let guard = frame.latch_read();
            let next = node::next_page_id(&guard[..]);
            drop(guard);
            pool.unpin_page(page_id, false);
            if next.is_valid() {
                Some(next)
            } else {
                None
            }
        } else {
            self.sibling(page_id, Side::Right)?
        };

        if let Some(right_id) = right_sibling {
            let (branch, sep_index, _) = self.branch_layer(page_id, Side::Right)?.ok_or_else(|| {
                BasaltError::TreeCorrupted(format!("{} has a right sibling but no branch layer", page_id))
            })?;
            let (_, right_size, _) = self.peek_node(right_id)?;
            if size + right_size >= max {
                self.redistribute(page_id, right_id, branch, sep_index, Side::Left, is_leaf)
            } else {
                self.coalesce(page_id, right_id, is_leaf)
            }
        } else {
            let left_id = self.sibling(page_id, Side::Left)?.ok_or_else(|| {
                BasaltError::TreeCorrupted(format!("underflowing node {} has no sibling", page_id))
            })?;
            let (branch, sep_index, _) = self.branch_layer(page_id, Side::Left)?.ok_or_else(|| {
                BasaltError::TreeCorrupted(format!("{} has a left sibling but no branch layer", page_id))
            })?;
            let (_, left_size, _) = self.peek_node(left_id)?;
            if size + left_size >= max {
                self.redistribute(left_id, page_id, branch, sep_index, Side::Right, is_leaf)
            } else {
                self.coalesce(left_id, page_id, is_leaf)
            }
        }
    }

    /// Moves one entry across the boundary between `left_id` and `right_id`.
    /// `underflow` names the side that receives. The separator in the branch
    /// node becomes the right side's new first key.
    fn redistribute(
        &self,
        left_id: PageId,
        right_id: PageId,
        branch: PageId,
        sep_index: usize,
        underflow: Side,
        is_leaf: bool,
    ) -> Result<()> {
        let pool = self.pool.as_ref();

        let old_sep: K = {
            let frame = pool.fetch_page(branch)?;
            let guard = frame.latch_read();
            let key = internal::key_at::<K>(&guard[..], sep_index);
            drop(guard);
            pool.unpin_page(branch, false);
            key
        };

        let left_frame = pool.fetch_page(left_id)?;
        let right_frame = match pool.fetch_page(right_id) {
            Ok(frame) => frame,
            Err(e) => {
                pool.unpin_page(left_id, false);
                return Err(e);
            }
        };

        let (new_sep, moved_child) = {
            let mut left_guard = left_frame.latch_write();
            let mut right_guard = right_frame.latch_write();

            if is_leaf {
                match underflow {
                    Side::Left => {
                        leaf::move_first_to_end_of::<K, V>(&mut right_guard[..], &mut left_guard[..])
                    }
                    Side::Right => {
                        leaf::move_last_to_front_of::<K, V>(&mut left_guard[..], &mut right_guard[..])
                    }
                }
                (leaf::key_at::<K, V>(&right_guard[..], 0), None)
            } else {
                match underflow {
                    Side::Left => {
                        let new_sep = internal::key_at::<K>(&right_guard[..], 1);
                        let child = internal::move_first_to_end_of::<K>(
                            &mut right_guard[..],
                            &mut left_guard[..],
                            &old_sep,
                        );
                        (new_sep, Some((child, left_id)))
                    }
                    Side::Right => {
                        let left_size = node::size(&left_guard[..]);
                        let new_sep = internal::key_at::<K>(&left_guard[..], left_size - 1);
                        let child = internal::move_last_to_front_of::<K>(
                            &mut left_guard[..],
                            &mut right_guard[..],
                            &old_sep,
                        );
                        (new_sep, Some((child, right_id)))
                    }
                }
            }
        };
        pool.unpin_page(left_id, true);
        pool.unpin_page(right_id, true);

        if let Some((child_id, new_parent)) = moved_child {
            let frame = pool.fetch_page(child_id)?;
            let mut guard = frame.latch_write();
            node::set_parent_page_id(&mut guard[..], new_parent);
            drop(guard);
            pool.unpin_page(child_id, true);
        }

        let frame = pool.fetch_page(branch)?;
        let mut guard = frame.latch_write();
        internal::set_key_at::<K>(&mut guard[..], sep_index, &new_sep);
        drop(guard);
        pool.unpin_page(branch, true);

        debug!(left = left_id.0, right = right_id.0, "redistributed entries");
        Ok(())
    }

    /// Merges `right_id` into `left_id`, deletes the right page, removes the
    /// right node's slot from its parent, and recurses on that parent.
    fn coalesce(&self, left_id: PageId, right_id: PageId, is_leaf: bool) -> Result<()> {
        let pool = self.pool.as_ref();

        // Climb from the right node to the nearest common ancestor holding
        // the separator; record the right node's direct parent on the way.
        let mut current = right_id;
        let mut direct_parent = PageId::INVALID;
        let mut direct_pos = usize::MAX;
        let (nca_id, nca_pos) = loop {
            let (_, _, parent) = self.peek_node(current)?;
            if !parent.is_valid() {
                return Err(BasaltError::TreeCorrupted(format!(
                    "merge target {} reached the root while climbing",
                    right_id
                )));
            }
            let frame = pool.fetch_page(parent)?;
            let guard = frame.latch_read();
            let pos = internal::value_index::<K>(&guard[..], current).ok_or_else(|| {
                BasaltError::TreeCorrupted(format!("{} missing from its parent {}", current, parent))
            })?;
            drop(guard);
            pool.unpin_page(parent, false);

            if !direct_parent.is_valid() {
                direct_parent = parent;
                direct_pos = pos;
            }
            if pos != 0 {
                break (parent, pos);
            }
            current = parent;
        };

        let separator: K = {
            let frame = pool.fetch_page(nca_id)?;
            let guard = frame.latch_read();
            let key = internal::key_at::<K>(&guard[..], nca_pos);
            drop(guard);
            pool.unpin_page(nca_id, false);
            key
        };

        // Move everything right-to-left.
        let moved_children = {
            let left_frame = pool.fetch_page(left_id)?;
            let right_frame = match pool.fetch_page(right_id) {
                Ok(frame) => frame,
                Err(e) => {
                    pool.unpin_page(left_id, false);
                    return Err(e);
                }
            };
            let mut left_guard = left_frame.latch_write();
            let mut right_guard = right_frame.latch_write();

            let moved = if is_leaf {
                leaf::move_all_to::<K, V>(&mut right_guard[..], &mut left_guard[..]);
                Vec::new()
            } else {
                internal::move_all_to::<K>(&mut right_guard[..], &mut left_guard[..], &separator)
            };
            drop(left_guard);
            drop(right_guard);
            pool.unpin_page(left_id, true);
            pool.unpin_page(right_id, true);
            moved
        };

        for child_id in moved_children {
            let frame = pool.fetch_page(child_id)?;
            let mut guard = frame.latch_write();
            node::set_parent_page_id(&mut guard[..], left_id);
            drop(guard);
            pool.unpin_page(child_id, true);
        }

        // Drop the right node's slot. When the two nodes were cousins the
        // direct parent's first real key moves up to replace the separator
        // in the common ancestor.
        if direct_parent == nca_id {
            let frame = pool.fetch_page(nca_id)?;
            let mut guard = frame.latch_write();
            internal::remove_at::<K>(&mut guard[..], nca_pos);
            drop(guard);
            pool.unpin_page(nca_id, true);
        } else {
            debug_assert_eq!(direct_pos, 0);
            let promoted: K = {
                let frame = pool.fetch_page(direct_parent)?;
                let mut guard = frame.latch_write();
                let key = internal::key_at::<K>(&guard[..], 1);
                internal::remove_at::<K>(&mut guard[..], 0);
                drop(guard);
                pool.unpin_page(direct_parent, true);
                key
            };
            let frame = pool.fetch_page(nca_id)?;
            let mut guard = frame.latch_write();
            internal::set_key_at::<K>(&mut guard[..], nca_pos, &promoted);
            drop(guard);
            pool.unpin_page(nca_id, true);
        }

        let deleted = pool.delete_page(right_id)?;
        debug_assert!(deleted, "merged page must be unpinned");
        debug!(left = left_id.0, right = right_id.0, "coalesced nodes");

        self.coalesce_or_redistribute(direct_parent)
    }

    /// Shrinks the root: an empty leaf root empties the tree, an internal
    /// root with a single child hands the root to that child.
    fn adjust_root(&self, root_id: PageId) -> Result<()> {
        let pool = self.pool.as_ref();
        let frame = pool.fetch_page(root_id)?;
        let guard = frame.latch_read();
        let is_leaf = node::is_leaf(&guard[..]);
        let size = node::size(&guard[..]);
        let only_child = if !is_leaf && size == 1 {
            Some(internal::value_at::<K>(&guard[..], 0))
        } else {
            None
        };
        drop(guard);
        pool.unpin_page(root_id, false);

        if is_leaf && size == 0 {
            let deleted = pool.delete_page(root_id)?;
            debug_assert!(deleted);
            self.root_page_id.store(PageId::INVALID.0, Ordering::Release);
            self.height.store(0, Ordering::Release);
            self.update_root_record()?;
            debug!("tree emptied");
        } else if let Some(child) = only_child {
            let deleted = pool.delete_page(root_id)?;
            debug_assert!(deleted);

            let frame = pool.fetch_page(child)?;
            let mut guard = frame.latch_write();
            node::set_parent_page_id(&mut guard[..], PageId::INVALID);
            drop(guard);
            pool.unpin_page(child, true);

            self.root_page_id.store(child.0, Ordering::Release);
            self.height.fetch_sub(1, Ordering::AcqRel);
            self.update_root_record()?;
            debug!(root = child.0, height = self.height(), "collapsed root");
        }
        Ok(())
    }

    // =========================================================================
    // Iterators
    // =========================================================================

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<super::TreeIterator<K, V>> {
        self.make_iterator(None)
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<super::TreeIterator<K, V>> {
        self.make_iterator(Some(key))
    }

    /// The past-the-end iterator.
    pub fn end(&self) -> super::TreeIterator<K, V> {
        super::TreeIterator::end(self.pool.clone())
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<super::TreeIterator<K, V>> {
        let _op = self.op_latch.read();
        let pool = self.pool.as_ref();

        let pre_root = self.read_fetch(pool, self.pre_root_page_id)?;
        if self.is_empty() {
            self.read_release(pool, pre_root);
            return Ok(super::TreeIterator::end(self.pool.clone()));
        }

        let mut current = match self.read_fetch(pool, self.root_page_id()) {
            Ok(held) => {
                self.read_release(pool, pre_root);
                held
            }
            Err(e) => {
                self.read_release(pool, pre_root);
                return Err(e);
            }
        };

        loop {
            if node::is_leaf(&current.guard[..]) {
                break;
            }
            let next = match key {
                Some(key) => internal::lookup::<K, C>(&current.guard[..], key, &self.comparator),
                None => internal::value_at::<K>(&current.guard[..], 0),
            };
            match self.read_fetch(pool, next) {
                Ok(child) => {
                    self.read_release(pool, current);
                    current = child;
                }
                Err(e) => {
                    self.read_release(pool, current);
                    return Err(e);
                }
            }
        }

        let mut page_id = current.page_id;
        let mut size = node::size(&current.guard[..]);
        let mut next = node::next_page_id(&current.guard[..]);
        let index = match key {
            Some(key) => leaf::key_index::<K, V, C>(&current.guard[..], key, &self.comparator),
            None => Some(0),
        };
        self.read_release(pool, current);

        // Every key in this leaf is smaller than the target: the iterator
        // starts at the following leaf, or at the end.
        let index = match index {
            Some(index) => index,
            None => {
                if !next.is_valid() {
                    return Ok(super::TreeIterator::end(self.pool.clone()));
                }
                let held = self.read_fetch(pool, next)?;
                page_id = held.page_id;
                size = node::size(&held.guard[..]);
                next = node::next_page_id(&held.guard[..]);
                self.read_release(pool, held);
                0
            }
        };

        Ok(super::TreeIterator::new(
            self.pool.clone(),
            page_id,
            next,
            index,
            size,
        ))
    }

    // =========================================================================
    // Bulk file loaders and debug surface
    // =========================================================================

    /// Inserts one integer key per line from `path`; the value mirrors the
    /// key.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<()>
    where
        K: From<i64>,
        V: From<i64>,
    {
        let file = std::fs::File::open(path)?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            let key: i64 = token
                .parse()
                .map_err(|_| BasaltError::KeyParse(token.to_string()))?;
            self.insert(&K::from(key), &V::from(key))?;
        }
        Ok(())
    }

    /// Removes one integer key per line from `path`.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<()>
    where
        K: From<i64>,
    {
        let file = std::fs::File::open(path)?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            let key: i64 = token
                .parse()
                .map_err(|_| BasaltError::KeyParse(token.to_string()))?;
            self.remove(&K::from(key))?;
        }
        Ok(())
    }

    /// Renders the tree as a Graphviz document.
    pub fn to_dot(&self) -> Result<String> {
        let _op = self.op_latch.read();
        let mut out = String::from("digraph G {\n");
        if !self.is_empty() {
            dot::render::<K, V>(self.pool.as_ref(), self.root_page_id(), &mut out)?;
        }
        out.push_str("}\n");
        Ok(out)
    }
}

impl<K, V, C> Drop for BPlusTree<K, V, C> {
    fn drop(&mut self) {
        // Release the lifetime pin on the pre-root scratch page and hand its
        // id back to the disk manager.
        self.pool.unpin_page(self.pre_root_page_id, false);
        let _ = self.pool.delete_page(self.pre_root_page_id);
    }
}
