//! Forward iterator over the leaf chain.

use super::{leaf, node};
use crate::keys::{IndexKey, IndexValue};
use basalt_buffer::BufferPoolManager;
use basalt_common::page::PageId;
use basalt_common::Result;
use std::marker::PhantomData;
use std::sync::Arc;

/// Forward iterator yielding (key, value) pairs in ascending key order.
///
/// The iterator caches its position (current page id, index, page size) and
/// the next leaf's page id; each read re-fetches the current page and unpins
/// it again, so no pin or latch outlives a single call. Consistency under
/// concurrent writers is relaxed accordingly: the iterator observes each
/// leaf atomically but not the tree as a whole.
///
/// The end sentinel is an invalid current page id.
pub struct TreeIterator<K, V> {
    pool: Arc<BufferPoolManager>,
    current_page_id: PageId,
    next_page_id: PageId,
    index: usize,
    current_page_size: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> TreeIterator<K, V> {
    pub(crate) fn new(
        pool: Arc<BufferPoolManager>,
        current_page_id: PageId,
        next_page_id: PageId,
        index: usize,
        current_page_size: usize,
    ) -> Self {
        Self {
            pool,
            current_page_id,
            next_page_id,
            index,
            current_page_size,
            _marker: PhantomData,
        }
    }

    /// The past-the-end iterator.
    pub(crate) fn end(pool: Arc<BufferPoolManager>) -> Self {
        Self::new(pool, PageId::INVALID, PageId::INVALID, 0, 0)
    }

    /// Returns true once the iterator has moved past the last entry.
    pub fn is_end(&self) -> bool {
        !self.current_page_id.is_valid()
    }

    /// Reads the pair under the cursor, or None at the end.
    pub fn value(&self) -> Result<Option<(K, V)>> {
        if self.is_end() {
            return Ok(None);
        }

        let frame = self.pool.fetch_page(self.current_page_id)?;
        let guard = frame.latch_read();
        let item = if self.index < node::size(&guard[..]) {
            Some(leaf::item_at::<K, V>(&guard[..], self.index))
        } else {
            None
        };
        drop(guard);
        self.pool.unpin_page(self.current_page_id, false);

        Ok(item)
    }

    /// Advances the cursor one entry, hopping to the next leaf when the
    /// current one is exhausted.
    pub fn advance(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }

        self.index += 1;
        while self.index >= self.current_page_size {
            if !self.next_page_id.is_valid() {
                self.current_page_id = PageId::INVALID;
                return Ok(());
            }

            let next = self.next_page_id;
            let frame = self.pool.fetch_page(next)?;
            let guard = frame.latch_read();
            let size = node::size(&guard[..]);
            let following = node::next_page_id(&guard[..]);
            drop(guard);
            self.pool.unpin_page(next, false);

            self.current_page_id = next;
            self.next_page_id = following;
            self.index = 0;
            self.current_page_size = size;
        }
        Ok(())
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for TreeIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let item = self.value().ok().flatten();
        self.advance().ok()?;
        item
    }
}
