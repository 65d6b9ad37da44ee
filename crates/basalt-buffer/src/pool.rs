//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{Frame, FrameId};
use crate::log::LogManager;
use crate::replacer::{ClockReplacer, Replacer};
use basalt_common::page::{PageId, PAGE_SIZE};
use basalt_common::{BasaltError, BufferPoolConfig, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Buffer pool manager.
///
/// Owns a fixed array of page frames and mediates all page access:
/// - Page table mapping resident page ids to frames
/// - Free list of frames holding no page
/// - Clock replacement for victim selection
/// - Pin counting to keep in-use frames resident
///
/// A single mutex guards the page table, the free list, and all frame
/// metadata transitions. Disk I/O happens inside the critical section;
/// the invariants below hold under any number of concurrent callers:
///
/// 1. Every frame is either on the free list or referenced by exactly one
///    page-table entry.
/// 2. A non-zero pin count implies the frame is not in the replacer's
///    evictable set.
/// 3. A dirty victim is written back before its frame is reused.
pub struct BufferPoolManager {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Frame eviction policy.
    replacer: ClockReplacer,
    /// Page I/O.
    disk: Arc<DiskManager>,
    /// Opaque logging collaborator; unused by the core.
    #[allow(dead_code)]
    log: Option<Arc<LogManager>>,
    /// Page table and free list.
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Maps resident page ids to the frames holding them.
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no page, handed out FIFO.
    free_list: VecDeque<FrameId>,
}

impl BufferPoolManager {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(
        config: BufferPoolConfig,
        disk: Arc<DiskManager>,
        log: Option<Arc<LogManager>>,
    ) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();

        // All frames start on the free list.
        let free_list: VecDeque<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            replacer: ClockReplacer::new(num_frames),
            disk,
            log,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
            }),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM, with a
    /// floor of 1,000 frames.
    pub fn auto_sized(disk: Arc<DiskManager>, log: Option<Arc<LogManager>>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames }, disk, log)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Returns the number of pages currently resident.
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    /// Returns the number of evictable frames.
    pub fn replacer_size(&self) -> usize {
        self.replacer.size()
    }

    /// Checks whether a page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Returns the disk manager backing this pool.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Acquires a destination frame: free list first, replacer victim second.
    ///
    /// A dirty victim is written back before its frame is handed out. The
    /// returned frame is reset, off the free list, out of the page table, and
    /// not in the replacer.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(BasaltError::BufferPoolFull)?;
        let frame = &self.frames[frame_id.0 as usize];
        debug_assert_eq!(frame.pin_count(), 0, "victim frame must be unpinned");

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.latch_read();
                if let Err(e) = self.disk.write_page(old_page_id, &data) {
                    drop(data);
                    // Write-back failed: put the victim back so its contents
                    // are not lost.
                    self.replacer.unpin(frame_id);
                    return Err(e);
                }
                debug!(page_id = old_page_id.0, frame_id = frame_id.0, "evicted dirty page");
            }
            inner.page_table.remove(&old_page_id);
        }

        frame.reset();
        Ok(frame_id)
    }

    /// Fetches a page, pinning it.
    ///
    /// If the page is not resident it is read from disk into a frame taken
    /// from the free list or evicted from the replacer. Fails with
    /// `BufferPoolFull` iff every frame is pinned and the free list is empty.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.pin_count() == 0 {
                self.replacer.pin(frame_id);
            }
            frame.pin();
            return Ok(frame);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];

        let data = match self.disk.read_page(page_id) {
            Ok(data) => data,
            Err(e) => {
                inner.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        frame.copy_from(&data);
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Allocates a fresh page and pins a zeroed frame for it.
    ///
    /// The destination frame is acquired before the page id is minted, so an
    /// out-of-frames failure never leaks a disk page.
    pub fn new_page(&self) -> Result<(PageId, &Frame)> {
        let mut inner = self.inner.lock();

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id.0 as usize];

        let page_id = match self.disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                inner.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);

        Ok((page_id, frame))
    }

    /// Unpins a page, optionally marking it dirty.
    ///
    /// The dirty flag is OR-ed in: a clean unpin never clears a dirty frame.
    /// When the pin count reaches zero the frame becomes evictable. Unpinning
    /// a non-resident page is vacuously successful.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            if frame.pin_count() > 0 && frame.unpin() == 0 {
                self.replacer.unpin(frame_id);
            }
        }

        true
    }

    /// Writes a resident page to disk and clears its dirty flag.
    ///
    /// Flush ignores pin state. Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            let data = frame.latch_read();
            self.disk.write_page(page_id, &data)?;
            drop(data);
            frame.set_dirty(false);
            return Ok(true);
        }
        Ok(false)
    }

    /// Flushes every dirty resident page. Returns the number flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let mut flushed = 0;

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.latch_read();
                self.disk.write_page(page_id, &data)?;
                drop(data);
                frame.set_dirty(false);
                flushed += 1;
            }
        }

        debug!(flushed, "flushed dirty pages");
        Ok(flushed)
    }

    /// Deletes a page, deallocating its id on disk.
    ///
    /// Returns false if the page is resident and pinned. A non-resident page
    /// is deallocated directly. A resident unpinned page makes one state
    /// transition: out of the page table and the replacer, frame reset, onto
    /// the free list.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();

        match inner.page_table.get(&page_id) {
            None => {
                self.disk.deallocate_page(page_id);
                Ok(true)
            }
            Some(&frame_id) => {
                let frame = &self.frames[frame_id.0 as usize];
                if frame.is_pinned() {
                    return Ok(false);
                }

                inner.page_table.remove(&page_id);
                self.replacer.pin(frame_id);
                frame.reset();
                inner.free_list.push_back(frame_id);
                self.disk.deallocate_page(page_id);
                debug!(page_id = page_id.0, frame_id = frame_id.0, "deleted page");
                Ok(true)
            }
        }
    }

    /// Fetches a page behind an RAII read guard that unpins on drop.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Fetches a page behind an RAII write guard that unpins on drop.
    pub fn write_page(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for &frame_id in inner.page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: inner.free_list.len(),
            used_frames: inner.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames holding pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII guard for reading a page; unpins clean on drop.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a Frame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latches and returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.latch_read()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page; unpins with the frame's dirty flag on drop.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a Frame,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latches and returns mutable page data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.latch_write()
    }

    /// Marks the page as dirty.
    pub fn set_dirty(&self) {
        self.frame.set_dirty(true);
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.frame.is_dirty());
    }
}
