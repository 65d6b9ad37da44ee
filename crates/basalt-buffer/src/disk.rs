//! Disk manager for page-level file I/O.

use basalt_common::page::{PageId, PAGE_SIZE};
use basalt_common::{BasaltError, DiskManagerConfig, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Manages reading and writing fixed-size pages in a single data file.
///
/// Page ids form one namespace: `allocate_page` mints ids, `deallocate_page`
/// returns them to a free set for reuse. A page id is only re-minted after
/// deallocation.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// File handle and allocation state.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The paged data file.
    file: File,
    /// Number of pages the file has ever been extended to.
    num_pages: u32,
    /// Deallocated page ids available for reuse (LIFO).
    free_pages: Vec<PageId>,
}

impl DiskManager {
    /// Opens or creates the data file at the configured path.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                num_pages,
                free_pages: Vec::new(),
            }),
        })
    }

    /// Returns the path of the data file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if page_id.0 >= inner.num_pages {
            return Err(BasaltError::PageNotFound { page_id: page_id.0 });
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        if page_id.0 >= inner.num_pages {
            return Err(BasaltError::PageNotFound { page_id: page_id.0 });
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        Ok(())
    }

    /// Allocates a page id, reusing a deallocated id when one is available.
    ///
    /// A freshly minted id extends the file by one zeroed page.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        if let Some(page_id) = inner.free_pages.pop() {
            debug!(page_id = page_id.0, "reusing deallocated page");
            return Ok(page_id);
        }

        if inner.num_pages == u32::MAX - 1 {
            return Err(BasaltError::OutOfDiskPages);
        }

        let page_id = PageId(inner.num_pages);
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.num_pages = page_id.0 + 1;

        Ok(page_id)
    }

    /// Returns a page id to the free set for reuse.
    ///
    /// Deallocating an id that was never allocated, or twice, is a caller
    /// bug; the id would be handed out to two owners.
    pub fn deallocate_page(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if page_id.is_valid() && page_id.0 < inner.num_pages {
            debug_assert!(!inner.free_pages.contains(&page_id));
            inner.free_pages.push(page_id);
        }
    }

    /// Returns the number of pages the file has been extended to.
    ///
    /// Deallocated pages are still counted; the file never shrinks.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
