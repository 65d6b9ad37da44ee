//! Header page: the persistent mapping from index names to root page ids.
//!
//! Page 0 is reserved for this table. Each record is a fixed-width cell:
//! a NUL-padded name (32 bytes) followed by the root page id (4 bytes).
//!
//! Layout:
//! ```text
//! +------------------------+ 0
//! | page_type: u8          |
//! | pad: u8                |
//! | record_count: u16      |
//! | pad: [u8; 4]           |
//! +------------------------+ 8
//! | record 0 (36 bytes)    |
//! | record 1 (36 bytes)    |
//! | ...                    |
//! +------------------------+
//! ```

use basalt_common::page::{PageId, PageType};
use basalt_common::{BasaltError, Result, PAGE_SIZE};
use bytes::{Buf, BufMut};

/// Maximum length of an index name, in bytes.
pub const MAX_NAME_LEN: usize = 32;

const RECORD_SIZE: usize = MAX_NAME_LEN + 4;
const RECORDS_OFFSET: usize = 8;

/// Static view over the header page's bytes.
pub struct HeaderPage;

impl HeaderPage {
    /// Maximum number of records the header page can hold.
    pub const CAPACITY: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

    /// Initializes a zeroed page as an empty header page.
    pub fn init(data: &mut [u8]) {
        data.fill(0);
        data[0] = PageType::Header as u8;
    }

    /// Returns true if the page carries the header tag.
    pub fn is_header(data: &[u8]) -> bool {
        PageType::from_u8(data[0]) == PageType::Header
    }

    /// Returns the number of records stored. Clamped to the page capacity so
    /// a corrupt count cannot index past the page.
    pub fn record_count(data: &[u8]) -> usize {
        (u16::from_le_bytes([data[2], data[3]]) as usize).min(Self::CAPACITY)
    }

    fn set_record_count(data: &mut [u8], count: usize) {
        data[2..4].copy_from_slice(&(count as u16).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(data: &[u8], index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let name = &data[offset..offset + MAX_NAME_LEN];
        let len = name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        &name[..len]
    }

    fn find(data: &[u8], name: &str) -> Option<usize> {
        (0..Self::record_count(data)).find(|&i| Self::name_at(data, i) == name.as_bytes())
    }

    /// Looks up the root page id registered under `name`.
    pub fn get_record(data: &[u8], name: &str) -> Option<PageId> {
        let index = Self::find(data, name)?;
        let offset = Self::record_offset(index) + MAX_NAME_LEN;
        let mut buf = &data[offset..offset + 4];
        Some(PageId(buf.get_u32_le()))
    }

    /// Registers a new (name, root page id) record.
    ///
    /// Fails if the name is already registered, too long, or the page is
    /// full.
    pub fn insert_record(data: &mut [u8], name: &str, root_page_id: PageId) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(BasaltError::InvalidParameter {
                name: "index_name".to_string(),
                value: name.to_string(),
            });
        }
        if Self::find(data, name).is_some() {
            return Err(BasaltError::InvalidParameter {
                name: "index_name".to_string(),
                value: format!("{} (already registered)", name),
            });
        }

        let count = Self::record_count(data);
        if count >= Self::CAPACITY {
            return Err(BasaltError::HeaderPageFull);
        }

        let offset = Self::record_offset(count);
        let mut buf = &mut data[offset..offset + RECORD_SIZE];
        buf.put_slice(name.as_bytes());
        buf.put_bytes(0, MAX_NAME_LEN - name.len());
        buf.put_u32_le(root_page_id.0);

        Self::set_record_count(data, count + 1);
        Ok(())
    }

    /// Updates the root page id of an existing record.
    pub fn update_record(data: &mut [u8], name: &str, root_page_id: PageId) -> Result<()> {
        let index = Self::find(data, name)
            .ok_or_else(|| BasaltError::IndexNotFound(name.to_string()))?;
        let offset = Self::record_offset(index) + MAX_NAME_LEN;
        data[offset..offset + 4].copy_from_slice(&root_page_id.0.to_le_bytes());
        Ok(())
    }
}
