//! Page identifiers and type tags for Basalt storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB). Fixed at build time; every disk read, frame,
/// and tree node operates on buffers of exactly this length.
pub const PAGE_SIZE: usize = 4 * 1024;

/// Page id reserved for the header page that maps index names to root pages.
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Unique identifier for a page within the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID.
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Returns true if this is a valid page ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}

/// Page types in Basalt storage.
///
/// Every page carries its type in the first header byte so that generic code
/// can dispatch on the layout without outside context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated or zeroed page.
    Invalid = 0,
    /// The header page (page 0).
    Header = 1,
    /// B+ tree internal page.
    Internal = 2,
    /// B+ tree leaf page.
    Leaf = 3,
}

impl PageType {
    /// Decodes a page type from its byte tag. Unknown tags map to Invalid.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Header,
            2 => PageType::Internal,
            3 => PageType::Leaf,
            _ => PageType::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId(0).is_valid());
        assert!(PageId(12345).is_valid());
        assert!(!PageId::INVALID.is_valid());
    }

    #[test]
    fn test_header_page_id_is_zero() {
        assert_eq!(HEADER_PAGE_ID, PageId(0));
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(5).to_string(), "page:5");
        assert_eq!(PageId::INVALID.to_string(), "page:invalid");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId(1) < PageId(2));
        assert!(PageId(100) < PageId::INVALID);
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId(1));
        set.insert(PageId(2));
        set.insert(PageId(1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_type_repr() {
        assert_eq!(PageType::Invalid as u8, 0);
        assert_eq!(PageType::Header as u8, 1);
        assert_eq!(PageType::Internal as u8, 2);
        assert_eq!(PageType::Leaf as u8, 3);
    }

    #[test]
    fn test_page_type_round_trip() {
        for page_type in [
            PageType::Invalid,
            PageType::Header,
            PageType::Internal,
            PageType::Leaf,
        ] {
            assert_eq!(PageType::from_u8(page_type as u8), page_type);
        }
    }

    #[test]
    fn test_page_type_unknown_tag() {
        assert_eq!(PageType::from_u8(200), PageType::Invalid);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
