//! Error types for Basalt.

use thiserror::Error;

/// Result type alias using BasaltError.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Errors that can occur in Basalt operations.
#[derive(Debug, Error)]
pub enum BasaltError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Disk manager errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Disk page space exhausted")]
    OutOfDiskPages,

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // B+ tree errors
    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("Index not found in header page: {0}")]
    IndexNotFound(String),

    #[error("Header page full, unable to register index")]
    HeaderPageFull,

    #[error("Key parse error: {0}")]
    KeyParse(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: BasaltError = io_err.into();
        assert!(matches!(err, BasaltError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_not_found_display() {
        let err = BasaltError::PageNotFound { page_id: 42 };
        assert_eq!(err.to_string(), "Page not found: 42");
    }

    #[test]
    fn test_buffer_pool_full_display() {
        let err = BasaltError::BufferPoolFull;
        assert_eq!(err.to_string(), "Buffer pool full, unable to allocate frame");
    }

    #[test]
    fn test_out_of_disk_pages_display() {
        let err = BasaltError::OutOfDiskPages;
        assert_eq!(err.to_string(), "Disk page space exhausted");
    }

    #[test]
    fn test_tree_errors_display() {
        let err = BasaltError::TreeCorrupted("parent link broken".to_string());
        assert_eq!(err.to_string(), "B+ tree corrupted: parent link broken");

        let err = BasaltError::IndexNotFound("idx_users".to_string());
        assert_eq!(err.to_string(), "Index not found in header page: idx_users");

        let err = BasaltError::HeaderPageFull;
        assert_eq!(
            err.to_string(),
            "Header page full, unable to register index"
        );
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = BasaltError::InvalidParameter {
            name: "leaf_max_size".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: leaf_max_size = 1");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(BasaltError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BasaltError>();
    }
}
