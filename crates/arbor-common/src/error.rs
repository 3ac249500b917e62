//! Error types for ArborDB.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in ArborDB operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    // Index errors
    #[error("Index roots page full, unable to register index")]
    HeaderPageFull,

    #[error("Index not found: {0}")]
    IndexNotFound(u32),

    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
