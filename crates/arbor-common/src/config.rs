//! Configuration structures for ArborDB.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Storage configuration for the page-oriented engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            buffer_pool_frames: 1024, // 16 MB with 16 KB pages
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_frames * self.page_size
    }
}

/// Configuration for a B+ tree index.
///
/// A fan-out limit of zero means "derive from the page size", which is
/// the production setting. Tests pass small explicit limits to force
/// splits and merges with few keys.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum entries in a leaf page (0 = derive from page size).
    pub leaf_max_size: usize,
    /// Maximum entries in an internal page (0 = derive from page size).
    pub internal_max_size: usize,
}
