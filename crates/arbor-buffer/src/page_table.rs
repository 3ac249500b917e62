//! Page table mapping resident pages to their frames.

use crate::frame::FrameId;
use arbor_common::page::PageId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Striped hash map from page id to frame id.
///
/// Residency is checked on every pin, so the table is split into
/// independently locked shards: a page id always lands in the same
/// shard, and lookups of unrelated pages never contend on one lock.
/// Shards are ordinary growable maps, so the table has no fixed
/// capacity and an insert cannot be refused.
pub struct PageTable {
    shards: Vec<RwLock<HashMap<u32, FrameId>>>,
    shard_mask: usize,
}

impl PageTable {
    /// Creates a page table sized for a pool of `capacity` frames.
    ///
    /// One shard per 64 frames, clamped to [1, 64] and rounded up to a
    /// power of two so shard selection is a mask.
    pub fn new(capacity: usize) -> Self {
        let shard_count = (capacity / 64).next_power_of_two().clamp(1, 64);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards,
            shard_mask: shard_count - 1,
        }
    }

    /// Page ids are allocated densely, so striping by the low bits
    /// spreads consecutive pages round-robin over the shards.
    #[inline]
    fn shard_of(&self, page_id: PageId) -> &RwLock<HashMap<u32, FrameId>> {
        &self.shards[(page_id.0 as usize) & self.shard_mask]
    }

    /// Returns the frame holding `page_id`, if the page is resident.
    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.shard_of(page_id).read().get(&page_id.0).copied()
    }

    /// Maps `page_id` to `frame_id`, replacing any previous mapping.
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) {
        self.shard_of(page_id).write().insert(page_id.0, frame_id);
    }

    /// Drops the mapping for `page_id`, returning the frame it held.
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        self.shard_of(page_id).write().remove(&page_id.0)
    }

    /// Returns true if `page_id` is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.shard_of(page_id).read().contains_key(&page_id.0)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Returns true if no page is resident.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Visits every mapping, shard by shard, until `f` returns false.
    ///
    /// Each shard is read-locked only while it is being walked.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        for shard in &self.shards {
            let shard = shard.read();
            for (&page, &frame) in shard.iter() {
                if !f(PageId(page), frame) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_roundtrip() {
        let table = PageTable::new(128);

        table.insert(PageId(7), FrameId(3));

        assert_eq!(table.get(PageId(7)), Some(FrameId(3)));
        assert!(table.contains(PageId(7)));
    }

    #[test]
    fn test_missing_page_is_absent() {
        let table = PageTable::new(128);

        assert_eq!(table.get(PageId(7)), None);
        assert!(!table.contains(PageId(7)));
        assert_eq!(table.remove(PageId(7)), None);
    }

    #[test]
    fn test_overwrite_keeps_single_mapping() {
        let table = PageTable::new(128);

        table.insert(PageId(7), FrameId(3));
        table.insert(PageId(7), FrameId(9));

        assert_eq!(table.get(PageId(7)), Some(FrameId(9)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_returns_mapping() {
        let table = PageTable::new(128);

        table.insert(PageId(7), FrameId(3));

        assert_eq!(table.remove(PageId(7)), Some(FrameId(3)));
        assert_eq!(table.get(PageId(7)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_dense_ids_spread_over_shards() {
        // 4096 frames -> 64 shards; every consecutive id still resolves.
        let table = PageTable::new(4096);

        for page in 0..256u32 {
            table.insert(PageId(page), FrameId(page % 97));
        }

        assert_eq!(table.len(), 256);
        for page in 0..256u32 {
            assert_eq!(table.get(PageId(page)), Some(FrameId(page % 97)));
        }
    }

    #[test]
    fn test_tiny_pool_gets_one_shard() {
        // Shard count clamps at 1; the table still behaves.
        let table = PageTable::new(2);

        table.insert(PageId(0), FrameId(0));
        table.insert(PageId(1), FrameId(1));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(PageId(1)), Some(FrameId(1)));
    }

    #[test]
    fn test_for_each_visits_live_mappings() {
        let table = PageTable::new(128);
        table.insert(PageId(1), FrameId(10));
        table.insert(PageId(2), FrameId(20));
        table.remove(PageId(1));

        let mut seen = Vec::new();
        table.for_each(|page, frame| {
            seen.push((page, frame));
            true
        });

        assert_eq!(seen, vec![(PageId(2), FrameId(20))]);
    }

    #[test]
    fn test_for_each_stops_early() {
        let table = PageTable::new(128);
        for page in 0..10u32 {
            table.insert(PageId(page), FrameId(page));
        }

        let mut visited = 0;
        table.for_each(|_, _| {
            visited += 1;
            visited < 3
        });

        assert_eq!(visited, 3);
    }
}
