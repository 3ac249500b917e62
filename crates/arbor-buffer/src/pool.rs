//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use crate::store::PageStore;
use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use parking_lot::Mutex;
use sysinfo::System;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list for new pages
/// - Clock replacement for eviction
/// - Pin counting for concurrent access
/// - A backing page store holding every allocated page
///
/// Every page handed out by `new_page`/`fetch_page` is pinned; callers
/// must match each pin with an `unpin_page` declaring whether they
/// modified the page bytes. Dirty frames are written back to the store
/// before their frame is reused, so a later fetch always observes the
/// last unpinned-dirty contents.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Backing store for non-resident pages.
    store: Mutex<PageStore>,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            store: Mutex::new(PageStore::new()),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently resident in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Returns the number of allocated pages (resident or not).
    pub fn allocated_count(&self) -> usize {
        self.store.lock().live_count()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Allocates a frame for loading or creating a page.
    ///
    /// Tries the free list first, then evicts an unpinned frame. Dirty
    /// victims are written back to the store before the frame is handed
    /// out.
    fn allocate_frame(&self) -> Result<FrameId> {
        {
            let mut free_list = self.free_list.lock();
            if let Some(frame_id) = free_list.pop() {
                return Ok(frame_id);
            }
        }

        let victim = self
            .replacer
            .evict(&|fid| self.frames[fid.0 as usize].pin_count() == 0)
            .ok_or(ArborError::BufferPoolFull)?;

        let frame = &self.frames[victim.0 as usize];
        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read_data();
                self.store.lock().write(old_page_id.0, &**data);
            }
            self.page_table.remove(old_page_id);
        }

        Ok(victim)
    }

    /// Allocates a new zeroed page and pins it.
    ///
    /// Returns the fresh page id and its frame. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PageId, &BufferFrame)> {
        let page_id = PageId(self.store.lock().allocate());

        let frame_id = match self.allocate_frame() {
            Ok(frame_id) => frame_id,
            Err(e) => {
                self.store.lock().free(page_id.0);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();
        self.replacer.record_access(frame_id);

        self.page_table.insert(page_id, frame_id);

        Ok((page_id, frame))
    }

    /// Fetches an existing page, pinning it.
    ///
    /// Faults the page in from the backing store if it is not resident.
    /// Fails with `PageNotFound` for ids that were never allocated (or
    /// were deleted).
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(frame);
        }

        // Miss: copy the page out of the store, then load it into a frame.
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        {
            let store = self.store.lock();
            if !store.read(page_id.0, &mut buf) {
                return Err(ArborError::PageNotFound { page_id: page_id.0 });
            }
        }

        let frame_id = self.allocate_frame()?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.copy_from(&buf[..]);
        frame.set_page_id(Some(page_id));
        frame.pin();
        self.replacer.record_access(frame_id);

        self.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Unpins a page in the buffer pool.
    ///
    /// The dirty flag must be true iff the caller modified the page
    /// bytes. Returns false if the page is not resident.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            frame.unpin();
            return true;
        }
        false
    }

    /// Writes a resident dirty page back to the store.
    ///
    /// Returns true if the page was flushed.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.store.lock().write(page_id.0, &**data);
                frame.set_dirty(false);
                return true;
            }
        }
        false
    }

    /// Writes all resident dirty pages back to the store.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> usize {
        let mut dirty_pages = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            if self.frames[frame_id.0 as usize].is_dirty() {
                dirty_pages.push((page_id, frame_id));
            }
            true
        });

        let mut flushed = 0;
        for (page_id, frame_id) in dirty_pages {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.store.lock().write(page_id.0, &**data);
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        flushed
    }

    /// Deletes a page, returning it to the store free list.
    ///
    /// Returns false if the page is pinned or was never allocated.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        if let Some(frame_id) = self.page_table.remove(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            // Cannot delete a pinned page - re-insert the mapping
            if frame.is_pinned() {
                self.page_table.insert(page_id, frame_id);
                return false;
            }

            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
        }

        self.store.lock().free(page_id.0)
    }

    /// Diagnostic hook: returns true if no resident page holds a pin.
    pub fn check_all_unpinned(&self) -> bool {
        let mut all_unpinned = true;
        self.page_table.for_each(|_, frame_id| {
            if self.frames[frame_id.0 as usize].is_pinned() {
                all_unpinned = false;
                return false;
            }
            true
        });
        all_unpinned
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            // One consistent snapshot per frame.
            let state = self.frames[frame_id.0 as usize].state();
            if state.pin_count > 0 {
                pinned_count += 1;
            }
            if state.dirty {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
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
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(num_frames: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig { num_frames })
    }

    #[test]
    fn test_buffer_pool_new() {
        let pool = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let pool = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        assert_eq!(page_id, PageId(0));
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_new_page_sequential_ids() {
        let pool = create_test_pool(10);

        let (a, _) = pool.new_page().unwrap();
        let (b, _) = pool.new_page().unwrap();
        let (c, _) = pool.new_page().unwrap();

        assert_eq!((a, b, c), (PageId(0), PageId(1), PageId(2)));
    }

    #[test]
    fn test_buffer_pool_fetch_existing() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let pool = create_test_pool(10);

        let result = pool.fetch_page(PageId(99));
        assert!(matches!(
            result,
            Err(ArborError::PageNotFound { page_id: 99 })
        ));
    }

    #[test]
    fn test_buffer_pool_unpin() {
        let pool = create_test_pool(10);
        let (page_id, frame) = pool.new_page().unwrap();
        assert!(frame.is_pinned());

        pool.unpin_page(page_id, false);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_dirty_tracking() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, true);

        let frame = pool.fetch_page(page_id).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_buffer_pool_eviction_writes_back() {
        let pool = create_test_pool(2);

        // Fill the pool with dirty pages carrying distinct bytes.
        let mut page_ids = Vec::new();
        for i in 0..4u8 {
            let (page_id, frame) = pool.new_page().unwrap();
            frame.write_data()[0] = 0xA0 + i;
            pool.unpin_page(page_id, true);
            page_ids.push(page_id);
        }

        // Only 2 frames, so the first pages were evicted. Their contents
        // must survive the round trip through the store.
        for (i, &page_id) in page_ids.iter().enumerate() {
            let frame = pool.fetch_page(page_id).unwrap();
            assert_eq!(frame.read_data()[0], 0xA0 + i as u8);
            pool.unpin_page(page_id, false);
        }
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let pool = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        let result = pool.new_page();
        assert!(matches!(result, Err(ArborError::BufferPoolFull)));

        // The failed allocation must not leak a store page.
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        assert!(pool.contains(page_id));
        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.allocated_count(), 0);

        // Deleted pages cannot be fetched back.
        assert!(pool.fetch_page(page_id).is_err());
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        // Don't unpin

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_delete_nonresident_page() {
        let pool = create_test_pool(1);

        let (a, _) = pool.new_page().unwrap();
        pool.unpin_page(a, true);
        // Evict page a by creating another page.
        let (b, _) = pool.new_page().unwrap();
        pool.unpin_page(b, false);
        assert!(!pool.contains(a));

        // Deleting a non-resident page still frees it in the store.
        assert!(pool.delete_page(a));
        assert!(pool.fetch_page(a).is_err());
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let pool = create_test_pool(10);
        let (page_id, frame) = pool.new_page().unwrap();
        frame.write_data()[7] = 0x77;
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id));

        let frame = pool.fetch_page(page_id).unwrap();
        assert!(!frame.is_dirty());
        pool.unpin_page(page_id, false);

        // Flushing a clean page is a no-op.
        assert!(!pool.flush_page(page_id));
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let pool = create_test_pool(10);

        for _ in 0..5 {
            let (page_id, _) = pool.new_page().unwrap();
            pool.unpin_page(page_id, true);
        }

        assert_eq!(pool.flush_all(), 5);
        assert_eq!(pool.flush_all(), 0);
    }

    #[test]
    fn test_buffer_pool_check_all_unpinned() {
        let pool = create_test_pool(10);

        let (a, _) = pool.new_page().unwrap();
        let (b, _) = pool.new_page().unwrap();
        assert!(!pool.check_all_unpinned());

        pool.unpin_page(a, false);
        assert!(!pool.check_all_unpinned());

        pool.unpin_page(b, false);
        assert!(pool.check_all_unpinned());
    }

    #[test]
    fn test_buffer_pool_page_id_reuse_after_delete() {
        let pool = create_test_pool(10);
        let (a, _) = pool.new_page().unwrap();
        pool.unpin_page(a, false);
        pool.delete_page(a);

        let (b, _) = pool.new_page().unwrap();
        assert_eq!(b, a);
        pool.unpin_page(b, false);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let pool = create_test_pool(10);

        let mut ids = Vec::new();
        for i in 0..5 {
            let (page_id, _) = pool.new_page().unwrap();
            if i % 2 == 0 {
                pool.unpin_page(page_id, true); // Dirty
            }
            // Odd pages remain pinned
            ids.push(page_id);
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 5);
        assert_eq!(stats.pinned_frames, 2);
        assert_eq!(stats.dirty_frames, 3);
    }
}
