//! Buffer frames: latched page buffers with pin and dirty bookkeeping.

use arbor_common::page::{PageId, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Position of a frame within the buffer pool's frame array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

// Frame state word layout:
//   bits 0..32   resident page id (all ones = no page)
//   bit  32      dirty flag
//   bits 33..64  pin count
const PAGE_MASK: u64 = u32::MAX as u64;
const NO_PAGE: u64 = PAGE_MASK;
const DIRTY_BIT: u64 = 1 << 32;
const PIN_SHIFT: u32 = 33;
const PIN_ONE: u64 = 1 << PIN_SHIFT;

/// Decoded copy of a frame's state word.
///
/// Because the word is read with a single load, the three fields are
/// always mutually consistent, even while other threads pin or dirty
/// the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    /// Page resident in the frame, if any.
    pub page_id: Option<PageId>,
    /// Whether the page bytes differ from the store's copy.
    pub dirty: bool,
    /// Number of outstanding pins.
    pub pin_count: u32,
}

/// A frame in the buffer pool holding a single page.
///
/// The page bytes sit behind a read/write latch; readers take it
/// shared, mutators exclusive. All remaining state (which page is
/// loaded, the dirty flag, the pin count) is packed into one atomic
/// word, so eviction and diagnostics observe a coherent snapshot
/// without taking the latch. Pins only guard against eviction; they do
/// not serialize access.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// Packed page id, dirty flag, and pin count.
    state: AtomicU64,
    /// Page data buffer, doubling as the page latch.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl BufferFrame {
    /// Creates an empty frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            state: AtomicU64::new(NO_PAGE),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    fn decode(word: u64) -> FrameState {
        let raw_page = (word & PAGE_MASK) as u32;
        FrameState {
            page_id: if raw_page == u32::MAX {
                None
            } else {
                Some(PageId(raw_page))
            },
            dirty: word & DIRTY_BIT != 0,
            pin_count: (word >> PIN_SHIFT) as u32,
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns a consistent snapshot of the frame's state.
    #[inline]
    pub fn state(&self) -> FrameState {
        Self::decode(self.state.load(Ordering::Acquire))
    }

    /// Returns the page resident in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        self.state().page_id
    }

    /// Points the frame at `page_id`, keeping dirty flag and pins.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let raw = match page_id {
            Some(pid) => pid.0 as u64,
            None => NO_PAGE,
        };
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & !PAGE_MASK) | raw)
            });
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.state().pin_count
    }

    /// Takes a pin, returning the new pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        let prev = self.state.fetch_add(PIN_ONE, Ordering::AcqRel);
        (prev >> PIN_SHIFT) as u32 + 1
    }

    /// Releases a pin, returning the new pin count.
    ///
    /// Unpinning a frame with no outstanding pins is a caller bug; the
    /// request is refused and logged rather than wrapping the count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if word >> PIN_SHIFT == 0 {
                    None
                } else {
                    Some(word - PIN_ONE)
                }
            });
        match result {
            Ok(prev) => (prev >> PIN_SHIFT) as u32 - 1,
            Err(_) => {
                tracing::warn!("unpin of unpinned {}", self.frame_id.0);
                0
            }
        }
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.state().pin_count > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Raises or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            self.state.fetch_or(DIRTY_BIT, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!DIRTY_BIT, Ordering::AcqRel);
        }
    }

    /// Reads the page data (shared latch).
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Writes to the page data (exclusive latch).
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copies bytes into the frame, truncating at the page boundary.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Returns the frame to its empty state, scrubbing the page bytes.
    #[inline]
    pub fn reset(&self) {
        self.state.store(NO_PAGE, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &state.page_id)
            .field("dirty", &state.dirty)
            .field("pin_count", &state.pin_count)
            .finish()
    }
}
