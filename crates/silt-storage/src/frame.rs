use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::latch::RwLatch;
use crate::page_id::FrameId;

/// Lifecycle of a frame binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Bound to a page whose bytes are still being read from disk. The
    /// loading thread holds the io lock for the whole read.
    Loading = 0,
    /// The page bytes are valid.
    Resident = 1,
    /// Detached from the directory; a write-back may still be in flight.
    Evicting = 2,
}

impl FrameState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FrameState::Loading,
            1 => FrameState::Resident,
            _ => FrameState::Evicting,
        }
    }
}

/// An in-memory slot holding one page's bytes plus bookkeeping.
///
/// # Safety
///
/// `data` points at `page_size` bytes from the global allocator, freed in
/// `Drop`. Access to the bytes is coordinated by the access latch for
/// pinned use, and by the io lock plus the state machine for the loader
/// and write-back paths: no other thread touches the bytes of a `Loading`
/// frame, and an `Evicting` frame has no users.
pub struct Frame {
    frame_id: FrameId,
    page_size: usize,
    data: *mut u8,
    /// Outstanding pin handles. Transitions happen under the directory latch.
    users: AtomicU32,
    /// Modified since the last write-back.
    dirty: AtomicBool,
    /// Set the first time the frame enters a replacement queue.
    seen_before: AtomicBool,
    state: AtomicU8,
    /// Access latch guarding the page bytes for the duration of a pin.
    latch: RwLatch,
    /// Serialises disk reads and writes of this frame.
    io: Mutex<()>,
}

// All mutable state is atomic or lock-protected.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// Allocate a frame with zeroed page memory, bound to `frame_id`,
    /// already pinned once by the loading thread and in state `Loading`.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        let layout =
            Layout::from_size_align(page_size, page_size).expect("invalid page layout");
        // SAFETY: layout is non-zero with power-of-two alignment.
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            frame_id,
            page_size,
            data,
            users: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
            seen_before: AtomicBool::new(false),
            state: AtomicU8::new(FrameState::Loading as u8),
            latch: RwLatch::new(),
            io: Mutex::new(()),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Shared view of the page bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold the access latch, or otherwise know that no
    /// writer exists (eviction write-back of a frame with no users).
    pub unsafe fn data(&self) -> &[u8] {
        // SAFETY: data is valid for page_size bytes for the frame's lifetime.
        unsafe { std::slice::from_raw_parts(self.data, self.page_size) }
    }

    /// Mutable view of the page bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold the access latch exclusively, or be the loading
    /// thread of a `Loading` frame holding its io lock. The `&self`
    /// signature is intentional: the frame uses interior mutability through
    /// a raw pointer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        // SAFETY: data is valid for page_size bytes; exclusivity is the
        // caller's obligation.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.page_size) }
    }

    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    /// Add a pin; returns the new count.
    pub fn pin(&self) -> u32 {
        self.users.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a pin; returns the new count.
    pub fn unpin(&self) -> u32 {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned frame");
        prev - 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Record that the frame is entering a replacement queue; returns true
    /// when it had been queued before (which promotes it to the LRU queue).
    pub fn mark_seen(&self) -> bool {
        self.seen_before.swap(true, Ordering::Relaxed)
    }

    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn latch(&self) -> &RwLatch {
        &self.latch
    }

    pub fn io(&self) -> &Mutex<()> {
        &self.io
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.page_size, self.page_size)
            .expect("invalid page layout");
        // SAFETY: data was allocated with this exact layout in Frame::new.
        unsafe {
            dealloc(self.data, layout);
        }
    }
}
