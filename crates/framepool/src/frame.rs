//! Frame Resource: a single reusable buffer slot.
//!
//! Every slot is preallocated when the pool is sized at startup and lives
//! until pool teardown. During normal operation only a slot's queue
//! membership, lock state and pixel contents change; the slot itself is
//! never freed or reallocated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::bridge::SurfaceHandle;

/// How long a blocking frame-lock acquisition waits before logging that the
/// holder is overrunning its critical section.
const LOCK_COMPLAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Stable index of a frame slot within the pool (0..N-1, never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    /// Returns the slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Frame dimensions in pixels, fixed at pool creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Dimensions {
    /// Creates a new dimensions value.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Pixel format for frame storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common video format)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// RGB 24-bit
    Rgb24,
    /// RGBA 32-bit
    Rgba,
    /// BGRA 32-bit
    Bgra,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => 1,
        }
    }

    /// Returns (stride, rows) for the given plane index at these dimensions.
    fn plane_layout(&self, dims: Dimensions, plane: usize) -> (usize, usize) {
        let w = dims.width as usize;
        let h = dims.height as usize;
        match (self, plane) {
            (PixelFormat::Yuv420p, 0) => (w, h),
            (PixelFormat::Yuv420p, _) => (w.div_ceil(2), h.div_ceil(2)),
            (PixelFormat::Nv12, 0) => (w, h),
            (PixelFormat::Nv12, _) => (w, h.div_ceil(2)),
            (PixelFormat::Rgb24, _) => (w * 3, h),
            (PixelFormat::Rgba | PixelFormat::Bgra, _) => (w * 4, h),
        }
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row)
    pub stride: usize,
}

/// CPU-side pixel storage for one frame, owned by the registry and lent out
/// to the decoder and presenter during their processing windows.
#[derive(Debug, Clone)]
pub struct FrameStorage {
    /// Pixel format, immutable after allocation
    pub format: PixelFormat,
    /// Dimensions, immutable after allocation
    pub dims: Dimensions,
    /// Pixel data planes
    pub planes: Vec<Plane>,
}

impl FrameStorage {
    /// Allocates zero-filled storage for the given format and dimensions.
    pub fn allocate(format: PixelFormat, dims: Dimensions) -> Self {
        let planes = (0..format.num_planes())
            .map(|i| {
                let (stride, rows) = format.plane_layout(dims, i);
                Plane {
                    data: vec![0; stride * rows],
                    stride,
                }
            })
            .collect();
        Self {
            format,
            dims,
            planes,
        }
    }

    /// Copies pixel contents from another storage of identical geometry.
    ///
    /// Used by the pause-frame copy path. Format and dimensions are fixed at
    /// pool creation, so a mismatch is a logic defect.
    pub fn copy_from(&mut self, other: &FrameStorage) {
        debug_assert_eq!(self.format, other.format);
        debug_assert_eq!(self.dims, other.dims);
        for (dst, src) in self.planes.iter_mut().zip(other.planes.iter()) {
            dst.data.copy_from_slice(&src.data);
            dst.stride = src.stride;
        }
    }
}

/// Mutable per-frame content: pixel storage plus the back-end render token.
///
/// All access goes through the advisory frame lock; the mutex here only
/// guards against data races, not against lifecycle misuse.
#[derive(Debug)]
pub struct FrameContent {
    /// Pixel storage for this slot
    pub storage: FrameStorage,
    /// Opaque back-end surface token. Present only when the pool is backed
    /// by an accelerated presenter; created once, destroyed only at pool
    /// teardown.
    pub render_token: Option<SurfaceHandle>,
}

/// Advisory lock bookkeeping: a reference count plus diagnostic tags naming
/// the current holders. Used to detect double-unlock and lock leaks.
#[derive(Debug, Default)]
struct LockBook {
    count: u32,
    tags: Vec<&'static str>,
}

/// One preallocated buffer slot.
#[derive(Debug)]
pub struct FrameSlot {
    id: FrameId,
    /// Display-order counter, assigned at submit. Zero means "never
    /// submitted".
    sequence: AtomicU64,
    content: Mutex<FrameContent>,
    book: Mutex<LockBook>,
    unlocked: Condvar,
}

impl FrameSlot {
    pub(crate) fn new(id: FrameId, format: PixelFormat, dims: Dimensions) -> Self {
        Self {
            id,
            sequence: AtomicU64::new(0),
            content: Mutex::new(FrameContent {
                storage: FrameStorage::allocate(format, dims),
                render_token: None,
            }),
            book: Mutex::new(LockBook::default()),
            unlocked: Condvar::new(),
        }
    }

    /// Returns this slot's stable pool index.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Returns the display-order sequence number (0 if never submitted).
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, seq: u64) {
        self.sequence.store(seq, Ordering::Release);
    }

    /// Runs `f` with shared access to the frame content.
    ///
    /// Callers must hold the advisory frame lock around any window where the
    /// content is semantically in use; this method only provides data-race
    /// safety for the access itself.
    pub fn with_content<R>(&self, f: impl FnOnce(&FrameContent) -> R) -> R {
        f(&self.content.lock())
    }

    /// Runs `f` with exclusive access to the frame content.
    pub fn with_content_mut<R>(&self, f: impl FnOnce(&mut FrameContent) -> R) -> R {
        f(&mut self.content.lock())
    }

    /// Takes the render token out of the slot (teardown only).
    pub(crate) fn take_render_token(&self) -> Option<SurfaceHandle> {
        self.content.lock().render_token.take()
    }

    /// Acquires the advisory frame lock, blocking while another holder's
    /// critical section is in progress. Holders are expected to release
    /// promptly; an overrunning holder is logged every 500ms.
    pub fn lock(&self, tag: &'static str) {
        let mut book = self.book.lock();
        while book.count > 0 {
            let timed_out = self
                .unlocked
                .wait_for(&mut book, LOCK_COMPLAIN_INTERVAL)
                .timed_out();
            if timed_out && book.count > 0 {
                tracing::warn!(
                    "{}: lock({tag}) still waiting on holders {:?}",
                    self.id,
                    book.tags
                );
            }
        }
        book.count = 1;
        book.tags.push(tag);
    }

    /// Non-blocking lock variant. Returns false if the lock is held.
    pub fn try_lock(&self, tag: &'static str) -> bool {
        let mut book = self.book.lock();
        if book.count > 0 {
            return false;
        }
        book.count = 1;
        book.tags.push(tag);
        true
    }

    /// Bumps the lock count for a holder that already owns the lock.
    /// Used by multi-frame locking when the same frame is listed twice.
    pub(crate) fn relock(&self, tag: &'static str) {
        let mut book = self.book.lock();
        debug_assert!(book.count > 0, "relock of unheld {}", self.id);
        book.count += 1;
        book.tags.push(tag);
    }

    /// Releases the advisory frame lock.
    ///
    /// A release with no lock held would drive the count negative, which is
    /// a structural invariant violation; it aborts with a diagnostic dump.
    pub fn unlock(&self, tag: &'static str) {
        let mut book = self.book.lock();
        if book.count == 0 {
            panic!(
                "double-unlock of {} (tag {tag:?}, recorded holders {:?})",
                self.id, book.tags
            );
        }
        match book.tags.iter().rposition(|t| *t == tag) {
            Some(pos) => {
                book.tags.remove(pos);
            }
            None => {
                tracing::error!(
                    "{}: unlock({tag}) does not match any holder {:?}",
                    self.id,
                    book.tags
                );
            }
        }
        book.count -= 1;
        if book.count == 0 {
            self.unlocked.notify_all();
        }
    }

    /// Returns the current advisory lock count.
    pub fn lock_count(&self) -> u32 {
        self.book.lock().count
    }

    /// Returns the diagnostic tags of the current holders.
    pub fn lock_tags(&self) -> Vec<&'static str> {
        self.book.lock().tags.clone()
    }

    /// Waits up to `timeout` for the lock count to reach zero.
    /// Returns true if the frame is unlocked on return.
    pub(crate) fn wait_unlocked(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut book = self.book.lock();
        while book.count > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.unlocked.wait_for(&mut book, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slot() -> FrameSlot {
        FrameSlot::new(FrameId(0), PixelFormat::Yuv420p, Dimensions::new(16, 16))
    }

    #[test]
    fn test_storage_plane_sizes() {
        let s = FrameStorage::allocate(PixelFormat::Yuv420p, Dimensions::new(16, 16));
        assert_eq!(s.planes.len(), 3);
        assert_eq!(s.planes[0].data.len(), 16 * 16);
        assert_eq!(s.planes[1].data.len(), 8 * 8);
        assert_eq!(s.planes[2].data.len(), 8 * 8);

        let s = FrameStorage::allocate(PixelFormat::Nv12, Dimensions::new(16, 16));
        assert_eq!(s.planes.len(), 2);
        assert_eq!(s.planes[1].data.len(), 16 * 8);
    }

    #[test]
    fn test_storage_copy() {
        let mut a = FrameStorage::allocate(PixelFormat::Rgba, Dimensions::new(4, 4));
        let mut b = FrameStorage::allocate(PixelFormat::Rgba, Dimensions::new(4, 4));
        b.planes[0].data.fill(42);
        a.copy_from(&b);
        assert!(a.planes[0].data.iter().all(|&px| px == 42));
    }

    #[test]
    fn test_lock_try_lock() {
        let slot = make_slot();
        assert!(slot.try_lock("a"));
        assert_eq!(slot.lock_count(), 1);
        assert!(!slot.try_lock("b"));
        slot.unlock("a");
        assert_eq!(slot.lock_count(), 0);
        assert!(slot.try_lock("b"));
        slot.unlock("b");
    }

    #[test]
    fn test_lock_tags_recorded() {
        let slot = make_slot();
        slot.lock("fill");
        assert_eq!(slot.lock_tags(), vec!["fill"]);
        slot.relock("fill-nested");
        assert_eq!(slot.lock_count(), 2);
        slot.unlock("fill-nested");
        slot.unlock("fill");
        assert!(slot.lock_tags().is_empty());
    }

    #[test]
    #[should_panic(expected = "double-unlock")]
    fn test_double_unlock_is_fatal() {
        let slot = make_slot();
        slot.lock("once");
        slot.unlock("once");
        slot.unlock("once");
    }

    #[test]
    fn test_wait_unlocked_times_out() {
        let slot = make_slot();
        slot.lock("holder");
        assert!(!slot.wait_unlocked(Duration::from_millis(10)));
        slot.unlock("holder");
        assert!(slot.wait_unlocked(Duration::from_millis(10)));
    }
}
