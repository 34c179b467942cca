//! Presentation Bridge: the seam between the pool and the display back-end.
//!
//! The pool never talks to display hardware directly. It creates one surface
//! per frame slot at startup, polls render/display completion during reclaim
//! sweeps, and hands surfaces to [`PresentationBridge::present`] when the
//! driver loop shows a frame. Back-ends are selected at initialization by
//! probing a ranked list of factories ([`select_bridge`]); a pure-software
//! bridge always succeeds as the last candidate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::frame::Dimensions;

/// Opaque handle to a back-end surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceHandle(pub u64);

impl std::fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Completion state of a surface as reported by the back-end.
///
/// Both flags can be true at once: a surface may still be receiving render
/// work while an earlier field of it is on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStatus {
    /// The back-end is still writing into the surface.
    pub rendering: bool,
    /// The display engine is still reading from the surface.
    pub displaying: bool,
}

impl SurfaceStatus {
    /// Returns true when the surface is neither being written nor shown.
    pub fn idle(&self) -> bool {
        !self.rendering && !self.displaying
    }
}

/// A rectangle in surface or display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Rect {
    /// Returns a rectangle covering the full extent of `dims` at the origin.
    pub fn full(dims: Dimensions) -> Self {
        Self {
            x: 0,
            y: 0,
            width: dims.width,
            height: dims.height,
        }
    }
}

/// Field selection for interlaced presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    /// Progressive: present the whole frame
    Frame,
    /// Present the top field only
    TopField,
    /// Present the bottom field only
    BottomField,
}

/// Thin interface to the external display back-end.
///
/// Implementations are out of scope for the pool: anything that can create
/// surfaces, answer completion polls and present qualifies. Polling calls
/// are assumed non-reentrant per surface but safe to call from either actor
/// while the per-frame advisory lock is held.
pub trait PresentationBridge: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Allocates a native surface for one frame slot.
    fn create_surface(&self, dims: Dimensions) -> Result<SurfaceHandle>;

    /// Releases a surface. Called only at pool teardown; ordinary frame
    /// reclamation keeps surfaces alive to avoid resource churn.
    fn destroy_surface(&self, handle: SurfaceHandle);

    /// Polls render/display completion for a surface.
    fn query_status(&self, handle: SurfaceHandle) -> Result<SurfaceStatus>;

    /// Asks the back-end to finish outstanding render work on a surface.
    fn flush(&self, handle: SurfaceHandle) -> Result<()>;

    /// Shows a surface on the display.
    fn present(&self, handle: SurfaceHandle, src: Rect, dst: Rect, field: FieldMode)
        -> Result<()>;

    /// Composites an overlay surface onto a video surface.
    fn composite(&self, overlay: SurfaceHandle, onto: SurfaceHandle) -> Result<()>;

    /// True when the back-end allocates real render state worth tracking in
    /// frame slots. Software bridges return false and frames carry no token.
    fn is_accelerated(&self) -> bool {
        true
    }

    /// True when a paused frame can be re-presented from its retained
    /// surface without copying pixels.
    fn supports_frozen_surface(&self) -> bool {
        self.is_accelerated()
    }

    /// True when overlay child surfaces can be polled independently of
    /// their parent. When false, the parent's status is used as a proxy
    /// for the pair.
    fn polls_child_surfaces(&self) -> bool {
        true
    }

    /// Advertised (min, max) number of surfaces this back-end can sustain.
    fn surface_budget(&self) -> (u32, u32) {
        (1, u32::MAX)
    }
}

/// Maximum flush-and-poll iterations in [`sync_surface`] before giving up.
const SYNC_MAX_POLLS: u32 = 2000;
/// Delay between completion polls while syncing a surface.
const SYNC_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Blocks until the back-end has finished rendering into `handle`.
///
/// Flushes once when render work is outstanding, then polls with a short
/// sleep. The wait is bounded; a surface that never settles produces a
/// [`PoolError::BackendSync`], which callers treat as a per-frame skip.
pub fn sync_surface(bridge: &dyn PresentationBridge, handle: SurfaceHandle) -> Result<()> {
    let mut flushed = false;
    for _ in 0..SYNC_MAX_POLLS {
        let status = bridge.query_status(handle)?;
        if !status.rendering {
            return Ok(());
        }
        if !flushed {
            bridge.flush(handle)?;
            flushed = true;
        }
        std::thread::sleep(SYNC_POLL_INTERVAL);
    }
    Err(PoolError::BackendSync(format!(
        "{handle} still rendering after bounded sync wait"
    )))
}

/// A probeable candidate back-end.
///
/// Factories are ranked by the caller; [`select_bridge`] takes the first one
/// whose probe succeeds. This replaces compile-time back-end tiers with a
/// capability-negotiated choice made once at initialization.
pub trait BridgeFactory {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Attempts to bring up this back-end for the given frame dimensions.
    fn probe(&self, dims: Dimensions) -> Result<Box<dyn PresentationBridge>>;
}

/// Probes `factories` in rank order and returns the first bridge that comes
/// up. Fails only if every candidate fails; appending
/// [`SoftwareBridgeFactory`] guarantees success.
pub fn select_bridge(
    factories: &[Box<dyn BridgeFactory>],
    dims: Dimensions,
) -> Result<Box<dyn PresentationBridge>> {
    for factory in factories {
        match factory.probe(dims) {
            Ok(bridge) => {
                info!("selected presentation back-end: {}", factory.name());
                return Ok(bridge);
            }
            Err(e) => {
                debug!("back-end {} unavailable: {e}", factory.name());
            }
        }
    }
    Err(PoolError::BackendSync(
        "no presentation back-end available".into(),
    ))
}

/// Internal record for one software surface.
#[derive(Debug, Default, Clone, Copy)]
struct SoftSurface {
    status: SurfaceStatus,
    presents: u64,
}

/// Pure-software presentation bridge.
///
/// Surfaces are bookkeeping entries only; presents complete immediately.
/// Doubles as the test back-end: [`SoftwareBridge::accelerated`] makes it
/// report itself as a hardware presenter (so the pool creates render
/// tokens), and completion state can be scripted with
/// [`SoftwareBridge::set_status`] to simulate a display engine that holds
/// on to surfaces.
#[derive(Debug, Default)]
pub struct SoftwareBridge {
    next_handle: AtomicU64,
    surfaces: Mutex<HashMap<SurfaceHandle, SoftSurface>>,
    accelerated: bool,
    polls_children: bool,
}

impl SoftwareBridge {
    /// Creates an empty software bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bridge that reports itself as accelerated, with
    /// independently pollable child surfaces. Presents still complete
    /// immediately unless statuses are scripted.
    pub fn accelerated() -> Self {
        Self {
            accelerated: true,
            polls_children: true,
            ..Self::default()
        }
    }

    /// Creates an accelerated bridge that can only poll parent surfaces,
    /// forcing the overlay proxy policy.
    pub fn accelerated_parent_poll_only() -> Self {
        Self {
            accelerated: true,
            polls_children: false,
            ..Self::default()
        }
    }

    /// Overrides the reported completion state of a surface.
    pub fn set_status(&self, handle: SurfaceHandle, rendering: bool, displaying: bool) {
        if let Some(surf) = self.surfaces.lock().get_mut(&handle) {
            surf.status = SurfaceStatus {
                rendering,
                displaying,
            };
        } else {
            warn!("set_status on unknown {handle}");
        }
    }

    /// Returns how many times a surface has been presented.
    pub fn present_count(&self, handle: SurfaceHandle) -> u64 {
        self.surfaces
            .lock()
            .get(&handle)
            .map(|s| s.presents)
            .unwrap_or(0)
    }

    /// Returns the number of live surfaces.
    pub fn surface_count(&self) -> usize {
        self.surfaces.lock().len()
    }
}

impl PresentationBridge for SoftwareBridge {
    fn name(&self) -> &str {
        "software"
    }

    fn create_surface(&self, _dims: Dimensions) -> Result<SurfaceHandle> {
        let handle = SurfaceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.surfaces.lock().insert(handle, SoftSurface::default());
        Ok(handle)
    }

    fn destroy_surface(&self, handle: SurfaceHandle) {
        if self.surfaces.lock().remove(&handle).is_none() {
            warn!("destroy_surface on unknown {handle}");
        }
    }

    fn query_status(&self, handle: SurfaceHandle) -> Result<SurfaceStatus> {
        self.surfaces
            .lock()
            .get(&handle)
            .map(|s| s.status)
            .ok_or_else(|| PoolError::BackendSync(format!("query on unknown {handle}")))
    }

    fn flush(&self, handle: SurfaceHandle) -> Result<()> {
        // Software rendering is synchronous; a flush settles the surface.
        if let Some(surf) = self.surfaces.lock().get_mut(&handle) {
            surf.status.rendering = false;
        }
        Ok(())
    }

    fn present(&self, handle: SurfaceHandle, _src: Rect, _dst: Rect, _field: FieldMode)
        -> Result<()> {
        let mut surfaces = self.surfaces.lock();
        let surf = surfaces
            .get_mut(&handle)
            .ok_or_else(|| PoolError::BackendSync(format!("present on unknown {handle}")))?;
        surf.presents += 1;
        Ok(())
    }

    fn composite(&self, overlay: SurfaceHandle, onto: SurfaceHandle) -> Result<()> {
        let surfaces = self.surfaces.lock();
        if surfaces.contains_key(&overlay) && surfaces.contains_key(&onto) {
            Ok(())
        } else {
            Err(PoolError::BackendSync(format!(
                "composite with unknown surface ({overlay} onto {onto})"
            )))
        }
    }

    fn is_accelerated(&self) -> bool {
        self.accelerated
    }

    fn supports_frozen_surface(&self) -> bool {
        self.accelerated
    }

    fn polls_child_surfaces(&self) -> bool {
        !self.accelerated || self.polls_children
    }
}

/// Factory for [`SoftwareBridge`]; always probes successfully.
#[derive(Debug, Default)]
pub struct SoftwareBridgeFactory;

impl BridgeFactory for SoftwareBridgeFactory {
    fn name(&self) -> &str {
        "software"
    }

    fn probe(&self, _dims: Dimensions) -> Result<Box<dyn PresentationBridge>> {
        Ok(Box::new(SoftwareBridge::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingFactory;

    impl BridgeFactory for FailingFactory {
        fn name(&self) -> &str {
            "always-fails"
        }

        fn probe(&self, _dims: Dimensions) -> Result<Box<dyn PresentationBridge>> {
            Err(PoolError::BackendSync("probe failed".into()))
        }
    }

    #[test]
    fn test_select_bridge_falls_through_to_software() {
        let factories: Vec<Box<dyn BridgeFactory>> = vec![
            Box::new(FailingFactory),
            Box::new(SoftwareBridgeFactory),
        ];
        let bridge = select_bridge(&factories, Dimensions::new(320, 240)).unwrap();
        assert_eq!(bridge.name(), "software");
        assert!(!bridge.is_accelerated());
    }

    #[test]
    fn test_select_bridge_all_fail() {
        let factories: Vec<Box<dyn BridgeFactory>> = vec![Box::new(FailingFactory)];
        assert!(select_bridge(&factories, Dimensions::new(320, 240)).is_err());
    }

    #[test]
    fn test_software_surface_lifecycle() {
        let bridge = SoftwareBridge::new();
        let dims = Dimensions::new(64, 64);
        let a = bridge.create_surface(dims).unwrap();
        let b = bridge.create_surface(dims).unwrap();
        assert_ne!(a, b);
        assert_eq!(bridge.surface_count(), 2);

        assert!(bridge.query_status(a).unwrap().idle());
        bridge.set_status(a, true, false);
        assert!(bridge.query_status(a).unwrap().rendering);

        // flush settles outstanding render work
        bridge.flush(a).unwrap();
        assert!(bridge.query_status(a).unwrap().idle());

        bridge.destroy_surface(a);
        assert!(bridge.query_status(a).is_err());
        assert_eq!(bridge.surface_count(), 1);
    }

    #[test]
    fn test_sync_surface_flushes_rendering() {
        let bridge = SoftwareBridge::new();
        let h = bridge.create_surface(Dimensions::new(8, 8)).unwrap();
        bridge.set_status(h, true, false);
        sync_surface(&bridge, h).unwrap();
        assert!(!bridge.query_status(h).unwrap().rendering);
    }

    #[test]
    fn test_present_counts() {
        let bridge = SoftwareBridge::new();
        let dims = Dimensions::new(8, 8);
        let h = bridge.create_surface(dims).unwrap();
        let r = Rect::full(dims);
        bridge.present(h, r, r, FieldMode::Frame).unwrap();
        bridge.present(h, r, r, FieldMode::Frame).unwrap();
        assert_eq!(bridge.present_count(h), 2);
    }
}
