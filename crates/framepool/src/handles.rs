//! Process-wide surface handle registry.
//!
//! Back-end surfaces are external resources that outlive any single call
//! into the pool. Registering every live handle in one place gives abnormal
//! teardown paths (fatal-signal handlers, panic hooks) a way to release
//! display resources even when the owning pool can no longer be reached.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bridge::SurfaceHandle;

/// Tracks every live back-end surface handle in the process.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: Mutex<BTreeMap<SurfaceHandle, &'static str>>,
}

static GLOBAL: OnceLock<HandleRegistry> = OnceLock::new();

/// Returns the process-wide registry.
pub fn global() -> &'static HandleRegistry {
    GLOBAL.get_or_init(HandleRegistry::default)
}

impl HandleRegistry {
    /// Records a live handle under an owner label.
    pub fn register(&self, handle: SurfaceHandle, owner: &'static str) {
        if let Some(previous) = self.entries.lock().insert(handle, owner) {
            warn!("{handle} re-registered (previous owner {previous:?})");
        }
    }

    /// Removes a handle. Returns false (and logs) if it was not registered.
    pub fn unregister(&self, handle: SurfaceHandle) -> bool {
        let removed = self.entries.lock().remove(&handle).is_some();
        if !removed {
            warn!("unregister of unknown {handle}");
        }
        removed
    }

    /// Returns the number of live handles.
    pub fn live_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drains the registry, invoking `release` for each live handle.
    ///
    /// Meant for last-resort cleanup from a fatal-signal or panic path where
    /// the owning pools cannot run their own teardown. `release` must not
    /// call back into the registry.
    pub fn teardown_all(&self, mut release: impl FnMut(SurfaceHandle)) {
        let drained = std::mem::take(&mut *self.entries.lock());
        if !drained.is_empty() {
            debug!("releasing {} leaked surface handle(s)", drained.len());
        }
        for (handle, owner) in drained {
            debug!("releasing {handle} (owner {owner:?})");
            release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let reg = HandleRegistry::default();
        let h = SurfaceHandle(101);
        reg.register(h, "test-pool");
        assert_eq!(reg.live_count(), 1);
        assert!(reg.unregister(h));
        assert_eq!(reg.live_count(), 0);
        assert!(!reg.unregister(h));
    }

    #[test]
    fn test_teardown_all_drains() {
        let reg = HandleRegistry::default();
        reg.register(SurfaceHandle(1), "a");
        reg.register(SurfaceHandle(2), "b");

        let mut released = Vec::new();
        reg.teardown_all(|h| released.push(h));
        assert_eq!(released, vec![SurfaceHandle(1), SurfaceHandle(2)]);
        assert_eq!(reg.live_count(), 0);
    }
}
