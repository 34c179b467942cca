//! Overlay Attachment Manager.
//!
//! An on-screen-display frame can be attached as the *child* of a primary
//! video frame. The relation is symmetric, flat (no chains) and index-based;
//! it exists to order reclamation: a parent never returns to `free` while
//! its child is still unresolved on the display engine.

use tracing::{debug, trace, warn};

use crate::bridge::PresentationBridge;
use crate::error::Result;
use crate::frame::FrameId;
use crate::registry::{BufferQueue, Registry};

/// Policy object governing overlay attachment and reclamation order.
#[derive(Debug)]
pub struct OverlayManager {
    aggressive: bool,
}

impl OverlayManager {
    /// Creates a manager; `aggressive` enables the deep-free-sweep mode.
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    /// Returns true when deep-free sweeping is enabled.
    pub fn is_aggressive(&self) -> bool {
        self.aggressive
    }

    /// Attaches `child` as the overlay frame of `parent`.
    ///
    /// Fails with `AlreadyAttached` if either endpoint is already part of an
    /// attachment or the link would form a chain or self-loop.
    pub fn attach(&self, registry: &Registry, parent: FrameId, child: FrameId) -> Result<()> {
        registry.link(parent, child)?;
        debug!("attached overlay {child} to {parent}");
        Ok(())
    }

    /// Detaches the overlay frame of `parent`, returning it. Idempotent:
    /// detaching an unattached parent is a no-op.
    pub fn detach(&self, registry: &Registry, parent: FrameId) -> Option<FrameId> {
        let child = registry.unlink_child(parent)?;
        debug!("detached overlay {child} from {parent}");
        Some(child)
    }

    /// Decides whether `id` has finished displaying, honoring the overlay
    /// reclamation rule, and detaches a child whose display has resolved.
    ///
    /// Returns true when `id` itself may move to `reclaimable`. When the
    /// back-end cannot poll child surfaces, the parent's status stands as a
    /// proxy for the pair.
    ///
    /// The caller holds the per-frame advisory lock on `id` across this
    /// call; status polling is only defined under that lock.
    pub fn resolve_for_reclaim(
        &self,
        registry: &Registry,
        bridge: &dyn PresentationBridge,
        id: FrameId,
    ) -> Result<bool> {
        let token = registry.slot(id).with_content(|c| c.render_token);
        let self_displaying = match token {
            Some(t) => bridge.query_status(t)?.displaying,
            None => false,
        };

        if let Some(child) = registry.child_of(id) {
            let child_displaying = if bridge.polls_child_surfaces() {
                let ctoken = registry.slot(child).with_content(|c| c.render_token);
                match ctoken {
                    Some(t) => bridge.query_status(t)?.displaying,
                    None => false,
                }
            } else {
                // Single-surface polling: parent displaying implies child
                // displaying.
                self_displaying
            };
            if child_displaying {
                trace!("{id}: overlay {child} still displaying, holding parent");
                return Ok(false);
            }
            self.detach(registry, id);
        }

        Ok(!self_displaying)
    }

    /// Deep-free sweep: walks the attachments of `displayed` frames and
    /// detaches children whose *rendering* (not just display) is complete,
    /// reducing pool pressure on back-ends with few surfaces.
    ///
    /// The walk is a single pass over a snapshot of `displayed`; within one
    /// parent it stops as soon as no remaining child is render-complete.
    /// Returns the number of children released.
    pub fn deep_free_sweep(&self, registry: &Registry, bridge: &dyn PresentationBridge) -> usize {
        if !self.aggressive {
            return 0;
        }
        let mut released = 0;
        for parent in registry.snapshot(BufferQueue::Displayed) {
            while let Some(child) = registry.child_of(parent) {
                if !registry.try_lock_frame(child, "deep-free sweep") {
                    break;
                }
                let ctoken = registry.slot(child).with_content(|c| c.render_token);
                let rendering = match ctoken {
                    Some(t) => match bridge.query_status(t) {
                        Ok(status) => status.rendering,
                        Err(e) => {
                            warn!("deep-free sweep: status poll for {child} failed: {e}");
                            registry.unlock_frame(child, "deep-free sweep");
                            break;
                        }
                    },
                    None => false,
                };
                registry.unlock_frame(child, "deep-free sweep");
                if rendering {
                    break;
                }
                self.detach(registry, parent);
                released += 1;
            }
        }
        if released > 0 {
            debug!("deep-free sweep released {released} overlay frame(s)");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SoftwareBridge;
    use crate::frame::{Dimensions, PixelFormat};

    fn make_parts() -> (Registry, OverlayManager, SoftwareBridge) {
        let registry = Registry::new(4, PixelFormat::Yuv420p, Dimensions::new(32, 32));
        (registry, OverlayManager::new(false), SoftwareBridge::accelerated())
    }

    fn give_token(registry: &Registry, bridge: &SoftwareBridge, id: FrameId) {
        let token = bridge
            .create_surface(Dimensions::new(32, 32))
            .unwrap();
        registry
            .slot(id)
            .with_content_mut(|c| c.render_token = Some(token));
    }

    #[test]
    fn test_attach_detach_symmetry() {
        let (registry, overlay, _) = make_parts();
        let p = registry.try_acquire_free(0, false).unwrap();
        let c = registry.try_acquire_free(0, false).unwrap();

        overlay.attach(&registry, p, c).unwrap();
        assert_eq!(registry.child_of(p), Some(c));
        assert_eq!(registry.parent_of(c), Some(p));

        assert_eq!(overlay.detach(&registry, p), Some(c));
        assert_eq!(registry.child_of(p), None);
        assert_eq!(registry.parent_of(c), None);

        // idempotent
        assert_eq!(overlay.detach(&registry, p), None);
    }

    #[test]
    fn test_attach_twice_fails() {
        let (registry, overlay, _) = make_parts();
        let p = registry.try_acquire_free(0, false).unwrap();
        let c1 = registry.try_acquire_free(0, false).unwrap();
        let c2 = registry.try_acquire_free(0, false).unwrap();

        overlay.attach(&registry, p, c1).unwrap();
        assert!(overlay.attach(&registry, p, c2).is_err());
    }

    #[test]
    fn test_parent_held_while_child_displaying() {
        let (registry, overlay, bridge) = make_parts();
        let p = registry.try_acquire_free(0, false).unwrap();
        let c = registry.try_acquire_free(0, false).unwrap();
        give_token(&registry, &bridge, p);
        give_token(&registry, &bridge, c);
        overlay.attach(&registry, p, c).unwrap();

        let ct = registry.slot(c).with_content(|x| x.render_token).unwrap();
        bridge.set_status(ct, false, true); // child still on screen

        assert!(!overlay.resolve_for_reclaim(&registry, &bridge, p).unwrap());
        assert_eq!(registry.child_of(p), Some(c)); // relation intact

        bridge.set_status(ct, false, false);
        assert!(overlay.resolve_for_reclaim(&registry, &bridge, p).unwrap());
        assert_eq!(registry.child_of(p), None); // resolved child detached
    }

    #[test]
    fn test_proxy_policy_without_child_polling() {
        let registry = Registry::new(4, PixelFormat::Yuv420p, Dimensions::new(32, 32));
        let overlay = OverlayManager::new(false);
        let bridge = SoftwareBridge::accelerated_parent_poll_only();

        let p = registry.try_acquire_free(0, false).unwrap();
        let c = registry.try_acquire_free(0, false).unwrap();
        give_token(&registry, &bridge, p);
        overlay.attach(&registry, p, c).unwrap();

        let pt = registry.slot(p).with_content(|x| x.render_token).unwrap();
        bridge.set_status(pt, false, true);
        // parent displaying stands in for the child
        assert!(!overlay.resolve_for_reclaim(&registry, &bridge, p).unwrap());

        bridge.set_status(pt, false, false);
        assert!(overlay.resolve_for_reclaim(&registry, &bridge, p).unwrap());
    }

    #[test]
    fn test_deep_free_sweep_releases_rendered_children() {
        let registry = Registry::new(4, PixelFormat::Yuv420p, Dimensions::new(32, 32));
        let overlay = OverlayManager::new(true);
        let bridge = SoftwareBridge::accelerated();

        let p = registry.try_acquire_free(0, false).unwrap();
        let c = registry.try_acquire_free(0, false).unwrap();
        give_token(&registry, &bridge, p);
        give_token(&registry, &bridge, c);
        overlay.attach(&registry, p, c).unwrap();

        registry.submit(p);
        registry.mark_displayed(p);

        let ct = registry.slot(c).with_content(|x| x.render_token).unwrap();
        bridge.set_status(ct, true, false); // still rendering: must stay
        assert_eq!(overlay.deep_free_sweep(&registry, &bridge), 0);
        assert_eq!(registry.child_of(p), Some(c));

        bridge.set_status(ct, false, true); // rendered (display may lag)
        assert_eq!(overlay.deep_free_sweep(&registry, &bridge), 1);
        assert_eq!(registry.child_of(p), None);
    }

    #[test]
    fn test_deep_free_sweep_disabled_by_default() {
        let (registry, overlay, bridge) = make_parts();
        assert_eq!(overlay.deep_free_sweep(&registry, &bridge), 0);
    }
}
