//! Pause-Frame Controller.
//!
//! While playback is paused or stalled the presenter keeps re-showing one
//! frozen frame instead of pulling new frames from the decoder. On back-ends
//! with frozen-surface support the frame is simply retained in the `pause`
//! queue (zero-copy); otherwise its pixels are copied into the dedicated
//! scratch slot and the scratch slot is frozen instead.

use tracing::{debug, trace, warn};

use crate::bridge::PresentationBridge;
use crate::registry::{BufferQueue, Registry};

/// Maintains the single frozen frame for the paused/stalled state.
#[derive(Debug, Default)]
pub struct PauseController;

impl PauseController {
    /// Creates a controller.
    pub fn new() -> Self {
        Self
    }

    /// Returns true while a frame is frozen in `pause`.
    pub fn is_frozen(&self, registry: &Registry) -> bool {
        registry.size(BufferQueue::Pause) > 0
    }

    /// Freezes a frame for repeated re-display.
    ///
    /// Prefers the most recently displayed frame, retained without a copy
    /// when the back-end supports frozen surfaces. With no displayed frame
    /// (or no zero-copy support) the most recent `used` frame's pixels are
    /// copied into the scratch slot. Any previously frozen frame is
    /// released back into the `displayed` flow first.
    ///
    /// Returns true if a frame is frozen on return; false when the pool has
    /// nothing to freeze yet.
    pub fn freeze(&self, registry: &Registry, bridge: &dyn PresentationBridge) -> bool {
        if bridge.supports_frozen_surface() {
            if let Some(candidate) = registry.tail(BufferQueue::Displayed) {
                // If the newest displayed frame is an overlay child, freeze
                // the video frame it belongs to.
                let frame = registry.parent_of(candidate).unwrap_or(candidate);
                self.release_current(registry);
                registry.safe_enqueue(BufferQueue::Pause, frame);
                debug!("frozen {frame} (zero-copy)");
                return true;
            }
        }

        let Some(source) = registry.tail(BufferQueue::Used) else {
            trace!("freeze: no displayed or used frame to freeze");
            return self.is_frozen(registry);
        };

        let scratch = registry.scratch_id();
        if !registry.contains(BufferQueue::Free, scratch)
            && !registry.contains(BufferQueue::Pause, scratch)
        {
            // Scratch handed out under pool pressure; leave any existing
            // pause frame as it is.
            warn!(
                "freeze: scratch frame unavailable ({:?})",
                registry.queue_of(scratch)
            );
            return self.is_frozen(registry);
        }

        registry.lock_frames(&[source, scratch], "freeze copy");
        registry.slot(scratch).with_content_mut(|dst| {
            registry
                .slot(source)
                .with_content(|src| dst.storage.copy_from(&src.storage));
        });
        registry
            .slot(scratch)
            .set_sequence(registry.slot(source).sequence());
        registry.unlock_frames(&[source, scratch], "freeze copy");

        self.release_current(registry);
        registry.safe_enqueue(BufferQueue::Pause, scratch);
        debug!("frozen pixels of {source} into scratch {scratch}");
        true
    }

    /// Returns the frozen frame to the normal flow and empties `pause`.
    ///
    /// The scratch slot goes straight back to `free`; a retained frame
    /// rejoins `displayed` so the next reclaim sweep can poll it out.
    pub fn unfreeze(&self, registry: &Registry) {
        while let Some(id) = registry.head(BufferQueue::Pause) {
            if id == registry.scratch_id() {
                registry.safe_enqueue(BufferQueue::Reclaimable, id);
                registry.release_to_free(id);
            } else {
                registry.safe_enqueue(BufferQueue::Displayed, id);
            }
            debug!("unfroze {id}");
        }
    }

    /// Releases whatever currently occupies `pause` without ending the
    /// paused state; used when replacing the frozen frame.
    fn release_current(&self, registry: &Registry) {
        while let Some(id) = registry.head(BufferQueue::Pause) {
            if id == registry.scratch_id() {
                registry.safe_enqueue(BufferQueue::Reclaimable, id);
                registry.release_to_free(id);
            } else {
                registry.safe_enqueue(BufferQueue::Displayed, id);
            }
        }
    }
}
