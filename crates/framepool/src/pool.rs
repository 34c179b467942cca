//! The frame pool facade: acquisition, display and reclamation.
//!
//! [`FramePool`] ties the registry, the presentation bridge, the overlay
//! manager and the pause controller together behind the surface the decoder
//! and presenter actually call. The decoder side acquires, fills and submits
//! frames; the presenter side shows them, reports them done and lets the
//! reclaim sweep return them to `free` once the back-end confirms the
//! display engine has let go.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bridge::{sync_surface, FieldMode, PresentationBridge, Rect};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::frame::{Dimensions, FrameId, FrameStorage, PixelFormat};
use crate::handles;
use crate::overlay::OverlayManager;
use crate::pause::PauseController;
use crate::registry::{BufferQueue, Registry};

/// Acquisition attempts before giving up with `PoolExhausted`.
const ACQUIRE_ATTEMPTS: u32 = 4;
/// Wait for a freed frame between acquisition attempts.
const ACQUIRE_WAIT: Duration = Duration::from_millis(15);
/// Total bounded wait for an overlay frame acquisition.
const OVERLAY_ACQUIRE_TOTAL: Duration = Duration::from_millis(250);
/// Wait slice between overlay acquisition attempts.
const OVERLAY_ACQUIRE_WAIT: Duration = Duration::from_millis(25);

/// A fixed pool of reusable frame buffers shared by a decoder and a
/// presenter, with explicit lifecycle queues and back-end completion
/// tracking.
pub struct FramePool {
    config: PoolConfig,
    reserve: usize,
    registry: Registry,
    bridge: Arc<dyn PresentationBridge>,
    overlay: OverlayManager,
    pause: PauseController,
    last_shown_sequence: AtomicU64,
    dims: Dimensions,
}

impl FramePool {
    /// Builds a pool on top of an already-selected presentation bridge.
    ///
    /// The requested size is clamped against the bridge's surface budget.
    /// On accelerated bridges every slot (scratch included) gets a native
    /// surface up front; surfaces live until pool teardown.
    pub fn new(
        config: PoolConfig,
        bridge: Arc<dyn PresentationBridge>,
        format: PixelFormat,
        dims: Dimensions,
    ) -> Result<Self> {
        let pool_size = config.effective_pool_size(bridge.surface_budget());
        let reserve = config.effective_overlay_reservation(pool_size);
        let registry = Registry::new(pool_size, format, dims);

        if bridge.is_accelerated() {
            for slot in registry.slots() {
                let token = match bridge.create_surface(dims) {
                    Ok(t) => t,
                    Err(e) => {
                        for earlier in registry.slots() {
                            if let Some(t) = earlier.take_render_token() {
                                handles::global().unregister(t);
                                bridge.destroy_surface(t);
                            }
                        }
                        return Err(e);
                    }
                };
                handles::global().register(token, "frame-pool");
                slot.with_content_mut(|c| c.render_token = Some(token));
            }
        }

        info!(
            "frame pool up: {pool_size} slots + scratch, {} reserved for overlays, \
             back-end {}",
            reserve,
            bridge.name()
        );
        let overlay = OverlayManager::new(config.aggressive_reclaim);
        Ok(Self {
            config,
            reserve,
            registry,
            bridge,
            overlay,
            pause: PauseController::new(),
            last_shown_sequence: AtomicU64::new(0),
            dims,
        })
    }

    /// Returns the registry (queue state, per-frame slots).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the presentation bridge the pool was built on.
    pub fn bridge(&self) -> &Arc<dyn PresentationBridge> {
        &self.bridge
    }

    /// Returns the frame dimensions the pool was sized for.
    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    // --- decoder side -------------------------------------------------------

    /// Claims a free frame for decoding (`free → limbo`).
    ///
    /// Runs a reclaim sweep and retries with short waits when nothing is
    /// free. With `allow_unsafe` set, a starved caller may be handed the
    /// scratch frame as a last resort; doing so disables the software pause
    /// copy until the frame comes back.
    pub fn get_next_free_frame(&self, allow_unsafe: bool) -> Result<FrameId> {
        for attempt in 0..ACQUIRE_ATTEMPTS {
            if self.registry.torn_down() {
                return Err(PoolError::PoolTornDown);
            }
            if let Some(id) = self.registry.try_acquire_free(self.reserve, false) {
                return Ok(id);
            }
            self.reclaim_sweep();
            if let Some(id) = self.registry.try_acquire_free(self.reserve, false) {
                return Ok(id);
            }
            if attempt + 1 < ACQUIRE_ATTEMPTS
                && !self.registry.wait_for_free(self.reserve, false, ACQUIRE_WAIT)
            {
                return Err(PoolError::PoolTornDown);
            }
        }
        if allow_unsafe {
            if let Some(id) = self.registry.try_acquire_free(0, true) {
                warn!("handing out {id} under starvation (scratch allowed)");
                return Ok(id);
            }
        }
        warn!("pool exhausted: {}", self.registry.status_string());
        Err(PoolError::PoolExhausted)
    }

    /// Claims a free frame for an overlay (`free → limbo`), dipping into the
    /// overlay reservation. Waits a bounded total time for one to free up.
    pub fn acquire_for_overlay(&self) -> Result<FrameId> {
        let deadline = Instant::now() + OVERLAY_ACQUIRE_TOTAL;
        loop {
            if self.registry.torn_down() {
                return Err(PoolError::PoolTornDown);
            }
            if let Some(id) = self.registry.try_acquire_free(0, false) {
                return Ok(id);
            }
            self.reclaim_sweep();
            if let Some(id) = self.registry.try_acquire_free(0, false) {
                return Ok(id);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("overlay acquisition timed out: {}", self.registry.status_string());
                return Err(PoolError::PoolExhausted);
            }
            if !self
                .registry
                .wait_for_free(0, false, OVERLAY_ACQUIRE_WAIT.min(deadline - now))
            {
                return Err(PoolError::PoolTornDown);
            }
        }
    }

    /// Runs `f` on the frame's pixel storage under the advisory lock.
    /// The decoder's fill window.
    pub fn fill_frame<R>(&self, id: FrameId, f: impl FnOnce(&mut FrameStorage) -> R) -> R {
        self.registry.lock_frame(id, "decoder fill");
        let result = self.registry.slot(id).with_content_mut(|c| f(&mut c.storage));
        self.registry.unlock_frame(id, "decoder fill");
        result
    }

    /// Hands a filled frame to the display side (`limbo → used`), assigning
    /// its display-order sequence number.
    pub fn submit(&self, id: FrameId) -> u64 {
        self.registry.submit(id)
    }

    /// Attaches `child` as the overlay frame of `parent`.
    pub fn attach_overlay(&self, parent: FrameId, child: FrameId) -> Result<()> {
        self.overlay.attach(&self.registry, parent, child)
    }

    /// Detaches and returns the overlay frame of `parent`, if any.
    pub fn detach_overlay(&self, parent: FrameId) -> Option<FrameId> {
        self.overlay.detach(&self.registry, parent)
    }

    /// True once enough frames are queued for display to start.
    pub fn enough_decoded_to_display(&self) -> bool {
        self.registry.size(BufferQueue::Used) >= self.config.frames_needed_before_display
    }

    // --- presenter side -----------------------------------------------------

    /// Returns the frame the presenter should show next: the frozen pause
    /// frame while one exists, otherwise the oldest undisplayed frame.
    pub fn next_frame_to_show(&self) -> Option<FrameId> {
        self.registry
            .head(BufferQueue::Pause)
            .or_else(|| self.registry.head(BufferQueue::Used))
    }

    /// Shows `id` on the display.
    ///
    /// Waits for outstanding render work on the surface, composites the
    /// attached overlay (presenting without it if its frame is busy rather
    /// than stalling), presents, then records the frame as displayed. A
    /// frozen pause frame is re-shown in place and stays in `pause`;
    /// showing any other frame drops a stale frozen frame.
    pub fn show(&self, id: FrameId) -> Result<()> {
        if self.registry.torn_down() {
            return Err(PoolError::PoolTornDown);
        }
        let from_pause = self.registry.contains(BufferQueue::Pause, id);

        self.registry.lock_frame(id, "show");
        let presented = self.present_frame(id);
        self.registry.unlock_frame(id, "show");
        presented?;

        if !from_pause {
            let seq = self.registry.slot(id).sequence();
            let previous = self.last_shown_sequence.fetch_max(seq, Ordering::AcqRel);
            if seq < previous {
                warn!("{id} shown out of order (seq {seq} after {previous})");
            }
        }
        if self.registry.contains(BufferQueue::Used, id) {
            self.registry.mark_displayed(id);
        }
        if !from_pause {
            // normal playback has resumed; a leftover frozen frame is stale
            while let Some(stale) = self.registry.head(BufferQueue::Pause) {
                if let Err(e) = self.discard_frame(stale) {
                    warn!("{stale}: stale pause frame discard failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bridge interaction for [`FramePool::show`], run under the frame lock.
    ///
    /// On a software bridge the frame carries no render token and the
    /// presenter consumes pixels straight from storage, so there is nothing
    /// to hand to the back-end here.
    fn present_frame(&self, id: FrameId) -> Result<()> {
        let Some(token) = self.registry.slot(id).with_content(|c| c.render_token) else {
            return Ok(());
        };
        sync_surface(&*self.bridge, token)?;

        let mut shown_child = None;
        if let Some(child) = self.registry.child_of(id) {
            if self.registry.try_lock_frame(child, "show overlay") {
                let ctoken = self.registry.slot(child).with_content(|c| c.render_token);
                if let Some(ct) = ctoken {
                    if let Err(e) = self.bridge.composite(ct, token) {
                        warn!("overlay composite onto {id} failed: {e}");
                    }
                }
                shown_child = Some(child);
            } else {
                // never stall the video on a busy overlay frame
                warn!("{id}: overlay frame busy, presenting without it");
            }
        }

        let rect = Rect::full(self.dims);
        let presented = self.bridge.present(token, rect, rect, FieldMode::Frame);

        if let Some(child) = shown_child {
            self.registry.unlock_frame(child, "show overlay");
            if presented.is_ok() && !self.registry.contains(BufferQueue::Displayed, child) {
                self.registry.safe_enqueue(BufferQueue::Displayed, child);
            }
        }
        presented
    }

    /// Marks the most recently shown frame as done and tries to reclaim it
    /// (and its overlay) immediately instead of waiting for the next full
    /// sweep.
    pub fn done_displaying_frame(&self) {
        let Some(id) = self
            .registry
            .tail(BufferQueue::Displayed)
            .or_else(|| self.registry.head(BufferQueue::Used))
        else {
            return;
        };
        self.sweep_one(id);
        self.drain_reclaimable();
    }

    // --- discard paths ------------------------------------------------------

    /// Removes `id` from the pipeline, returning it to `free` when the
    /// display engine is done with it.
    ///
    /// A frame still on screen, or a parent whose overlay is unresolved,
    /// is parked in `displayed` for later sweeps instead. A frame whose
    /// advisory lock stays held is parked in `reclaimable`.
    pub fn discard_frame(&self, id: FrameId) -> Result<()> {
        self.registry.lock_frame(id, "discard check");
        let verdict = self.discard_verdict(id);
        self.registry.unlock_frame(id, "discard check");

        let displaying = match verdict {
            Ok(d) => d,
            Err(e) => {
                warn!("{id}: completion poll failed during discard: {e}");
                false
            }
        };

        if !displaying {
            // a discarded overlay child releases its parent
            if let Some(parent) = self.registry.parent_of(id) {
                self.overlay.detach(&self.registry, parent);
            }
        }
        if displaying || self.registry.child_of(id).is_some() {
            if !self.registry.contains(BufferQueue::Displayed, id) {
                self.registry.safe_enqueue(BufferQueue::Displayed, id);
            }
            debug!("{id}: discard deferred (on screen or overlay unresolved)");
            return Ok(());
        }
        match self.registry.discard(id) {
            Ok(()) => Ok(()),
            Err(PoolError::FrameBusy { id, tags }) => {
                warn!("{id} held during discard ({tags:?}), deferring to sweep");
                self.registry.safe_enqueue(BufferQueue::Reclaimable, id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Settles render work on `id` and reports whether the display engine is
    /// still reading it, folding in the attached overlay's status under the
    /// same proxy policy as the reclaim sweep. Runs under the frame lock.
    fn discard_verdict(&self, id: FrameId) -> Result<bool> {
        let mut displaying = false;
        if let Some(token) = self.registry.slot(id).with_content(|c| c.render_token) {
            sync_surface(&*self.bridge, token)?;
            displaying = self.bridge.query_status(token)?.displaying;
        }
        if let Some(child) = self.registry.child_of(id) {
            let child_displaying = if self.bridge.polls_child_surfaces() {
                match self.registry.slot(child).with_content(|c| c.render_token) {
                    Some(ct) => self.bridge.query_status(ct)?.displaying,
                    None => false,
                }
            } else {
                displaying
            };
            displaying |= child_displaying;
        }
        Ok(displaying)
    }

    /// Flushes queued frames on seek or stream discontinuity.
    ///
    /// Undisplayed frames (`used`, `limbo`) are always dropped. When the
    /// next frame is a keyframe nothing on screen can survive either: the
    /// frozen pause frame and all displayed frames are discarded and the
    /// reclaimable queue is drained. Otherwise displayed frames are left to
    /// the normal sweep so the picture holds until decode catches up.
    pub fn discard_frames(&self, next_is_keyframe: bool) {
        debug!(
            "discarding queued frames (keyframe {next_is_keyframe}): {}",
            self.registry.status_string()
        );
        for id in self
            .registry
            .snapshot(BufferQueue::Displayed)
            .into_iter()
            .chain(self.registry.snapshot(BufferQueue::Pause))
        {
            if let Some(token) = self.registry.slot(id).with_content(|c| c.render_token) {
                self.registry.lock_frame(id, "discard frames sync");
                if let Err(e) = sync_surface(&*self.bridge, token) {
                    warn!("{id}: sync before discard failed: {e}");
                }
                self.registry.unlock_frame(id, "discard frames sync");
            }
        }

        for id in self
            .registry
            .snapshot(BufferQueue::Used)
            .into_iter()
            .chain(self.registry.snapshot(BufferQueue::Limbo))
        {
            if let Err(e) = self.discard_frame(id) {
                warn!("{id}: discard failed: {e}");
            }
        }

        if next_is_keyframe {
            while let Some(id) = self.registry.head(BufferQueue::Pause) {
                self.registry.safe_enqueue(BufferQueue::Displayed, id);
            }
            for id in self.registry.snapshot(BufferQueue::Displayed) {
                if self.registry.contains(BufferQueue::Free, id) {
                    continue;
                }
                if let Some(child) = self.overlay.detach(&self.registry, id) {
                    if let Err(e) = self.discard_frame(child) {
                        warn!("{child}: overlay discard failed: {e}");
                    }
                }
                if let Err(e) = self.discard_frame(id) {
                    warn!("{id}: discard failed: {e}");
                }
            }
            self.drain_reclaimable();
        } else {
            self.reclaim_sweep();
        }
    }

    // --- reclamation --------------------------------------------------------

    /// Polls every displayed frame for completion and returns the ones the
    /// display engine has released to `free`. Returns the number freed.
    pub fn reclaim_sweep(&self) -> usize {
        self.overlay.deep_free_sweep(&self.registry, &*self.bridge);
        for id in self.registry.snapshot(BufferQueue::Displayed) {
            self.sweep_one(id);
        }
        self.drain_reclaimable()
    }

    /// Completion poll for a single displayed frame. Skips (rather than
    /// waits on) a frame whose advisory lock is held; the next sweep will
    /// see it again.
    fn sweep_one(&self, id: FrameId) {
        if !self.registry.contains(BufferQueue::Displayed, id) {
            return;
        }
        if !self.registry.try_lock_frame(id, "reclaim sweep") {
            return;
        }
        let verdict = self.overlay.resolve_for_reclaim(&self.registry, &*self.bridge, id);
        self.registry.unlock_frame(id, "reclaim sweep");
        match verdict {
            Ok(true) => self.registry.safe_enqueue(BufferQueue::Reclaimable, id),
            Ok(false) => {}
            Err(e) => {
                warn!("{id}: completion poll failed, forcing discard: {e}");
                if let Err(e) = self.registry.discard(id) {
                    warn!("{id}: forced discard failed: {e}");
                }
            }
        }
    }

    fn drain_reclaimable(&self) -> usize {
        let mut freed = 0;
        for id in self.registry.snapshot(BufferQueue::Reclaimable) {
            if self.registry.release_to_free(id) {
                freed += 1;
            }
        }
        freed
    }

    // --- pause handling -----------------------------------------------------

    /// Freezes a frame for the paused/stalled state. See
    /// [`PauseController::freeze`].
    pub fn freeze(&self) -> bool {
        self.pause.freeze(&self.registry, &*self.bridge)
    }

    /// Releases the frozen frame back into the normal flow.
    pub fn unfreeze(&self) {
        self.pause.unfreeze(&self.registry);
        self.reclaim_sweep();
    }

    /// True while a frozen frame exists.
    pub fn is_frozen(&self) -> bool {
        self.pause.is_frozen(&self.registry)
    }

    // --- teardown -----------------------------------------------------------

    /// One line of queue composition for logs.
    pub fn status_string(&self) -> String {
        self.registry.status_string()
    }

    /// Tears the pool down: wakes blocked waiters, then releases every
    /// back-end surface. Idempotent.
    pub fn teardown(&self) {
        if self.registry.torn_down() {
            return;
        }
        self.registry.teardown();
        for slot in self.registry.slots() {
            if let Some(token) = slot.take_render_token() {
                handles::global().unregister(token);
                self.bridge.destroy_surface(token);
            }
        }
        debug!("pool torn down: {}", self.registry.status_string());
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("status", &self.registry.status_string())
            .field("bridge", &self.bridge.name())
            .field("dims", &self.dims)
            .finish()
    }
}
