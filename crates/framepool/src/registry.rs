//! Frame Registry: named lifecycle queues and the two-tier locking scheme.
//!
//! Every frame slot is a member of exactly one queue at any instant:
//!
//! ```text
//! free → limbo → used → displayed → reclaimable → free
//!                   \→ pause ─────→ reclaimable
//! ```
//!
//! Queue membership lives behind a single queue-table mutex whose critical
//! sections are short and never block on I/O. Frame contents are protected
//! separately by the per-frame advisory lock in [`crate::frame::FrameSlot`],
//! which may be held across blocking back-end calls. The ordering rule is
//! fixed: a per-frame lock is never acquired while the queue-table mutex is
//! held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{PoolError, Result};
use crate::frame::{Dimensions, FrameId, FrameSlot, PixelFormat};

/// Bounded wait for the frame lock during a forced discard.
const DISCARD_LOCK_WAIT: Duration = Duration::from_millis(50);

/// Lifecycle stage of a frame, named after the queue that tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferQueue {
    /// Unused, ready for the decoder
    Free,
    /// Claimed by the decoder, being filled
    Limbo,
    /// Filled, awaiting first display
    Used,
    /// Handed to the presenter at least once
    Displayed,
    /// Frozen frame for the paused/stalled state (0 or 1 members)
    Pause,
    /// Presenter confirmed done; pending return to free
    Reclaimable,
}

const QUEUE_COUNT: usize = 6;

impl BufferQueue {
    fn index(self) -> usize {
        match self {
            BufferQueue::Free => 0,
            BufferQueue::Limbo => 1,
            BufferQueue::Used => 2,
            BufferQueue::Displayed => 3,
            BufferQueue::Pause => 4,
            BufferQueue::Reclaimable => 5,
        }
    }

    fn tag(self) -> char {
        match self {
            BufferQueue::Free => 'f',
            BufferQueue::Limbo => 'l',
            BufferQueue::Used => 'u',
            BufferQueue::Displayed => 'd',
            BufferQueue::Pause => 'p',
            BufferQueue::Reclaimable => 'r',
        }
    }
}

/// Queue membership state, all mutated atomically under one mutex.
#[derive(Debug)]
struct QueueTable {
    queues: [VecDeque<FrameId>; QUEUE_COUNT],
    membership: Vec<BufferQueue>,
    /// Overlay attachment links, index-based and symmetric:
    /// `child[p] == Some(c)` iff `parent[c] == Some(p)`.
    parent: Vec<Option<FrameId>>,
    child: Vec<Option<FrameId>>,
}

impl QueueTable {
    fn new(total: usize) -> Self {
        let mut queues: [VecDeque<FrameId>; QUEUE_COUNT] = Default::default();
        queues[BufferQueue::Free.index()] = (0..total).map(FrameId).collect();
        Self {
            queues,
            membership: vec![BufferQueue::Free; total],
            parent: vec![None; total],
            child: vec![None; total],
        }
    }

    /// Removes `id` from its recorded queue. A frame missing from the queue
    /// its membership entry names means the single-membership invariant is
    /// broken, which is fatal.
    fn remove_from_current(&mut self, id: FrameId) -> BufferQueue {
        let queue = self.membership[id.0];
        let deque = &mut self.queues[queue.index()];
        match deque.iter().position(|f| *f == id) {
            Some(pos) => {
                deque.remove(pos);
                queue
            }
            None => panic!(
                "{id} recorded in {queue:?} but absent from it: {}",
                self.render_status()
            ),
        }
    }

    fn enqueue(&mut self, queue: BufferQueue, id: FrameId) {
        self.queues[queue.index()].push_back(id);
        self.membership[id.0] = queue;
    }

    fn unlink(&mut self, id: FrameId) {
        if let Some(c) = self.child[id.0].take() {
            self.parent[c.0] = None;
        }
        if let Some(p) = self.parent[id.0].take() {
            self.child[p.0] = None;
        }
    }

    fn render_status(&self) -> String {
        let per_frame: String = self
            .membership
            .iter()
            .map(|q| q.tag())
            .collect();
        format!(
            "[{per_frame}] free:{} limbo:{} used:{} displayed:{} pause:{} reclaimable:{}",
            self.queues[0].len(),
            self.queues[1].len(),
            self.queues[2].len(),
            self.queues[3].len(),
            self.queues[4].len(),
            self.queues[5].len(),
        )
    }

    #[cfg(debug_assertions)]
    fn verify(&self) {
        let total: usize = self.queues.iter().map(|q| q.len()).sum();
        assert_eq!(
            total,
            self.membership.len(),
            "queue double-membership detected: {}",
            self.render_status()
        );
    }
}

/// The fixed-size collection of frame slots and their lifecycle queues.
///
/// One extra slot beyond the decoder-visible pool (the scratch frame) backs
/// the software pause-copy path; ordinary acquisition skips it.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<FrameSlot>,
    table: Mutex<QueueTable>,
    free_available: Condvar,
    last_sequence: AtomicU64,
    torn_down: AtomicBool,
    scratch: FrameId,
}

impl Registry {
    /// Preallocates `decoder_slots + 1` frame slots (the last one is the
    /// scratch frame), all starting in `free`.
    pub fn new(decoder_slots: usize, format: PixelFormat, dims: Dimensions) -> Self {
        let total = decoder_slots + 1;
        let slots = (0..total)
            .map(|i| FrameSlot::new(FrameId(i), format, dims))
            .collect();
        Self {
            slots,
            table: Mutex::new(QueueTable::new(total)),
            free_available: Condvar::new(),
            last_sequence: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            scratch: FrameId(total - 1),
        }
    }

    /// Returns the slot for `id`.
    pub fn slot(&self, id: FrameId) -> &FrameSlot {
        &self.slots[id.0]
    }

    /// Returns all slots, scratch included.
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Returns the id of the scratch frame.
    pub fn scratch_id(&self) -> FrameId {
        self.scratch
    }

    /// Returns the number of decoder-visible slots.
    pub fn decoder_slots(&self) -> usize {
        self.slots.len() - 1
    }

    /// Returns the queue `id` currently belongs to.
    pub fn queue_of(&self, id: FrameId) -> BufferQueue {
        self.table.lock().membership[id.0]
    }

    /// Returns the number of frames in `queue`.
    pub fn size(&self, queue: BufferQueue) -> usize {
        self.table.lock().queues[queue.index()].len()
    }

    /// Returns the oldest member of `queue`.
    pub fn head(&self, queue: BufferQueue) -> Option<FrameId> {
        self.table.lock().queues[queue.index()].front().copied()
    }

    /// Returns the newest member of `queue`.
    pub fn tail(&self, queue: BufferQueue) -> Option<FrameId> {
        self.table.lock().queues[queue.index()].back().copied()
    }

    /// Returns true if `queue` contains `id`.
    pub fn contains(&self, queue: BufferQueue, id: FrameId) -> bool {
        self.table.lock().membership[id.0] == queue
    }

    /// Returns a point-in-time copy of `queue`, oldest first. Iteration over
    /// the copy happens without the queue-table lock held, so blocking
    /// per-frame work is safe against it.
    pub fn snapshot(&self, queue: BufferQueue) -> Vec<FrameId> {
        self.table.lock().queues[queue.index()]
            .iter()
            .copied()
            .collect()
    }

    /// Moves `id` into `queue`, wherever it currently is. The removal and
    /// insertion happen under one critical section, so no observer ever
    /// sees the frame in zero or two queues.
    pub fn safe_enqueue(&self, queue: BufferQueue, id: FrameId) {
        let mut table = self.table.lock();
        let from = table.remove_from_current(id);
        table.enqueue(queue, id);
        #[cfg(debug_assertions)]
        table.verify();
        drop(table);
        trace!("{id}: {from:?} -> {queue:?}");
        if queue == BufferQueue::Free {
            self.free_available.notify_all();
        }
    }

    /// Claims one free frame for the decoder (`free → limbo`).
    ///
    /// Leaves `reserve` free frames untouched for overlay acquisition and
    /// skips the scratch slot unless `allow_scratch` is set. Returns `None`
    /// when nothing suitable is free; the caller decides whether to sweep
    /// and retry.
    pub fn try_acquire_free(&self, reserve: usize, allow_scratch: bool) -> Option<FrameId> {
        let mut table = self.table.lock();
        let free = &table.queues[BufferQueue::Free.index()];
        let usable: Vec<FrameId> = free
            .iter()
            .copied()
            .filter(|id| allow_scratch || *id != self.scratch)
            .collect();
        if usable.len() <= reserve {
            return None;
        }
        let id = usable[0];
        table.remove_from_current(id);
        table.enqueue(BufferQueue::Limbo, id);
        drop(table);
        trace!("{id}: Free -> Limbo (acquired)");
        Some(id)
    }

    /// Waits up to `timeout` for a frame that [`Registry::try_acquire_free`]
    /// with the same `reserve`/`allow_scratch` arguments would accept. The
    /// predicate is re-checked around every wakeup, so a `free` queue holding
    /// only the scratch slot or reserved slots keeps the caller blocked.
    /// Returns false if the registry was torn down while waiting.
    pub fn wait_for_free(&self, reserve: usize, allow_scratch: bool, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut table = self.table.lock();
        loop {
            if self.torn_down() {
                return false;
            }
            let usable = table.queues[BufferQueue::Free.index()]
                .iter()
                .filter(|id| allow_scratch || **id != self.scratch)
                .count();
            if usable > reserve {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return !self.torn_down();
            }
            let _ = self.free_available.wait_for(&mut table, deadline - now);
        }
    }

    /// Accepts a filled frame from the decoder (`limbo → used`) and assigns
    /// its display-order sequence number.
    pub fn submit(&self, id: FrameId) -> u64 {
        let seq = self.last_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.slot(id).set_sequence(seq);
        if self.queue_of(id) != BufferQueue::Limbo {
            warn!("submit of {id} from {:?}, expected Limbo", self.queue_of(id));
        }
        self.safe_enqueue(BufferQueue::Used, id);
        trace!("{id}: submitted as seq {seq}");
        seq
    }

    /// Returns the most recently assigned sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Records that the presenter has shown `id` (`used → displayed`).
    pub fn mark_displayed(&self, id: FrameId) {
        if self.queue_of(id) != BufferQueue::Used {
            warn!(
                "mark_displayed of {id} from {:?}, expected Used",
                self.queue_of(id)
            );
        }
        self.safe_enqueue(BufferQueue::Displayed, id);
    }

    /// Returns a reclaimable frame to `free`, unless its advisory lock is
    /// still held or it is still part of an overlay attachment (neither may
    /// ever enter `free`). Returns true if the frame was freed.
    pub fn release_to_free(&self, id: FrameId) -> bool {
        if self.slot(id).lock_count() > 0 {
            trace!(
                "{id}: held by {:?}, staying in Reclaimable",
                self.slot(id).lock_tags()
            );
            return false;
        }
        {
            let table = self.table.lock();
            if table.parent[id.0].is_some() || table.child[id.0].is_some() {
                trace!("{id}: overlay attachment unresolved, staying in Reclaimable");
                return false;
            }
        }
        self.safe_enqueue(BufferQueue::Free, id);
        true
    }

    /// Forced transition to `free`, bypassing completion polling. Used on
    /// error paths and seek/flush. Waits a bounded time for the frame lock;
    /// a frame still held fails with [`PoolError::FrameBusy`] and is left
    /// for the next sweep.
    pub fn discard(&self, id: FrameId) -> Result<()> {
        if !self.slot(id).wait_unlocked(DISCARD_LOCK_WAIT) {
            return Err(PoolError::FrameBusy {
                id,
                tags: self.slot(id).lock_tags(),
            });
        }
        let mut table = self.table.lock();
        table.unlink(id);
        let from = table.remove_from_current(id);
        table.enqueue(BufferQueue::Free, id);
        #[cfg(debug_assertions)]
        table.verify();
        drop(table);
        trace!("{id}: {from:?} -> Free (discarded)");
        self.free_available.notify_all();
        Ok(())
    }

    // --- overlay attachment links ------------------------------------------

    /// Creates the symmetric parent/child link. The relation is flat: both
    /// endpoints must currently be unattached on both sides.
    pub(crate) fn link(&self, parent: FrameId, child: FrameId) -> Result<()> {
        let mut table = self.table.lock();
        let occupied = parent == child
            || table.child[parent.0].is_some()
            || table.parent[parent.0].is_some()
            || table.parent[child.0].is_some()
            || table.child[child.0].is_some();
        if occupied {
            return Err(PoolError::AlreadyAttached { parent, child });
        }
        table.child[parent.0] = Some(child);
        table.parent[child.0] = Some(parent);
        Ok(())
    }

    /// Clears the link from `parent`, returning the former child.
    /// A no-op on an unattached parent.
    pub(crate) fn unlink_child(&self, parent: FrameId) -> Option<FrameId> {
        let mut table = self.table.lock();
        let child = table.child[parent.0].take()?;
        table.parent[child.0] = None;
        Some(child)
    }

    /// Returns the attached overlay child of `id`, if any.
    pub fn child_of(&self, id: FrameId) -> Option<FrameId> {
        self.table.lock().child[id.0]
    }

    /// Returns the parent `id` is attached to, if any.
    pub fn parent_of(&self, id: FrameId) -> Option<FrameId> {
        self.table.lock().parent[id.0]
    }

    // --- per-frame advisory locks ------------------------------------------

    /// Locks `id` for content or render-token access. Blocking; see
    /// [`FrameSlot::lock`]. Must not be called with the queue-table lock
    /// held (nothing in this module does).
    pub fn lock_frame(&self, id: FrameId, tag: &'static str) {
        self.slot(id).lock(tag);
    }

    /// Non-blocking lock attempt.
    pub fn try_lock_frame(&self, id: FrameId, tag: &'static str) -> bool {
        self.slot(id).try_lock(tag)
    }

    /// Unlocks `id`. Double-unlock is fatal.
    pub fn unlock_frame(&self, id: FrameId, tag: &'static str) {
        self.slot(id).unlock(tag);
    }

    /// Locks several frames, deduplicated and in id order so two callers
    /// locking overlapping sets cannot deadlock. A frame listed twice gets
    /// its count bumped twice.
    pub fn lock_frames(&self, ids: &[FrameId], tag: &'static str) {
        let mut sorted: Vec<FrameId> = ids.to_vec();
        sorted.sort_unstable();
        let mut previous: Option<FrameId> = None;
        for id in sorted {
            if previous == Some(id) {
                self.slot(id).relock(tag);
            } else {
                self.slot(id).lock(tag);
            }
            previous = Some(id);
        }
    }

    /// Releases locks taken by [`Registry::lock_frames`].
    pub fn unlock_frames(&self, ids: &[FrameId], tag: &'static str) {
        for id in ids {
            self.slot(*id).unlock(tag);
        }
    }

    // --- teardown -----------------------------------------------------------

    /// Marks the registry torn down and wakes every blocked waiter so
    /// pending acquisitions fail with [`PoolError::PoolTornDown`].
    pub fn teardown(&self) {
        self.torn_down.store(true, Ordering::Release);
        self.free_available.notify_all();
    }

    /// Returns true once teardown has begun.
    pub fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// One line of queue composition for logs and invariant-violation dumps.
    pub fn status_string(&self) -> String {
        let mut status = self.table.lock().render_status();
        if self.torn_down() {
            status.push_str(" (torn down)");
        }
        status
    }
}
