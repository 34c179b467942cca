//! Presenter driver thread.
//!
//! Owns the display cadence: every tick it picks the next frame from the
//! pool, shows it and reports it done. Playback-control commands arrive on a
//! channel so the decoder side never touches presentation state directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{PoolError, Result};
use crate::pool::FramePool;

/// Playback-control commands accepted by the presenter thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterCommand {
    /// Resume normal playback, releasing any frozen frame.
    Play,
    /// Freeze the current frame and keep re-showing it.
    Pause,
    /// Flush queued frames for a seek. `next_is_keyframe` says whether the
    /// decode restarts on a keyframe, allowing a full flush.
    Seek {
        /// True when the post-seek stream resumes on a keyframe.
        next_is_keyframe: bool,
    },
    /// Exit the present loop.
    Stop,
}

/// Handle to the background presenter thread.
pub struct PresenterThread {
    commands: Sender<PresenterCommand>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PresenterThread {
    /// Spawns the presenter loop over `pool`, ticking every `interval`.
    pub fn spawn(pool: Arc<FramePool>, interval: Duration) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("frame-presenter".into())
            .spawn(move || present_loop(pool, rx, stop_flag, interval))
            .map_err(|e| PoolError::SpawnFailed(format!("presenter thread: {e}")))?;
        Ok(Self {
            commands: tx,
            stop,
            handle: Some(handle),
        })
    }

    /// Resumes playback.
    pub fn play(&self) {
        self.send(PresenterCommand::Play);
    }

    /// Pauses playback on the current frame.
    pub fn pause(&self) {
        self.send(PresenterCommand::Pause);
    }

    /// Flushes queued frames for a seek.
    pub fn seek(&self, next_is_keyframe: bool) {
        self.send(PresenterCommand::Seek { next_is_keyframe });
    }

    /// Stops the presenter thread. The thread is joined on drop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.send(PresenterCommand::Stop);
    }

    fn send(&self, cmd: PresenterCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("presenter thread gone, dropping {cmd:?}");
        }
    }
}

impl Drop for PresenterThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn present_loop(
    pool: Arc<FramePool>,
    commands: Receiver<PresenterCommand>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    debug!("presenter loop up (tick {interval:?})");
    let mut paused = false;
    while !stop.load(Ordering::Relaxed) {
        match commands.recv_timeout(interval) {
            Ok(PresenterCommand::Play) => {
                paused = false;
                pool.unfreeze();
            }
            Ok(PresenterCommand::Pause) => {
                paused = true;
                if !pool.freeze() {
                    debug!("pause requested with nothing to freeze yet");
                }
            }
            Ok(PresenterCommand::Seek { next_is_keyframe }) => {
                pool.discard_frames(next_is_keyframe);
                if paused {
                    pool.freeze();
                }
            }
            Ok(PresenterCommand::Stop) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !tick(&pool, paused) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("presenter loop down");
}

/// One presentation tick. Returns false when the pool has been torn down.
fn tick(pool: &FramePool, paused: bool) -> bool {
    if paused {
        // keep the frozen frame on screen; late pauses freeze once a frame
        // becomes available
        if pool.is_frozen() || pool.freeze() {
            if let Some(id) = pool.next_frame_to_show() {
                match pool.show(id) {
                    Ok(()) => {}
                    Err(PoolError::PoolTornDown) => return false,
                    Err(e) => warn!("{id}: re-showing pause frame failed: {e}"),
                }
            }
        }
        pool.reclaim_sweep();
        return true;
    }

    if !pool.enough_decoded_to_display() {
        pool.reclaim_sweep();
        return true;
    }
    let Some(id) = pool.next_frame_to_show() else {
        pool.reclaim_sweep();
        return true;
    };
    match pool.show(id) {
        Ok(()) => {
            pool.done_displaying_frame();
            true
        }
        Err(PoolError::PoolTornDown) => false,
        Err(e) => {
            warn!("{id}: present failed, discarding: {e}");
            if let Err(e) = pool.discard_frame(id) {
                warn!("{id}: discard after failed present also failed: {e}");
            }
            true
        }
    }
}
