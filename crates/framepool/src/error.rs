//! Error types for the frame pool.

use crate::frame::FrameId;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur while operating the frame pool.
///
/// All variants are recoverable by the caller. Structural invariant
/// violations (a frame in two queues, a negative lock count) are *not*
/// represented here: they indicate a logic defect and abort with a
/// diagnostic dump instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No free frame became available within the bounded wait.
    PoolExhausted,
    /// A forced discard found the frame lock still held after the bounded
    /// wait. The frame is parked for the next reclaim sweep.
    FrameBusy {
        /// The frame that could not be discarded
        id: FrameId,
        /// Owner tags holding the lock at the time of failure
        tags: Vec<&'static str>,
    },
    /// Overlay attach violation: one of the endpoints is already part of an
    /// attachment, or the link would form a chain or self-loop.
    AlreadyAttached {
        /// Intended parent frame
        parent: FrameId,
        /// Intended child frame
        child: FrameId,
    },
    /// The pool has been torn down; all pending and future calls fail fast.
    PoolTornDown,
    /// The presentation back-end reported an error during a status query,
    /// flush, present or composite call. Non-fatal: the affected frame is
    /// discarded and skipped.
    BackendSync(String),
    /// The presenter thread could not be started.
    SpawnFailed(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::PoolExhausted => write!(f, "no free frame available"),
            PoolError::FrameBusy { id, tags } => {
                write!(f, "frame {id} still locked by {tags:?}")
            }
            PoolError::AlreadyAttached { parent, child } => {
                write!(f, "cannot attach {child} to {parent}: already attached")
            }
            PoolError::PoolTornDown => write!(f, "pool has been torn down"),
            PoolError::BackendSync(msg) => write!(f, "back-end sync failure: {msg}"),
            PoolError::SpawnFailed(msg) => write!(f, "thread spawn failed: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}
