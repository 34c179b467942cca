//! framepool: a frame-buffer pool and display state machine for video playback
//!
//! This crate sits between a video decoder and a display presenter. It owns a
//! fixed set of preallocated frame buffers and tracks each one through named
//! lifecycle queues:
//!
//! ```text
//! free → limbo → used → displayed → reclaimable → free
//!                   \→ pause ─────→ reclaimable
//! ```
//!
//! The decoder acquires free frames, fills them and submits them; a
//! presenter thread shows them and the reclaim sweep returns them to `free`
//! once the display back-end confirms the display engine has let go of the
//! underlying surface. On-screen-display frames can be attached as overlay
//! children of video frames, which orders reclamation: a video frame never
//! returns to the decoder while its overlay is still on screen.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framepool::{
//!     select_bridge, BridgeFactory, Dimensions, FramePool, PixelFormat, PoolConfig,
//!     SoftwareBridgeFactory,
//! };
//!
//! let dims = Dimensions::new(1920, 1080);
//! let factories: Vec<Box<dyn BridgeFactory>> = vec![Box::new(SoftwareBridgeFactory)];
//! let bridge = select_bridge(&factories, dims)?;
//! let pool = FramePool::new(PoolConfig::default(), Arc::from(bridge), PixelFormat::Yuv420p, dims)?;
//!
//! // decoder side
//! let frame = pool.get_next_free_frame(false)?;
//! pool.fill_frame(frame, |storage| {
//!     // write decoded pixels into storage.planes
//! });
//! pool.submit(frame);
//!
//! // presenter side
//! if let Some(next) = pool.next_frame_to_show() {
//!     pool.show(next)?;
//!     pool.done_displaying_frame();
//! }
//! # Ok::<(), framepool::PoolError>(())
//! ```

pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod handles;
pub mod overlay;
pub mod pause;
pub mod pool;
pub mod registry;

pub use bridge::{
    select_bridge, sync_surface, BridgeFactory, FieldMode, PresentationBridge, Rect,
    SoftwareBridge, SoftwareBridgeFactory, SurfaceHandle, SurfaceStatus,
};
pub use config::PoolConfig;
pub use driver::{PresenterCommand, PresenterThread};
pub use error::{PoolError, Result};
pub use frame::{Dimensions, FrameId, FrameSlot, FrameStorage, PixelFormat, Plane};
pub use pool::FramePool;
pub use registry::{BufferQueue, Registry};
