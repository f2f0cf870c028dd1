//! PoseFeed - shared memory feed of camera frames and pose landmarks
//!
//! A capture producer publishes, per camera, the latest RGB frame and the
//! body landmarks estimated from it into a POSIX shared memory region that
//! an external consumer maps.
//!
//! # Architecture
//!
//! - **Channel**: one shared memory object + one named semaphore + one
//!   readiness marker file, per camera
//! - **Layout**: `[frame: W*H*3 bytes][JSON landmarks, zero padded]`
//! - **Writes**: latest value overwrite under the named semaphore; no
//!   history, no backpressure
//!
//! Either side may start first: the producer creates the region when it
//! is missing and attaches when it exists.

pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod layout;
pub mod pose;
pub mod readiness;
pub mod semaphore;
pub mod shm;
pub mod stop;

pub use capture::{
    launch_camera, spawn_camera, CaptureDriver, CaptureStats, FrameSource, PoseEstimator,
};
pub use channel::{ChannelSnapshot, ChannelState, FramePoseChannel};
pub use config::{CameraNames, ChannelConfig, ProducerConfig, RetryPolicy};
pub use error::{PoseFeedError, Result};
pub use layout::{ChannelLayout, Span};
pub use pose::{Landmark, PoseFrame};
pub use stop::StopSignal;
