//! Error types for PoseFeed

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for PoseFeed operations
pub type Result<T> = std::result::Result<T, PoseFeedError>;

/// Errors that can occur while producing a frame/pose feed
#[derive(Debug, Error)]
pub enum PoseFeedError {
    /// Configuration cannot describe a usable channel
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read the configuration file
    #[error("Failed to read config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration file is not valid JSON for this schema
    #[error("Failed to parse config '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Object name does not fit the POSIX name limit
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Attached to an object whose size differs from the local layout
    #[error("Shared memory '{name}' has {got} bytes, layout needs {expected}")]
    RegionSizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Peer never made the shared memory available
    #[error("Channel '{name}' unavailable after {attempts} attempts")]
    ChannelUnavailable { name: String, attempts: u32 },

    /// Failed to create or open the named semaphore
    #[error("Failed to open semaphore '{name}': {source}")]
    SemaphoreOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to take or give back the named lock
    #[error("Lock '{name}' failed: {source}")]
    LockAcquireFailure {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Frame does not match the configured frame size
    #[error("Frame size mismatch: expected {expected} bytes, got {got} bytes")]
    FrameSizeMismatch { expected: usize, got: usize },

    /// Payload larger than its reserved sub-region
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// Channel was already closed
    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    /// Camera could not be opened or stopped delivering frames
    #[error("Capture unavailable for camera {camera}: {reason}")]
    CaptureUnavailable { camera: u32, reason: String },

    /// Pose estimation failed for a frame
    #[error("Pose estimation failed: {0}")]
    Estimation(String),

    /// Landmark metadata could not be encoded or parsed
    #[error("Malformed landmark metadata: {0}")]
    Metadata(#[source] serde_json::Error),
}

impl PoseFeedError {
    /// Whether the capture loop may drop the current cycle and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoseFeedError::FrameSizeMismatch { .. }
                | PoseFeedError::PayloadTooLarge { .. }
                | PoseFeedError::Estimation(_)
                | PoseFeedError::Metadata(_)
        )
    }
}
