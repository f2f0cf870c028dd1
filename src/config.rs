//! Producer configuration
//!
//! The JSON file is shared with the consumer application, so key names
//! follow its upper-case convention (`WIDTH`, `HEIGHT`, `JSON_SIZE`, ...).

use crate::error::{PoseFeedError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Packed RGB
pub const BYTES_PER_PIXEL: usize = 3;

pub const DEFAULT_WIDTH: usize = 640;
pub const DEFAULT_HEIGHT: usize = 480;
pub const DEFAULT_METADATA_CAPACITY: usize = 4096;

/// Default delay between attach attempts while waiting for the peer
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const READY_SUFFIX: &str = ".ready";

/// Geometry of one frame/pose channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Frame width in pixels
    pub frame_width: usize,
    /// Frame height in pixels
    pub frame_height: usize,
    /// Bytes per pixel, always 3 for RGB
    pub bytes_per_pixel: usize,
    /// Bytes reserved for the serialized landmarks
    pub metadata_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame_width: DEFAULT_WIDTH,
            frame_height: DEFAULT_HEIGHT,
            bytes_per_pixel: BYTES_PER_PIXEL,
            metadata_capacity: DEFAULT_METADATA_CAPACITY,
        }
    }
}

impl ChannelConfig {
    pub fn new(frame_width: usize, frame_height: usize, metadata_capacity: usize) -> Self {
        Self {
            frame_width,
            frame_height,
            bytes_per_pixel: BYTES_PER_PIXEL,
            metadata_capacity,
        }
    }

    /// Reject geometries that cannot back a channel
    pub fn validate(&self) -> Result<()> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(PoseFeedError::InvalidConfig(format!(
                "frame dimensions must be positive, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if self.bytes_per_pixel == 0 {
            return Err(PoseFeedError::InvalidConfig(
                "bytes per pixel must be positive".to_string(),
            ));
        }
        if self.metadata_capacity == 0 {
            return Err(PoseFeedError::InvalidConfig(
                "metadata capacity must be positive".to_string(),
            ));
        }
        self.checked_total_size().map(|_| ())
    }

    /// `width * height * bytes_per_pixel`
    pub fn frame_size(&self) -> usize {
        self.frame_width * self.frame_height * self.bytes_per_pixel
    }

    /// Frame plus metadata
    pub fn total_size(&self) -> usize {
        self.frame_size() + self.metadata_capacity
    }

    fn checked_total_size(&self) -> Result<usize> {
        self.frame_width
            .checked_mul(self.frame_height)
            .and_then(|px| px.checked_mul(self.bytes_per_pixel))
            .and_then(|frame| frame.checked_add(self.metadata_capacity))
            .ok_or_else(|| {
                PoseFeedError::InvalidConfig(format!(
                    "{}x{} frame with {} metadata bytes overflows",
                    self.frame_width, self.frame_height, self.metadata_capacity
                ))
            })
    }
}

/// How long to wait for a peer to create a shared object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self {
            interval: Duration::ZERO,
            max_attempts: Some(1),
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Names one camera's channel is reachable under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraNames {
    /// POSIX shared memory name, with leading `/`
    pub shm_name: String,
    /// POSIX named semaphore, with leading `/`
    pub lock_name: String,
    /// Marker file polled by the consumer
    pub ready_path: PathBuf,
}

impl CameraNames {
    /// Derive all names from the shared memory and lock names
    pub fn new(shm_name: &str, lock_name: &str, ready_dir: &Path) -> Self {
        let shm_name = posix_name(shm_name);
        let ready_path = ready_dir.join(format!("{}{}", &shm_name[1..], READY_SUFFIX));
        Self {
            shm_name,
            lock_name: posix_name(lock_name),
            ready_path,
        }
    }
}

/// Ensure exactly one leading slash
pub fn posix_name(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

/// Contents of the JSON configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawConfig {
    #[serde(default = "default_width")]
    width: i64,
    #[serde(default = "default_height")]
    height: i64,
    #[serde(default = "default_json_size")]
    json_size: i64,
    #[serde(rename = "CAM1", default = "default_cam1")]
    cam1: String,
    #[serde(rename = "CAM2", default = "default_cam2")]
    cam2: String,
    #[serde(rename = "SEM_SHM1", default = "default_sem1")]
    sem_shm1: String,
    #[serde(rename = "SEM_SHM2", default = "default_sem2")]
    sem_shm2: String,
    #[serde(default)]
    ready_dir: Option<PathBuf>,
    #[serde(default)]
    retry_interval_ms: Option<u64>,
    #[serde(default)]
    retry_max_attempts: Option<u32>,
}

fn default_width() -> i64 {
    DEFAULT_WIDTH as i64
}
fn default_height() -> i64 {
    DEFAULT_HEIGHT as i64
}
fn default_json_size() -> i64 {
    DEFAULT_METADATA_CAPACITY as i64
}

/// Sizes are signed in the file so negatives surface as invalid values
fn positive(key: &str, value: i64) -> Result<usize> {
    usize::try_from(value).ok().filter(|v| *v > 0).ok_or_else(|| {
        PoseFeedError::InvalidConfig(format!("{key} must be positive, got {value}"))
    })
}
fn default_cam1() -> String {
    "/cam1".to_string()
}
fn default_cam2() -> String {
    "/cam2".to_string()
}
fn default_sem1() -> String {
    "/semShm1".to_string()
}
fn default_sem2() -> String {
    "/semShm2".to_string()
}

/// Process-wide configuration, loaded once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub channel: ChannelConfig,
    pub retry: RetryPolicy,
    /// Directory readiness markers are written to
    pub ready_dir: PathBuf,
    cam1: (String, String),
    cam2: (String, String),
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            retry: RetryPolicy::default(),
            ready_dir: PathBuf::from("."),
            cam1: (default_cam1(), default_sem1()),
            cam2: (default_cam2(), default_sem2()),
        }
    }
}

impl ProducerConfig {
    /// Load from a JSON file
    ///
    /// Without `READY_DIR` the markers go to the application directory,
    /// the parent of the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PoseFeedError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig =
            serde_json::from_str(&text).map_err(|source| PoseFeedError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let app_dir = path
            .parent()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_raw(raw, app_dir)
    }

    /// Parse from a JSON string, markers default to `.`
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|source| {
            PoseFeedError::ConfigParse {
                path: PathBuf::from("<inline>"),
                source,
            }
        })?;
        Self::from_raw(raw, Path::new("."))
    }

    fn from_raw(raw: RawConfig, app_dir: &Path) -> Result<Self> {
        let channel = ChannelConfig::new(
            positive("WIDTH", raw.width)?,
            positive("HEIGHT", raw.height)?,
            positive("JSON_SIZE", raw.json_size)?,
        );
        channel.validate()?;

        let mut retry = RetryPolicy::default();
        if let Some(ms) = raw.retry_interval_ms {
            retry.interval = Duration::from_millis(ms);
        }
        if let Some(max) = raw.retry_max_attempts {
            if max == 0 {
                return Err(PoseFeedError::InvalidConfig(
                    "RETRY_MAX_ATTEMPTS must be positive".to_string(),
                ));
            }
            retry.max_attempts = Some(max);
        }

        Ok(Self {
            channel,
            retry,
            ready_dir: raw.ready_dir.unwrap_or_else(|| app_dir.to_path_buf()),
            cam1: (raw.cam1, raw.sem_shm1),
            cam2: (raw.cam2, raw.sem_shm2),
        })
    }

    /// Names for a camera index: 0 maps to CAM1, anything else to CAM2
    pub fn camera(&self, index: u32) -> CameraNames {
        let (shm, sem) = if index == 0 { &self.cam1 } else { &self.cam2 };
        CameraNames::new(shm, sem, &self.ready_dir)
    }
}
