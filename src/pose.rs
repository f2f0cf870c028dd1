//! Pose landmarks and their metadata encoding
//!
//! The metadata sub-region holds one JSON object:
//!
//! ```text
//! {"timestamp":1718000000000,"keypoints":{"0":{"x":0.51,"y":0.2},"1":{...}}}
//! ```
//!
//! left-aligned and padded with zero bytes up to the reserved capacity.

use crate::error::{PoseFeedError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One body landmark
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Normalized `[0, 1]` or pixel-scaled
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f64>,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            visibility: None,
        }
    }

    pub fn with_depth(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_visibility(mut self, visibility: f64) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Normalized coordinates to pixels of a `width` x `height` frame
    pub fn scaled(self, width: usize, height: usize) -> Self {
        Self {
            x: self.x * width as f64,
            y: self.y * height as f64,
            ..self
        }
    }
}

/// Landmarks estimated from one frame
///
/// An empty set means nobody was detected; it is still published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    #[serde(rename = "keypoints", default)]
    pub landmarks: BTreeMap<u32, Landmark>,
}

impl PoseFrame {
    pub fn new(
        timestamp_millis: i64,
        landmarks: impl IntoIterator<Item = (u32, Landmark)>,
    ) -> Self {
        Self {
            timestamp_millis,
            landmarks: landmarks.into_iter().collect(),
        }
    }

    /// Stamp with the current wall-clock time
    pub fn now(landmarks: impl IntoIterator<Item = (u32, Landmark)>) -> Self {
        Self::new(now_millis(), landmarks)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    /// Serialize to compact JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(PoseFeedError::Metadata)
    }

    /// Parse a metadata sub-region, ignoring the zero padding
    pub fn decode(region: &[u8]) -> Result<Self> {
        serde_json::from_slice(trim_padding(region)).map_err(PoseFeedError::Metadata)
    }
}

/// Left-align `payload` in a zero-filled buffer of `capacity` bytes
pub fn pad_metadata(payload: &[u8], capacity: usize) -> Result<Vec<u8>> {
    if payload.len() > capacity {
        return Err(PoseFeedError::PayloadTooLarge {
            max: capacity,
            got: payload.len(),
        });
    }
    let mut padded = vec![0u8; capacity];
    padded[..payload.len()].copy_from_slice(payload);
    Ok(padded)
}

/// Payload up to the first zero byte
pub fn trim_padding(region: &[u8]) -> &[u8] {
    let end = region.iter().position(|b| *b == 0).unwrap_or(region.len());
    &region[..end]
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
