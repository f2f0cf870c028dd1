//! Byte layout of a frame/pose region
//!
//! ```text
//! 0                 frame_size                      total_size
//! | RGB frame, row-major | UTF-8 JSON, zero padded  |
//! ```
//!
//! No header and no length prefixes: both sides derive the offsets from
//! the same configuration.

use crate::config::ChannelConfig;
use crate::error::Result;

/// A contiguous byte range inside a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    /// One past the last byte, `None` if that overflows `usize`
    #[inline]
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }
}

/// Offsets and sizes of the two sub-regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub frame_offset: usize,
    pub frame_size: usize,
    pub metadata_offset: usize,
    pub metadata_size: usize,
    pub total_size: usize,
}

impl ChannelLayout {
    /// Compute the layout for a configuration
    pub fn compute(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;

        let frame_size = config.frame_size();
        Ok(Self {
            frame_offset: 0,
            frame_size,
            metadata_offset: frame_size,
            metadata_size: config.metadata_capacity,
            total_size: frame_size + config.metadata_capacity,
        })
    }

    #[inline]
    pub fn frame(&self) -> Span {
        Span {
            offset: self.frame_offset,
            len: self.frame_size,
        }
    }

    #[inline]
    pub fn metadata(&self) -> Span {
        Span {
            offset: self.metadata_offset,
            len: self.metadata_size,
        }
    }
}
