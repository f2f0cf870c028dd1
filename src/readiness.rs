//! Readiness marker polled by the consumer
//!
//! A plain file next to the application: the consumer waits for it to
//! appear before opening the semaphore and mapping the region, so it never
//! maps a region that has not received a frame yet.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Contents written to the marker
pub const READY_SENTINEL: &[u8] = b"ready";

/// One channel's marker file
#[derive(Debug)]
pub struct ReadinessSignal {
    path: PathBuf,
    marked: bool,
}

impl ReadinessSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            marked: false,
        }
    }

    /// Write the marker the first time this is called
    ///
    /// Later calls are no-ops for the lifetime of this signal. A failed
    /// write is returned and the next call tries again.
    pub fn mark_ready_once(&mut self) -> io::Result<bool> {
        if self.marked {
            return Ok(false);
        }
        fs::write(&self.path, READY_SENTINEL)?;
        self.marked = true;
        info!(path = %self.path.display(), "readiness marker created");
        Ok(true)
    }

    /// Remove the marker; failures are logged, never returned
    pub fn clear(&mut self) {
        self.marked = false;
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "readiness marker removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove readiness marker")
            }
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
