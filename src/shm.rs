//! Create-or-attach POSIX shared memory regions

use crate::config::{posix_name, RetryPolicy};
use crate::error::{PoseFeedError, Result};
use crate::layout::Span;
use crate::stop::StopSignal;
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::{debug, info};

/// POSIX shared memory names are limited to NAME_MAX
const MAX_NAME_LEN: usize = 255;

/// Handle to a mapped shared memory region
///
/// Dropping the handle unmaps it. The named object is never unlinked
/// here: the consumer may still be attached.
pub struct SharedRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    created: bool,
}

// SAFETY: the mapping is process-wide; writers serialize through the
// channel's named lock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

/// Outcome of a single create-or-attach attempt
enum Attempt {
    Ready(SharedRegion),
    /// The peer has not created or sized the object yet
    Pending(&'static str),
}

impl SharedRegion {
    /// Create the region, or attach to it if a peer already did
    ///
    /// Retries on `retry.interval` while the object is missing or still
    /// unsized, giving up with `ChannelUnavailable` once the policy is
    /// exhausted. An existing object of a different size is rejected.
    pub fn create_or_attach(name: &str, size: usize, retry: &RetryPolicy) -> Result<Self> {
        Self::create_or_attach_until(name, size, retry, &StopSignal::new())
    }

    /// Like [`create_or_attach`](Self::create_or_attach), but gives up
    /// with `ChannelUnavailable` as soon as `stop` is requested
    pub fn create_or_attach_until(
        name: &str,
        size: usize,
        retry: &RetryPolicy,
        stop: &StopSignal,
    ) -> Result<Self> {
        let name = posix_name(name);
        if name.len() > MAX_NAME_LEN {
            return Err(PoseFeedError::NameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }
        if size == 0 {
            return Err(PoseFeedError::InvalidConfig(format!(
                "shared memory '{name}' needs a positive size"
            )));
        }
        let c_name = CString::new(name.clone())
            .map_err(|_| PoseFeedError::InvalidConfig(format!("name {name:?} contains NUL")))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match Self::attempt(&c_name, &name, size)? {
                Attempt::Ready(region) => return Ok(region),
                Attempt::Pending(reason) => {
                    if !retry.allows(attempts) {
                        return Err(PoseFeedError::ChannelUnavailable { name, attempts });
                    }
                    info!(shm = %name, attempts, reason, "waiting for shared memory");
                    if stop.sleep(retry.interval) {
                        info!(shm = %name, attempts, "stopped while waiting for shared memory");
                        return Err(PoseFeedError::ChannelUnavailable { name, attempts });
                    }
                }
            }
        }
    }

    fn attempt(c_name: &CString, name: &str, size: usize) -> Result<Attempt> {
        let mode = Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH;

        // Exclusive create first; the OS zero-fills the new object
        let create_err = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            mode,
        ) {
            Ok(fd) => {
                ftruncate(&fd, size as u64).map_err(|e| PoseFeedError::Truncate(e.into()))?;
                debug!(shm = %name, size, "shared memory created");
                return Self::map(fd, name, size, true).map(Attempt::Ready);
            }
            Err(e) => e,
        };

        // Exists already, or creation is not permitted for us: attach
        let fd = match shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => return Ok(Attempt::Pending("not created yet")),
            Err(e) if create_err == Errno::EXIST => {
                return Err(PoseFeedError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
            Err(_) => {
                return Err(PoseFeedError::ShmCreate {
                    name: name.to_string(),
                    source: create_err.into(),
                })
            }
        };

        let stat = fstat(&fd).map_err(|e| PoseFeedError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let existing = stat.st_size as usize;
        if existing == 0 {
            // Creator is between shm_open and ftruncate
            return Ok(Attempt::Pending("not sized yet"));
        }
        if existing != size {
            return Err(PoseFeedError::RegionSizeMismatch {
                name: name.to_string(),
                expected: size,
                got: existing,
            });
        }

        debug!(shm = %name, size, "attached to existing shared memory");
        Self::map(fd, name, size, false).map(Attempt::Ready)
    }

    fn map(fd: OwnedFd, name: &str, size: usize, created: bool) -> Result<Self> {
        // SAFETY: fd refers to a shared memory object of at least `size` bytes
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| PoseFeedError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            PoseFeedError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            created,
        })
    }

    /// Copy `bytes` to the start of `span`
    ///
    /// Length is checked before any byte is copied, so an oversized
    /// payload leaves the region untouched.
    pub fn write(&self, span: Span, bytes: &[u8]) -> Result<()> {
        self.check_span(span, bytes.len())?;
        if bytes.len() > span.len {
            return Err(PoseFeedError::PayloadTooLarge {
                max: span.len,
                got: bytes.len(),
            });
        }

        // SAFETY: span lies inside the mapping and bytes fits inside span
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.addr.as_ptr().add(span.offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `span` out of the region
    pub fn read(&self, span: Span) -> Result<Vec<u8>> {
        self.check_span(span, span.len)?;
        let mut buf = vec![0u8; span.len];
        // SAFETY: span lies inside the mapping
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.addr.as_ptr().add(span.offset),
                buf.as_mut_ptr(),
                span.len,
            );
        }
        Ok(buf)
    }

    fn check_span(&self, span: Span, got: usize) -> Result<()> {
        match span.end() {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PoseFeedError::PayloadTooLarge {
                max: self.size.saturating_sub(span.offset),
                got,
            }),
        }
    }

    /// Unmap without unlinking
    pub fn close(self) {
        drop(self);
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name including the leading slash
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object rather than attaching
    #[inline(always)]
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Remove the name from the system
    ///
    /// Producers never call this; it is for supervisors and test cleanup.
    pub fn unlink(name: &str) -> Result<()> {
        let name = posix_name(name);
        let c_name = CString::new(name.clone())
            .map_err(|_| PoseFeedError::InvalidConfig(format!("name {name:?} contains NUL")))?;
        shm_unlink(c_name.as_c_str()).map_err(|e| PoseFeedError::ShmOpen {
            name,
            source: e.into(),
        })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: addr/size describe the mapping created in `map`
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}
