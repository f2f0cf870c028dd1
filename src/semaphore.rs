//! Cross-process named lock backed by a POSIX named semaphore
//!
//! The semaphore is binary: created with value 1, `lock` waits it down to 0
//! and the guard posts it back. Other processes (the consumer included)
//! open the same name to take part in the exclusion.

use crate::config::posix_name;
use crate::error::{PoseFeedError, Result};
use std::ffi::CString;
use std::io;
use tracing::{debug, error};

/// POSIX limits semaphore names to NAME_MAX - 4
const MAX_NAME_LEN: usize = 251;

const SEM_MODE: libc::c_uint = 0o666;

/// Handle to a named semaphore used as a mutex
pub struct NamedMutex {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: sem_wait/sem_post are thread-safe on a shared sem_t handle
unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Create the semaphore unlocked if absent, otherwise open it
    ///
    /// `O_CREAT` without `O_EXCL` is atomic: when several producers race
    /// on the same name exactly one creates it and the others attach.
    pub fn acquire_or_create(name: &str) -> Result<Self> {
        let name = posix_name(name);
        if name.len() > MAX_NAME_LEN {
            return Err(PoseFeedError::NameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }
        let c_name = c_name(&name)?;

        // SAFETY: c_name is a valid NUL-terminated string; mode and initial
        // value are passed as the promoted unsigned ints sem_open expects.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                SEM_MODE,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(PoseFeedError::SemaphoreOpen {
                name,
                source: io::Error::last_os_error(),
            });
        }

        debug!(lock = %name, "named lock opened");
        Ok(Self { sem, name })
    }

    /// Block until exclusive ownership is obtained
    pub fn lock(&self) -> Result<NamedMutexGuard<'_>> {
        loop {
            // SAFETY: self.sem is a live handle from sem_open
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(NamedMutexGuard { mutex: self });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(PoseFeedError::LockAcquireFailure {
                    name: self.name.clone(),
                    source: err,
                });
            }
        }
    }

    fn unlock(&self) -> Result<()> {
        // SAFETY: self.sem is a live handle from sem_open
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(PoseFeedError::LockAcquireFailure {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Name including the leading slash
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the name from the system
    ///
    /// Producers never call this; it is for supervisors and test cleanup.
    pub fn unlink(name: &str) -> Result<()> {
        let name = posix_name(name);
        let c_name = c_name(&name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            return Err(PoseFeedError::SemaphoreOpen {
                name,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        // Local handle only, the named object stays for other processes
        // SAFETY: self.sem came from sem_open and is closed exactly once
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Held lock; posts the semaphore when dropped
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl NamedMutexGuard<'_> {
    /// Release explicitly and observe failures
    pub fn unlock(self) -> Result<()> {
        let mutex = self.mutex;
        std::mem::forget(self);
        mutex.unlock()
    }
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            error!(lock = %self.mutex.name, error = %e, "failed to release named lock");
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| PoseFeedError::InvalidConfig(format!("name {name:?} contains NUL")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn unique(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/posefeed_sem_{}_{}_{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_lock_unlock() {
        let name = unique("basic");
        let mutex = NamedMutex::acquire_or_create(&name).unwrap();
        assert_eq!(mutex.name(), name);

        let guard = mutex.lock().unwrap();
        guard.unlock().unwrap();
        drop(mutex.lock().unwrap());

        NamedMutex::unlink(&name).unwrap();
    }

    #[test]
    fn test_second_handle_attaches() {
        let name = unique("attach");
        let a = NamedMutex::acquire_or_create(&name).unwrap();
        let b = NamedMutex::acquire_or_create(&name).unwrap();

        // Same semaphore: holding it through `a` must not leave it at 1
        let guard = a.lock().unwrap();
        let value = {
            let mut v: libc::c_int = -1;
            unsafe { libc::sem_getvalue(b.sem, &mut v) };
            v
        };
        assert_eq!(value, 0);
        drop(guard);

        drop(a);
        drop(b);
        NamedMutex::unlink(&name).unwrap();
    }

    #[test]
    fn test_mutual_exclusion_across_handles() {
        let name = unique("excl");
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let mutex = NamedMutex::acquire_or_create(&name).unwrap();
                    for _ in 0..200 {
                        let _guard = mutex.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        NamedMutex::unlink(&name).unwrap();
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(300);
        assert!(matches!(
            NamedMutex::acquire_or_create(&name),
            Err(PoseFeedError::NameTooLong { .. })
        ));
    }
}
