//! Advisory scope locking
//!
//! Mutations acquire an exclusive advisory lock on the scope's lock file
//! before touching anything durable. Acquisition blocks with retries up to a
//! configured timeout (default 5 s), then fails with `LockTimeout`. The lock
//! releases on drop, so every exit path unlocks.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use engram_core::cancel::deadlines;
use engram_core::error::{Error, Result};
use engram_core::types::Scope;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Held exclusive lock on a scope directory
///
/// RAII: dropping the guard releases the lock.
pub struct ScopeLock {
    file: File,
}

impl ScopeLock {
    /// Acquire with the default 5 s timeout
    pub fn acquire(lock_path: &Path, scope: Scope) -> Result<Self> {
        Self::acquire_timeout(lock_path, scope, deadlines::LOCK_ACQUIRE)
    }

    /// Acquire, blocking up to `timeout`
    pub fn acquire_timeout(lock_path: &Path, scope: Scope, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ScopeLock { file }),
                Err(_) if started.elapsed() < timeout => {
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(_) => {
                    return Err(Error::LockTimeout {
                        scope: scope.as_str().to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scope.lock");
        {
            let _guard = ScopeLock::acquire(&path, Scope::Local).unwrap();
        }
        // Released on drop, so a second acquire succeeds immediately
        let _guard = ScopeLock::acquire(&path, Scope::Local).unwrap();
    }

    #[test]
    fn test_reentrant_same_process_succeeds() {
        // fs2 locks are per-file-handle; two handles in one process still
        // conflict on some platforms but not others, so only the
        // cross-handle happy path is asserted here.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scope.lock");
        let _guard = ScopeLock::acquire(&path, Scope::Global).unwrap();
    }
}
