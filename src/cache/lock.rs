//! Process-level lock on a cache directory.
//!
//! The lock file also records the holder's pid so a second pull can say who
//! it is waiting for.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::CacheError;
use crate::cancel::Cancellation;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of a pull; unlocks on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
}

impl CacheLock {
    /// Wait up to `wait` for the lock at `lock_path`, giving up early if `cancel` trips.
    pub(super) fn acquire(
        lock_path: &Path,
        wait: Duration,
        cancel: &Cancellation,
    ) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(CacheError::Locked {
                    path: lock_path.to_path_buf(),
                    holder: read_holder(lock_path),
                });
            }
            log::debug!("Waiting for cache lock {}", lock_path.display());
            std::thread::sleep(POLL_INTERVAL);
        }

        file.set_len(0)?;
        (&file).write_all(std::process::id().to_string().as_bytes())?;
        Ok(Self { file })
    }
}

fn read_holder(lock_path: &Path) -> Option<u32> {
    std::fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release cache lock: {}", e);
        }
    }
}
