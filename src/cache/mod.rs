//! On-disk cache layout, locking and atomic writes

mod atomic;
mod lock;
mod paths;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::Cancellation;

pub use atomic::{WriteError, atomic_write_from};
pub use lock::CacheLock;
pub use paths::{CACHE_FORMAT_VERSION, CacheDirectory, CacheLocation};

/// Errors returned by cache directory operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Another process held the cache lock for longer than we were willing to wait.
    #[error("cache lock {} is held by {}", .path.display(), describe_holder(.holder))]
    Locked { path: PathBuf, holder: Option<u32> },
    /// Cancelled while waiting for the lock.
    #[error("cancelled while waiting for the cache lock")]
    Cancelled,
    /// The directory is not empty and was not created by this tool.
    #[error("{0} is not empty and is not a cache directory")]
    NotACache(PathBuf),
    /// The cache was written by an incompatible version.
    #[error("cache format version {found} is not supported (expected {expected})")]
    IncompatibleVersion {
        found: String,
        expected: &'static str,
    },
}

/// How long a pull waits for another pull on the same cache to finish.
const LOCK_WAIT: Duration = Duration::from_secs(30);

fn describe_holder(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!("process {}", pid),
        None => "another process".to_string(),
    }
}

impl CacheDirectory {
    /// Prepare the cache and take the process lock for the duration of a pull.
    pub fn prepare_and_lock(&self, cancel: &Cancellation) -> Result<CacheLock, CacheError> {
        self.prepare()?;
        CacheLock::acquire(&self.lock_path(), LOCK_WAIT, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepare_and_lock_refuses_a_second_holder() {
        let dir = tempdir().unwrap();
        let cache = CacheDirectory::new(dir.path().join("cache"));
        let cancel = Cancellation::new();

        let _lock = cache.prepare_and_lock(&cancel).unwrap();
        assert!(cache.version_path().exists());

        cancel.cancel();
        assert!(matches!(
            cache.prepare_and_lock(&cancel),
            Err(CacheError::Cancelled)
        ));
    }

    #[test]
    fn locked_error_names_the_holder() {
        let err = CacheError::Locked {
            path: PathBuf::from("/cache/.lock"),
            holder: Some(42),
        };
        assert_eq!(err.to_string(), "cache lock /cache/.lock is held by process 42");
    }
}
