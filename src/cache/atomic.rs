//! All-or-nothing file replacement.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::cancel::Cancellation;

/// Global counter for unique temp file names within a process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("expected {expected} bytes, received {written}")]
    LengthMismatch { expected: u64, written: u64 },
    #[error("write cancelled")]
    Cancelled,
}

/// Stream `reader` into `dest`, replacing any existing file only once exactly
/// `expected_len` bytes have been written and synced.
///
/// The data goes to `{dest}.tmp.{pid}.{counter}` in the same directory and is
/// renamed over `dest` (atomic on POSIX). On any failure the temp file is
/// removed and `dest` is left untouched.
pub fn atomic_write_from(
    dest: &Path,
    reader: &mut dyn Read,
    expected_len: u64,
    cancel: &Cancellation,
) -> Result<u64, WriteError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let (temp_path, file) = create_temp_file(dest)?;
    let result = copy_exact(file, reader, expected_len, cancel)
        .and_then(|written| std::fs::rename(&temp_path, dest).map(|()| written).map_err(Into::into));

    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", temp_path.display(), e);
            }
        }
    }
    result
}

fn create_temp_file(dest: &Path) -> io::Result<(PathBuf, File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?
        .to_string_lossy()
        .into_owned();

    loop {
        // Retry if the temp path already exists (e.g., from a prior crash).
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = dest.with_file_name(format!(
            "{}.tmp.{}.{}",
            file_name,
            std::process::id(),
            counter
        ));
        match OpenOptions::new().write(true).create_new(true).open(&temp_path) {
            Ok(file) => return Ok((temp_path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

fn copy_exact(
    mut file: File,
    reader: &mut dyn Read,
    expected_len: u64,
    cancel: &Cancellation,
) -> Result<u64, WriteError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(WriteError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&buf[..n])?;
        written += n as u64;
        if written > expected_len {
            return Err(WriteError::LengthMismatch {
                expected: expected_len,
                written,
            });
        }
    }

    if written != expected_len {
        return Err(WriteError::LengthMismatch {
            expected: expected_len,
            written,
        });
    }

    file.sync_all()?;
    Ok(written)
}
