//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for anything that talks to the remote:**
//! - `clone_mirror` - `git clone --mirror`, every ref the remote advertises
//! - `ls_remote` - the upstream ref set, without touching the mirror
//! - `fetch_mirror` - forced, pruning fetch of `refs/*`
//!
//! **libgit2 for local operations:**
//! - `open_repository` / `repository_exists`
//! - `read_local_refs` - the mirror's direct refs
//! - `delete_ref` - clearing stale refs before a fetch

mod refs;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use git2::{ErrorCode, ReferenceType, Repository};
use thiserror::Error;

use crate::cancel::Cancellation;

pub use refs::{RefConflict, RefMap, RefUpdatePlan};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// Clone failed.
    #[error("clone failed: {0}")]
    CloneError(String),
    /// Fetch failed.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// Listing remote refs failed.
    #[error("ls-remote failed: {0}")]
    LsRemoteError(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The operation was cancelled and the git process killed.
    #[error("git operation cancelled")]
    Cancelled,
}

/// Validate that a clone URL cannot be mistaken for a command-line flag.
fn validate_url(url: &str) -> Result<(), GitError> {
    if url.is_empty() {
        return Err(GitError::InvalidInput("url cannot be empty".to_string()));
    }
    if url.starts_with('-') {
        return Err(GitError::InvalidInput(
            "url cannot start with '-'".to_string(),
        ));
    }
    if url.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(
            "url cannot contain null or control characters".to_string(),
        ));
    }
    Ok(())
}

fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::ParseError(format!("{} is not valid UTF-8", what)))
}

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self::with_program("git")
    }

    /// Run `program` instead of the `git` found on PATH.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            git_path: program.into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a command to completion, killing it if `cancel` trips.
    ///
    /// stdout and stderr are drained on helper threads so a chatty process
    /// (e.g. `ls-remote` on a repository with thousands of refs) never blocks
    /// on a full pipe.
    fn run(&self, mut cmd: Command, cancel: &Cancellation) -> Result<Output, GitError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match wait_or_kill(&mut child, cancel) {
            Ok(status) => status,
            Err(e) => {
                collect(stdout);
                collect(stderr);
                return Err(e);
            }
        };

        Ok(Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    /// Clone every ref of `url` into a new bare mirror at `dest`.
    ///
    /// Removes `dest` again if the clone fails and `dest` did not exist before.
    pub fn clone_mirror(&self, url: &str, dest: &Path, cancel: &Cancellation) -> Result<(), GitError> {
        validate_url(url)?;

        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = path_str(dest, "destination path")?;

        let mut cmd = self.command();
        cmd.args(["clone", "--mirror", "--quiet", "--"]).arg(url).arg(dest_str);

        let result = self.run(cmd, cancel).and_then(|output| {
            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(GitError::CloneError(stderr.trim().to_string()))
            }
        });

        if result.is_err() && !dest_existed {
            let _ = std::fs::remove_dir_all(dest);
        }
        result
    }

    /// List the refs `url` advertises.
    pub fn ls_remote(&self, url: &str, cancel: &Cancellation) -> Result<RefMap, GitError> {
        validate_url(url)?;

        let mut cmd = self.command();
        cmd.args(["ls-remote", "--"]).arg(url);

        let output = self.run(cmd, cancel)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::LsRemoteError(stderr.trim().to_string()));
        }

        RefMap::parse_ls_remote(&String::from_utf8_lossy(&output.stdout))
    }

    /// Fetch every ref of `url` into the mirror, force-updating moved refs and
    /// pruning refs the remote no longer has.
    pub fn fetch_mirror(&self, mirror_path: &Path, url: &str, cancel: &Cancellation) -> Result<(), GitError> {
        validate_url(url)?;
        let mirror_str = path_str(mirror_path, "mirror path")?;

        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(mirror_str)
            .args([
                "fetch",
                "--quiet",
                "--force",
                "--prune",
                "--no-tags",
                "--no-write-fetch-head",
                "--",
            ])
            .arg(url)
            .arg("+refs/*:refs/*");

        let output = self.run(cmd, cancel)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::FetchError(stderr.trim().to_string()));
        }

        Ok(())
    }

    /// The installed git version string, e.g. `git version 2.43.0`.
    pub fn version(&self) -> Result<String, GitError> {
        let output = self.command().arg("--version").output()?;
        if !output.status.success() {
            return Err(GitError::ParseError("git --version failed".to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn wait_or_kill(
    child: &mut Child,
    cancel: &Cancellation,
) -> Result<std::process::ExitStatus, GitError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GitError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    Repository::open_bare(path).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open_bare(path).is_ok()
}

/// Read every direct ref of `repo`. Symbolic refs such as HEAD are skipped.
pub fn read_local_refs(repo: &Repository) -> Result<RefMap, GitError> {
    let mut refs = RefMap::new();
    for reference in repo.references()? {
        let reference = reference?;
        if reference.kind() != Some(ReferenceType::Direct) {
            continue;
        }
        let (Some(name), Some(target)) = (reference.name(), reference.target()) else {
            log::warn!("Skipping ref with a non UTF-8 name in {}", repo.path().display());
            continue;
        };
        refs.insert(name, target);
    }
    Ok(refs)
}

/// Delete a ref. A ref that is already gone is not an error.
pub fn delete_ref(repo: &Repository, name: &str) -> Result<(), GitError> {
    match repo.find_reference(name) {
        Ok(mut reference) => reference.delete().map_err(GitError::Git),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
        Err(e) => Err(GitError::Git(e)),
    }
}
