//! Bare mirror synchronization.
//!
//! A fresh sync clones every ref the remote advertises. An incremental sync
//! compares the mirror's refs with `git ls-remote`, deletes stale refs
//! (including ones that occupy a path an incoming ref needs) and then runs a
//! forced, pruning fetch. A sync with nothing to change writes nothing.

use std::path::PathBuf;

use thiserror::Error;

use crate::cancel::Cancellation;
use crate::git::{
    GitCli, GitError, RefConflict, RefMap, RefUpdatePlan, delete_ref, open_repository,
    read_local_refs, repository_exists,
};

/// Errors returned by mirror synchronization.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The initial clone failed; nothing usable was left behind.
    #[error("failed to initialize mirror at {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: GitError,
    },
    /// A fresh sync was requested but a mirror already exists.
    #[error("a mirror already exists at {0}")]
    AlreadyInitialized(PathBuf),
    /// An incremental sync was requested but there is no mirror yet.
    #[error("no mirror at {0}; run a fresh sync first")]
    NoMirror(PathBuf),
    /// A ref namespace collision could not be resolved.
    #[error("unresolved ref namespace conflict: {conflict}")]
    RefConflict {
        conflict: RefConflict,
        #[source]
        source: Option<GitError>,
    },
    /// After updating, the mirror's refs still differ from what the remote advertised.
    #[error("mirror does not match upstream after update ({0}); safe to retry")]
    Incomplete(String),
    #[error(transparent)]
    Git(GitError),
    #[error("mirror sync cancelled")]
    Cancelled,
}

impl From<GitError> for MirrorError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::Cancelled => MirrorError::Cancelled,
            other => MirrorError::Git(other),
        }
    }
}

/// Keeps the bare mirror at `mirror_path` in sync with `clone_url`.
pub struct MirrorSync {
    git: GitCli,
    clone_url: String,
    mirror_path: PathBuf,
    cancel: Cancellation,
}

impl MirrorSync {
    pub fn new(clone_url: impl Into<String>, mirror_path: impl Into<PathBuf>, cancel: Cancellation) -> Self {
        Self {
            git: GitCli::new(),
            clone_url: clone_url.into(),
            mirror_path: mirror_path.into(),
            cancel,
        }
    }

    /// Run git through `git` instead of the default `git` on PATH.
    pub fn with_git(mut self, git: GitCli) -> Self {
        self.git = git;
        self
    }

    /// Clone (`fresh`) or incrementally update the mirror.
    pub fn synchronize(&self, fresh: bool) -> Result<(), MirrorError> {
        if fresh {
            self.clone_fresh()
        } else {
            self.update()
        }
    }

    fn clone_fresh(&self) -> Result<(), MirrorError> {
        if repository_exists(&self.mirror_path) {
            return Err(MirrorError::AlreadyInitialized(self.mirror_path.clone()));
        }

        log::info!(
            "Cloning {} into {}",
            self.clone_url,
            self.mirror_path.display()
        );
        self.git
            .clone_mirror(&self.clone_url, &self.mirror_path, &self.cancel)
            .map_err(|source| match source {
                GitError::Cancelled => MirrorError::Cancelled,
                source => MirrorError::Init {
                    path: self.mirror_path.clone(),
                    source,
                },
            })
    }

    fn update(&self) -> Result<(), MirrorError> {
        let repo = match open_repository(&self.mirror_path) {
            Ok(repo) => repo,
            Err(GitError::NotFound(_)) => {
                return Err(MirrorError::NoMirror(self.mirror_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let local = read_local_refs(&repo)?;
        let remote = self.git.ls_remote(&self.clone_url, &self.cancel)?;
        let plan = RefUpdatePlan::compute(&local, &remote).map_err(|conflict| {
            MirrorError::RefConflict {
                conflict,
                source: None,
            }
        })?;

        if plan.is_empty() {
            log::info!("Mirror is up to date ({} refs)", remote.len());
            return Ok(());
        }

        log::info!(
            "Updating mirror: {} new, {} moved, {} removed",
            plan.creates.len(),
            plan.updates.len(),
            plan.deletes.len()
        );

        // Stale refs go first so an incoming ref never finds its path occupied.
        for name in &plan.deletes {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let incoming = plan.collision_for(name);
            match incoming {
                Some(incoming) => log::debug!("Removing {} to make room for {}", name, incoming),
                None => log::debug!("Pruning {}", name),
            }
            if let Err(source) = delete_ref(&repo, name) {
                return Err(match incoming {
                    Some(incoming) => MirrorError::RefConflict {
                        conflict: RefConflict {
                            name: incoming.to_string(),
                            other: name.clone(),
                        },
                        source: Some(source),
                    },
                    None => source.into(),
                });
            }
        }

        if !plan.creates.is_empty() || !plan.updates.is_empty() {
            self.git
                .fetch_mirror(&self.mirror_path, &self.clone_url, &self.cancel)?;
        }

        self.verify(&remote)
    }

    /// Check the mirror against what upstream advertised.
    ///
    /// Upstream may move on between listing and fetching, in which case the
    /// fetch brings in newer state than the listing. A ref that differs from
    /// the listing is accepted when it matches a second, later listing.
    fn verify(&self, listed: &RefMap) -> Result<(), MirrorError> {
        // Re-open because git2 caches refs.
        let mirrored = read_local_refs(&open_repository(&self.mirror_path)?)?;
        if mirrored == *listed {
            return Ok(());
        }

        let current = self.git.ls_remote(&self.clone_url, &self.cancel)?;
        let unexplained: Vec<&str> = mirrored
            .differing(listed)
            .into_iter()
            .filter(|name| mirrored.get(name) != current.get(name))
            .collect();
        if unexplained.is_empty() {
            log::info!("Upstream changed during the update; mirror took the newer refs");
            return Ok(());
        }

        Err(MirrorError::Incomplete(format!(
            "{} ref(s) differ from upstream: {}",
            unexplained.len(),
            unexplained.join(", ")
        )))
    }
}
