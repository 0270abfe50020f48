//! The pull path: mirror the action repository, then cache the release
//! bundles its maintained branches depend on.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::cache::{CacheDirectory, CacheError, CacheLocation};
use crate::cancel::Cancellation;
use crate::config::{ConfigError, PullConfig};
use crate::git::{GitCli, repository_exists};
use crate::mirror::{MirrorError, MirrorSync};
use crate::releases::{AssetCache, AssetError, FetchSummary, ReleaseApi, release_api_for_host};
use crate::relevance::{ReleaseRelevanceResolver, ResolveError};
use crate::types::{ReleaseTag, RepoKey};

#[derive(Error, Debug)]
pub enum PullError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Wires the cache, the releases API and the clone URL into the pull steps.
///
/// Holds no state of its own between calls.
pub struct PullService {
    location: Box<dyn CacheLocation>,
    api: Box<dyn ReleaseApi>,
    clone_url: String,
    repo: RepoKey,
    git: GitCli,
    cancel: Cancellation,
}

impl PullService {
    pub fn new(
        location: Box<dyn CacheLocation>,
        api: Box<dyn ReleaseApi>,
        clone_url: impl Into<String>,
        repo: RepoKey,
        cancel: Cancellation,
    ) -> Self {
        Self {
            location,
            api,
            clone_url: clone_url.into(),
            repo,
            git: GitCli::new(),
            cancel,
        }
    }

    /// Run mirror operations through `git` instead of the one on `PATH`.
    pub fn with_git(mut self, git: GitCli) -> Self {
        self.git = git;
        self
    }

    /// Build from resolved settings, picking the releases API by host.
    pub fn from_config(config: &PullConfig, cancel: Cancellation) -> Self {
        let api = release_api_for_host(
            &config.source_url,
            config.source_token.clone(),
            cancel.clone(),
        );
        Self::new(
            Box::new(CacheDirectory::new(&config.cache_dir)),
            api,
            config.clone_url(),
            config.repository.clone(),
            cancel,
        )
        .with_git(config.git_cli())
    }

    /// Whether a mirror already exists, i.e. the next git sync should not be fresh.
    pub fn has_mirror(&self) -> bool {
        repository_exists(&self.location.git_path())
    }

    pub fn synchronize_git(&self, fresh: bool) -> Result<(), PullError> {
        MirrorSync::new(&self.clone_url, self.location.git_path(), self.cancel.clone())
            .with_git(self.git.clone())
            .synchronize(fresh)?;
        Ok(())
    }

    /// Releases the mirrored branches depend on.
    pub fn relevant_releases(&self) -> Result<BTreeSet<ReleaseTag>, PullError> {
        Ok(ReleaseRelevanceResolver::new(self.location.git_path())?.resolve()?)
    }

    pub fn synchronize_releases(&self) -> Result<FetchSummary, PullError> {
        let tags = self.relevant_releases()?;
        log::info!(
            "{} relevant release(s): {}",
            tags.len(),
            tags.iter().map(ReleaseTag::as_str).collect::<Vec<_>>().join(", ")
        );

        let summary = AssetCache::new(
            self.api.as_ref(),
            self.location.as_ref(),
            self.repo.clone(),
            self.cancel.clone(),
        )
        .fetch(&tags)?;
        log::info!(
            "Release assets: {} downloaded, {} already cached",
            summary.downloaded,
            summary.skipped
        );
        Ok(summary)
    }
}
