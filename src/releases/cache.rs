//! Downloads release assets into the cache, skipping files that already have
//! the size the release metadata reports.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::{ApiError, ReleaseApi};
use crate::cache::{CacheLocation, WriteError, atomic_write_from};
use crate::cancel::Cancellation;
use crate::types::{Asset, ParseError, ReleaseTag, RepoKey, validate_path_component};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a single download attempt failed.
#[derive(Error, Debug)]
pub enum DownloadFailure {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl DownloadFailure {
    /// Whether another attempt could succeed. Client errors such as 401, 403
    /// and 404 will not change on retry.
    fn is_transient(&self) -> bool {
        match self {
            DownloadFailure::Api(e) => e.is_transient(),
            DownloadFailure::Write(WriteError::Cancelled) => false,
            DownloadFailure::Write(_) => true,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DownloadFailure::Api(ApiError::Cancelled) | DownloadFailure::Write(WriteError::Cancelled)
        )
    }
}

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("release {0} not found")]
    ReleaseNotFound(ReleaseTag),
    #[error("failed to fetch release {tag}: {source}")]
    Release {
        tag: ReleaseTag,
        #[source]
        source: ApiError,
    },
    #[error("release {tag} has an asset with an unusable name {name:?}: {source}")]
    InvalidAssetName {
        tag: ReleaseTag,
        name: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to download {name} from release {tag}: {source}")]
    Download {
        tag: ReleaseTag,
        name: String,
        #[source]
        source: DownloadFailure,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("asset fetch cancelled")]
    Cancelled,
}

/// How often and how patiently a failed download is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempts are numbered from 1).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Counts reported once a fetch completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub downloaded: usize,
    pub skipped: usize,
}

/// Fetches the assets of a set of releases into a [`CacheLocation`].
pub struct AssetCache<'a> {
    api: &'a dyn ReleaseApi,
    location: &'a dyn CacheLocation,
    repo: RepoKey,
    retry: RetryPolicy,
    cancel: Cancellation,
}

impl<'a> AssetCache<'a> {
    pub fn new(
        api: &'a dyn ReleaseApi,
        location: &'a dyn CacheLocation,
        repo: RepoKey,
        cancel: Cancellation,
    ) -> Self {
        Self {
            api,
            location,
            repo,
            retry: RetryPolicy::default(),
            cancel,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make every asset of every release in `tags` present in the cache with
    /// its expected size.
    ///
    /// Stops at the first release or asset that cannot be cached.
    pub fn fetch(&self, tags: &BTreeSet<ReleaseTag>) -> Result<FetchSummary, AssetError> {
        let mut summary = FetchSummary::default();

        for tag in tags {
            self.check_cancelled()?;

            let release = self
                .api
                .get_release_by_tag(&self.repo, tag)
                .map_err(|source| match source {
                    ApiError::Cancelled => AssetError::Cancelled,
                    source => AssetError::Release {
                        tag: tag.clone(),
                        source,
                    },
                })?
                .ok_or_else(|| AssetError::ReleaseNotFound(tag.clone()))?;
            log::debug!("Release {} has {} asset(s)", tag, release.assets.len());

            for asset in &release.assets {
                self.check_cancelled()?;
                if self.fetch_asset(tag, asset)? {
                    summary.downloaded += 1;
                } else {
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Returns whether the asset was downloaded (`false` when the cached copy was kept).
    fn fetch_asset(&self, tag: &ReleaseTag, asset: &Asset) -> Result<bool, AssetError> {
        validate_path_component(&asset.name).map_err(|source| AssetError::InvalidAssetName {
            tag: tag.clone(),
            name: asset.name.clone(),
            source,
        })?;

        let path = self.location.asset_path(tag, &asset.name);
        if is_cached(&path, asset.size)? {
            log::info!("{}/{} is up to date", tag, asset.name);
            return Ok(false);
        }

        log::info!("Downloading {}/{} ({} bytes)", tag, asset.name, asset.size);
        let mut attempt = 1;
        loop {
            match self.download_once(&path, asset) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_cancelled() => return Err(AssetError::Cancelled),
                Err(source) if attempt >= self.retry.attempts || !source.is_transient() => {
                    return Err(AssetError::Download {
                        tag: tag.clone(),
                        name: asset.name.clone(),
                        source,
                    });
                }
                Err(e) => {
                    let backoff = self.retry.backoff(attempt);
                    log::warn!(
                        "Attempt {}/{} to download {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.retry.attempts,
                        tag,
                        asset.name,
                        e,
                        backoff
                    );
                    self.sleep(backoff)?;
                    attempt += 1;
                }
            }
        }
    }

    fn download_once(&self, path: &Path, asset: &Asset) -> Result<(), DownloadFailure> {
        let mut body = self.api.download_asset(&self.repo, asset.id)?;
        atomic_write_from(path, &mut body, asset.size, &self.cancel)?;
        Ok(())
    }

    fn sleep(&self, duration: Duration) -> Result<(), AssetError> {
        let until = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(CANCEL_POLL_INTERVAL));
        }
    }

    fn check_cancelled(&self) -> Result<(), AssetError> {
        if self.cancel.is_cancelled() {
            Err(AssetError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Size is the only freshness check; content is never inspected.
fn is_cached(path: &Path, expected_size: u64) -> Result<bool, AssetError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file() && meta.len() == expected_size),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
