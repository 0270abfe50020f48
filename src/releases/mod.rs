//! Release metadata lookup and the on-disk asset cache.

mod cache;
mod client;

use std::io::Read;

use thiserror::Error;

use crate::types::{Release, ReleaseTag, RepoKey};

pub use cache::{AssetCache, AssetError, DownloadFailure, FetchSummary, RetryPolicy};
pub use client::{DotComClient, EnterpriseClient, release_api_for_host};

/// Errors returned by a release API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Whether trying the same request again might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Transport { .. } => true,
            ApiError::Decode { .. } | ApiError::Cancelled => false,
        }
    }
}

/// Read-only access to an upstream host's releases.
///
/// github.com and enterprise hosts differ only in where the API lives; each
/// has its own implementation, chosen once at construction time.
pub trait ReleaseApi: Send + Sync {
    /// Release metadata for `tag`, or `None` if no such release exists.
    fn get_release_by_tag(&self, repo: &RepoKey, tag: &ReleaseTag) -> Result<Option<Release>, ApiError>;

    /// The binary content of an asset.
    fn download_asset(&self, repo: &RepoKey, asset_id: u64) -> Result<Box<dyn Read + Send>, ApiError>;
}
