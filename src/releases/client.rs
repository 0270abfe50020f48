//! Blocking REST clients for the GitHub releases API.

use std::io::Read;
use std::time::Duration;

use url::Url;

use super::{ApiError, ReleaseApi};
use crate::cancel::Cancellation;
use crate::types::{Release, ReleaseTag, RepoKey};

const USER_AGENT: &str = concat!("ghmirror/", env!("CARGO_PKG_VERSION"));
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
// The asset endpoint serves metadata unless the binary representation is requested.
const BINARY_MEDIA_TYPE: &str = "application/octet-stream";

/// Shared HTTP plumbing: one agent, one API root, optional token.
///
/// Requests are refused once `cancel` trips and never outlive its deadline.
struct RestClient {
    agent: ureq::Agent,
    api_url: String,
    token: Option<String>,
    cancel: Cancellation,
}

impl RestClient {
    fn new(api_url: &str, token: Option<String>, cancel: Cancellation) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            cancel,
        }
    }

    fn get(&self, url: &str, accept: &str) -> Result<ureq::Response, ApiError> {
        if self.cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let mut request = self
            .agent
            .get(url)
            .set("Accept", accept)
            .set("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("token {}", token));
        }
        if let Some(remaining) = self.cancel.remaining() {
            request = request.timeout(remaining);
        }

        request.call().map_err(|err| {
            if self.cancel.is_cancelled() {
                return ApiError::Cancelled;
            }
            match err {
                ureq::Error::Status(status, _) => ApiError::Status {
                    status,
                    url: url.to_string(),
                },
                ureq::Error::Transport(transport) => ApiError::Transport {
                    url: url.to_string(),
                    message: transport.to_string(),
                },
            }
        })
    }

    fn release_by_tag(&self, repo: &RepoKey, tag: &ReleaseTag) -> Result<Option<Release>, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/releases/tags/{}",
            self.api_url,
            repo.owner,
            repo.repo,
            urlencoding::encode(tag.as_str())
        );
        log::debug!("GET {}", url);

        match self.get(&url, JSON_MEDIA_TYPE) {
            Ok(response) => serde_json::from_reader(response.into_reader())
                .map(Some)
                .map_err(|source| ApiError::Decode { url, source }),
            Err(ApiError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn download(&self, repo: &RepoKey, asset_id: u64) -> Result<Box<dyn Read + Send>, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/releases/assets/{}",
            self.api_url, repo.owner, repo.repo, asset_id
        );
        log::debug!("GET {} ({})", url, BINARY_MEDIA_TYPE);

        Ok(self.get(&url, BINARY_MEDIA_TYPE)?.into_reader())
    }
}

/// Releases API of github.com.
pub struct DotComClient {
    rest: RestClient,
}

impl DotComClient {
    pub const API_URL: &'static str = "https://api.github.com";

    pub fn new(token: Option<String>, cancel: Cancellation) -> Self {
        Self::with_api_url(Self::API_URL, token, cancel)
    }

    /// Talk to a different API root, e.g. a caching proxy in front of api.github.com.
    pub fn with_api_url(api_url: &str, token: Option<String>, cancel: Cancellation) -> Self {
        Self {
            rest: RestClient::new(api_url, token, cancel),
        }
    }
}

impl ReleaseApi for DotComClient {
    fn get_release_by_tag(&self, repo: &RepoKey, tag: &ReleaseTag) -> Result<Option<Release>, ApiError> {
        self.rest.release_by_tag(repo, tag)
    }

    fn download_asset(&self, repo: &RepoKey, asset_id: u64) -> Result<Box<dyn Read + Send>, ApiError> {
        self.rest.download(repo, asset_id)
    }
}

/// Releases API of a GitHub Enterprise Server host, served under `{host}/api/v3`.
pub struct EnterpriseClient {
    rest: RestClient,
}

impl EnterpriseClient {
    pub fn new(host_url: &str, token: Option<String>, cancel: Cancellation) -> Self {
        let api_url = format!("{}/api/v3", host_url.trim_end_matches('/'));
        Self {
            rest: RestClient::new(&api_url, token, cancel),
        }
    }
}

impl ReleaseApi for EnterpriseClient {
    fn get_release_by_tag(&self, repo: &RepoKey, tag: &ReleaseTag) -> Result<Option<Release>, ApiError> {
        self.rest.release_by_tag(repo, tag)
    }

    fn download_asset(&self, repo: &RepoKey, asset_id: u64) -> Result<Box<dyn Read + Send>, ApiError> {
        self.rest.download(repo, asset_id)
    }
}

/// Whether `source_url` is github.com rather than an enterprise host.
pub fn is_dotcom(source_url: &Url) -> bool {
    matches!(source_url.host_str(), Some("github.com") | Some("www.github.com"))
}

/// Pick the releases API matching the host the action is mirrored from.
pub fn release_api_for_host(
    source_url: &Url,
    token: Option<String>,
    cancel: Cancellation,
) -> Box<dyn ReleaseApi> {
    if is_dotcom(source_url) {
        Box::new(DotComClient::new(token, cancel))
    } else {
        Box::new(EnterpriseClient::new(source_url.as_str(), token, cancel))
    }
}
