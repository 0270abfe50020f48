//! Works out which upstream releases the mirror actually needs.
//!
//! Every maintained branch (`main`, `v1`, `v2`, ...) carries a small config
//! file naming the release bundle it depends on. Only those releases are
//! cached; the rest of the upstream's release history is ignored.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, ObjectType, Oid, Repository};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::git::{GitError, open_repository, read_local_refs};
use crate::types::{ParseError, ReleaseTag};

/// Maintenance branches and tags (`v1`, `v2`, ...) plus the default branch.
pub const DEFAULT_REF_PATTERN: &str = r"^refs/(heads|tags)/(main|v\d+)$";

/// Errors that stop resolution. A single branch's missing or broken config is not one of them.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no mirror at {0}")]
    NoMirror(PathBuf),
    #[error("invalid ref pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to read {reference} from the mirror: {source}")]
    Object {
        reference: String,
        #[source]
        source: git2::Error,
    },
    #[error(transparent)]
    Git(#[from] GitError),
}

/// Why a branch's config could not be turned into a release tag.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid release tag: {0}")]
    InvalidTag(#[from] ParseError),
    #[error("{0} is not a file")]
    NotAFile(String),
}

/// Where a branch records the release it depends on, and how to read it.
pub trait ReleaseConfigFormat: Send + Sync {
    /// Path of the config file relative to the root of the branch's tree.
    fn path(&self) -> &str;

    /// Extract the release tag from the file's contents.
    fn parse(&self, contents: &[u8]) -> Result<ReleaseTag, ConfigError>;
}

/// `src/defaults.json` with a `bundleVersion` key, as used by the CodeQL action.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleVersionJson;

#[derive(Deserialize)]
struct Defaults {
    #[serde(rename = "bundleVersion")]
    bundle_version: String,
}

impl ReleaseConfigFormat for BundleVersionJson {
    fn path(&self) -> &str {
        "src/defaults.json"
    }

    fn parse(&self, contents: &[u8]) -> Result<ReleaseTag, ConfigError> {
        let defaults: Defaults = serde_json::from_slice(contents)?;
        Ok(defaults.bundle_version.parse()?)
    }
}

/// Outcome of looking up one branch's config.
#[derive(Debug)]
pub enum BranchConfig {
    Found(ReleaseTag),
    /// The branch has no config file.
    Missing,
    /// The config exists but could not be used.
    Malformed(ConfigError),
    /// The ref does not point (through tags) at a commit.
    NotACommit,
}

/// Computes the relevant release set from the local mirror. Never touches the network.
pub struct ReleaseRelevanceResolver {
    mirror_path: PathBuf,
    pattern: Regex,
    format: Box<dyn ReleaseConfigFormat>,
}

impl ReleaseRelevanceResolver {
    pub fn new(mirror_path: impl Into<PathBuf>) -> Result<Self, ResolveError> {
        Ok(Self {
            mirror_path: mirror_path.into(),
            pattern: Regex::new(DEFAULT_REF_PATTERN)?,
            format: Box::new(BundleVersionJson),
        })
    }

    /// Only inspect refs whose full name matches `pattern`.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, ResolveError> {
        self.pattern = Regex::new(pattern)?;
        Ok(self)
    }

    pub fn with_format(mut self, format: impl ReleaseConfigFormat + 'static) -> Self {
        self.format = Box::new(format);
        self
    }

    /// The deduplicated set of release tags named by matching refs.
    ///
    /// Matching refs without a usable config are skipped with a warning.
    pub fn resolve(&self) -> Result<BTreeSet<ReleaseTag>, ResolveError> {
        let repo = match open_repository(&self.mirror_path) {
            Ok(repo) => repo,
            Err(GitError::NotFound(_)) => {
                return Err(ResolveError::NoMirror(self.mirror_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut releases = BTreeSet::new();
        for (name, target) in read_local_refs(&repo)?.iter() {
            if !self.pattern.is_match(name) {
                continue;
            }
            match self.branch_config(&repo, name, target)? {
                BranchConfig::Found(tag) => {
                    log::debug!("{} depends on release {}", name, tag);
                    releases.insert(tag);
                }
                BranchConfig::Missing => log::warn!(
                    "Ignoring {} as it has no {} file",
                    name,
                    self.format.path()
                ),
                BranchConfig::Malformed(e) => {
                    log::warn!("Ignoring {} as its {} is unusable: {}", name, self.format.path(), e)
                }
                BranchConfig::NotACommit => {
                    log::warn!("Ignoring {} as it does not point at a commit", name)
                }
            }
        }

        log::info!("Found {} relevant release(s)", releases.len());
        Ok(releases)
    }

    /// Look up the config at the tip of one ref.
    ///
    /// Errors only when the mirror itself cannot be read.
    pub fn branch_config(
        &self,
        repo: &Repository,
        reference: &str,
        target: Oid,
    ) -> Result<BranchConfig, ResolveError> {
        let read_err = |source| ResolveError::Object {
            reference: reference.to_string(),
            source,
        };

        let object = repo.find_object(target, None).map_err(read_err)?;
        let commit = match object.peel_to_commit() {
            Ok(commit) => commit,
            Err(_) => return Ok(BranchConfig::NotACommit),
        };
        let tree = commit.tree().map_err(read_err)?;

        let entry = match tree.get_path(Path::new(self.format.path())) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(BranchConfig::Missing),
            Err(e) => return Err(read_err(e)),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(BranchConfig::Malformed(ConfigError::NotAFile(
                self.format.path().to_string(),
            )));
        }
        let blob = repo.find_blob(entry.id()).map_err(read_err)?;

        Ok(match self.format.parse(blob.content()) {
            Ok(tag) => BranchConfig::Found(tag),
            Err(e) => BranchConfig::Malformed(e),
        })
    }
}
