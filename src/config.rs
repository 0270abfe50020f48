//! Settings for a pull, resolved from command-line overrides and the environment.

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::cache::CacheDirectory;
use crate::git::GitCli;
use crate::types::{ParseError, RepoKey};

pub const DEFAULT_SOURCE_URL: &str = "https://github.com";
pub const DEFAULT_REPOSITORY: &str = "github/codeql-action";
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid source URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("source URL must use http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("invalid repository {name:?}: {source}")]
    InvalidRepository {
        name: String,
        #[source]
        source: ParseError,
    },
}

/// Values given explicitly by the user; anything left `None` falls back to a default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cache_dir: Option<PathBuf>,
    pub source_url: Option<String>,
    pub source_token: Option<String>,
    pub repository: Option<String>,
    pub git_program: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PullConfig {
    pub cache_dir: PathBuf,
    pub source_url: Url,
    pub source_token: Option<String>,
    pub repository: RepoKey,
    /// git executable, looked up on `PATH` unless it contains a separator.
    pub git_program: PathBuf,
}

impl PullConfig {
    /// Resolve against the process environment.
    pub fn from_env(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, |name| std::env::var(name).ok())
    }

    /// Resolve with `env` standing in for the environment.
    pub fn resolve(
        overrides: ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let cache_dir = overrides
            .cache_dir
            .unwrap_or_else(|| CacheDirectory::default().root().to_path_buf());

        let raw_url = overrides
            .source_url
            .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        let source_url = Url::parse(&raw_url).map_err(|source| ConfigError::InvalidUrl {
            url: raw_url.clone(),
            source,
        })?;
        if !matches!(source_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(source_url.scheme().to_string()));
        }

        // An empty token is as good as none; sending `token ` only earns a 401.
        let source_token = overrides
            .source_token
            .or_else(|| env(TOKEN_ENV_VAR))
            .filter(|t| !t.trim().is_empty());

        let name = overrides
            .repository
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string());
        let repository = name
            .parse()
            .map_err(|source| ConfigError::InvalidRepository { name, source })?;

        Ok(Self {
            cache_dir,
            source_url,
            source_token,
            repository,
            git_program: overrides.git_program.unwrap_or_else(|| PathBuf::from("git")),
        })
    }

    /// `{source_url}/{owner}/{repo}.git`
    pub fn clone_url(&self) -> String {
        format!(
            "{}/{}/{}.git",
            self.source_url.as_str().trim_end_matches('/'),
            self.repository.owner,
            self.repository.repo
        )
    }

    pub fn cache_directory(&self) -> CacheDirectory {
        CacheDirectory::new(&self.cache_dir)
    }

    pub fn git_cli(&self) -> GitCli {
        GitCli::with_program(&self.git_program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let config = PullConfig::resolve(ConfigOverrides::default(), no_env).unwrap();
        assert_eq!(config.source_url.as_str(), "https://github.com/");
        assert_eq!(config.repository.to_string(), "github/codeql-action");
        assert_eq!(config.source_token, None);
        assert!(config.cache_dir.ends_with("ghmirror"));
        assert_eq!(config.clone_url(), "https://github.com/github/codeql-action.git");
        assert_eq!(config.git_program, PathBuf::from("git"));
    }

    #[test]
    fn overrides_win() {
        let overrides = ConfigOverrides {
            cache_dir: Some(PathBuf::from("/tmp/mirror-cache")),
            source_url: Some("https://ghe.example.com/".to_string()),
            source_token: Some("from-flag".to_string()),
            repository: Some("octo/action".to_string()),
            git_program: Some(PathBuf::from("/opt/git/bin/git")),
        };
        let config = PullConfig::resolve(overrides, |_| Some("from-env".to_string())).unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/mirror-cache"));
        assert_eq!(config.git_program, PathBuf::from("/opt/git/bin/git"));
        assert_eq!(config.source_token.as_deref(), Some("from-flag"));
        assert_eq!(config.clone_url(), "https://ghe.example.com/octo/action.git");
    }

    #[test]
    fn token_falls_back_to_environment() {
        let config = PullConfig::resolve(ConfigOverrides::default(), |name| {
            (name == TOKEN_ENV_VAR).then(|| "from-env".to_string())
        })
        .unwrap();
        assert_eq!(config.source_token.as_deref(), Some("from-env"));

        let blank = PullConfig::resolve(ConfigOverrides::default(), |_| Some("  ".to_string())).unwrap();
        assert_eq!(blank.source_token, None);
    }

    #[test]
    fn rejects_bad_values() {
        let bad_url = ConfigOverrides {
            source_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            PullConfig::resolve(bad_url, no_env),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let ssh = ConfigOverrides {
            source_url: Some("ssh://github.com".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            PullConfig::resolve(ssh, no_env),
            Err(ConfigError::UnsupportedScheme(s)) if s == "ssh"
        ));

        let repo = ConfigOverrides {
            repository: Some("codeql-action".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            PullConfig::resolve(repo, no_env),
            Err(ConfigError::InvalidRepository { .. })
        ));
    }
}
