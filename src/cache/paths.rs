//! Cache directory path management
//!
//! ```text
//! ~/.cache/ghmirror/
//! ├── .ghmirror-version        # Cache format marker
//! ├── .lock                    # flock-based process lock
//! ├── git/                     # Bare mirror of the upstream repository
//! └── releases/
//!     └── <tag>/
//!         └── <asset name>     # Cached release asset
//! ```

use std::path::{Path, PathBuf};

use super::CacheError;
use crate::types::ReleaseTag;

/// Version of the on-disk layout. Bump when the layout changes incompatibly.
pub const CACHE_FORMAT_VERSION: &str = "1";

const VERSION_FILE: &str = ".ghmirror-version";

/// The two locations the pull path needs from the cache.
pub trait CacheLocation {
    /// Root of the bare git mirror.
    fn git_path(&self) -> PathBuf;

    /// Where the asset `file_name` of release `tag` is cached.
    ///
    /// `file_name` must already be validated as a single path component.
    fn asset_path(&self, tag: &ReleaseTag, file_name: &str) -> PathBuf;
}

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    root: PathBuf,
}

impl CacheDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the releases directory path: `{root}/releases`
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// Returns the lock file path: `{root}/.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Returns the format marker path: `{root}/.ghmirror-version`
    pub fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Make the root usable as a cache.
    ///
    /// A missing or empty root is initialized. A non-empty root must already
    /// carry a marker for the current format version.
    pub fn prepare(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.root)?;

        match std::fs::read_to_string(self.version_path()) {
            Ok(found) => {
                let found = found.trim();
                if found != CACHE_FORMAT_VERSION {
                    return Err(CacheError::IncompatibleVersion {
                        found: found.to_string(),
                        expected: CACHE_FORMAT_VERSION,
                    });
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if std::fs::read_dir(&self.root)?.next().is_some() {
                    return Err(CacheError::NotACache(self.root.clone()));
                }
                std::fs::write(self.version_path(), CACHE_FORMAT_VERSION)?;
                log::debug!("Initialized cache directory {}", self.root.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheLocation for CacheDirectory {
    /// `{root}/git`
    fn git_path(&self) -> PathBuf {
        self.root.join("git")
    }

    /// `{root}/releases/{encoded tag}/{file_name}`
    fn asset_path(&self, tag: &ReleaseTag, file_name: &str) -> PathBuf {
        self.releases_dir().join(tag_dir_name(tag)).join(file_name)
    }
}

/// Percent-encode a tag into one directory name.
///
/// Everything but `[A-Za-z0-9._~-]` is escaped, so `/` never splits the tag
/// and distinct tags never share a directory. A leading `.` is escaped too,
/// which keeps `.` and `..` from naming the parent or current directory.
fn tag_dir_name(tag: &ReleaseTag) -> String {
    let encoded = urlencoding::encode(tag.as_str());
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded.into_owned(),
    }
}

impl Default for CacheDirectory {
    /// Uses `dirs::cache_dir()` + "ghmirror"
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("ghmirror"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tag(s: &str) -> ReleaseTag {
        s.parse().unwrap()
    }

    #[test]
    fn layout() {
        let cache = CacheDirectory::new("cache-root");
        assert_eq!(cache.root(), Path::new("cache-root"));
        assert_eq!(cache.git_path(), PathBuf::from("cache-root/git"));
        assert_eq!(cache.lock_path(), PathBuf::from("cache-root/.lock"));
        assert_eq!(
            cache.asset_path(&tag("codeql-bundle-20200826"), "codeql-bundle.tar.gz"),
            PathBuf::from("cache-root/releases/codeql-bundle-20200826/codeql-bundle.tar.gz")
        );
    }

    #[test]
    fn asset_paths_are_distinct_per_tag() {
        let cache = CacheDirectory::new("cache-root");
        assert_ne!(
            cache.asset_path(&tag("a"), "bundle.tar.gz"),
            cache.asset_path(&tag("b"), "bundle.tar.gz")
        );
    }

    #[test]
    fn tags_with_separators_stay_one_directory() {
        let cache = CacheDirectory::new("cache-root");
        assert_eq!(
            cache.asset_path(&tag("codeql-bundle/v2.1.0"), "codeql-bundle.tar.gz"),
            PathBuf::from("cache-root/releases/codeql-bundle%2Fv2.1.0/codeql-bundle.tar.gz")
        );
        assert_ne!(
            cache.asset_path(&tag("a/b"), "x"),
            cache.asset_path(&tag("a%2Fb"), "x")
        );
    }

    #[test]
    fn dot_tags_cannot_escape_the_releases_dir() {
        let cache = CacheDirectory::new("cache-root");
        assert_eq!(
            cache.asset_path(&tag(".."), "x"),
            PathBuf::from("cache-root/releases/%2E./x")
        );
        assert_eq!(
            cache.asset_path(&tag("."), "x"),
            PathBuf::from("cache-root/releases/%2E/x")
        );
        assert_eq!(
            cache.asset_path(&tag("../../etc"), "x"),
            PathBuf::from("cache-root/releases/%2E.%2F..%2Fetc/x")
        );
    }

    #[test]
    fn default_ends_with_crate_name() {
        assert!(CacheDirectory::default().root().ends_with("ghmirror"));
    }

    #[test]
    fn prepare_initializes_missing_root() {
        let dir = tempdir().unwrap();
        let cache = CacheDirectory::new(dir.path().join("nested").join("cache"));

        cache.prepare().unwrap();

        assert_eq!(
            std::fs::read_to_string(cache.version_path()).unwrap(),
            CACHE_FORMAT_VERSION
        );
        // Second call accepts the marker it wrote.
        cache.prepare().unwrap();
    }

    #[test]
    fn prepare_refuses_foreign_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let err = CacheDirectory::new(dir.path()).prepare().unwrap_err();
        assert!(matches!(err, CacheError::NotACache(_)));
        assert!(!dir.path().join(VERSION_FILE).exists());
    }

    #[test]
    fn prepare_rejects_other_format_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "0\n").unwrap();

        let err = CacheDirectory::new(dir.path()).prepare().unwrap_err();
        match err {
            CacheError::IncompatibleVersion { found, expected } => {
                assert_eq!(found, "0");
                assert_eq!(expected, CACHE_FORMAT_VERSION);
            }
            other => panic!("expected IncompatibleVersion, got {:?}", other),
        }
    }
}
