//! Fixtures shared by unit tests: upstream repositories built with libgit2
//! and an in-memory releases API.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Mutex;

use git2::{Oid, Repository, Signature};

use crate::releases::{ApiError, ReleaseApi};
use crate::types::{Asset, Release, ReleaseTag, RepoKey};

/// Whether the `git` binary is on PATH. Tests that shell out skip without it.
pub fn git_available() -> bool {
    let ok = std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !ok {
        eprintln!("skipping test: git binary not available");
    }
    ok
}

/// A bare repository standing in for the upstream host.
pub struct UpstreamRepo {
    repo: Repository,
    url: String,
    commits: Cell<u32>,
}

impl UpstreamRepo {
    pub fn init(path: &Path) -> Self {
        let repo = Repository::init_bare(path).unwrap();
        Self {
            repo,
            url: path.to_str().unwrap().to_string(),
            commits: Cell::new(0),
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Clone URL (a local path).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create a commit with the given `(path, contents)` files without moving any ref.
    pub fn commit(&self, files: &[(&str, &str)], parents: &[Oid]) -> Oid {
        let n = self.commits.get() + 1;
        self.commits.set(n);

        let entries: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (*p, c.as_bytes())).collect();
        let tree_id = self.build_tree(&entries);
        let tree = self.repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Upstream", "upstream@example.com").unwrap();
        let parents: Vec<git2::Commit<'_>> = parents
            .iter()
            .map(|id| self.repo.find_commit(*id).unwrap())
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        self.repo
            .commit(None, &sig, &sig, &format!("commit {}", n), &tree, &parent_refs)
            .unwrap()
    }

    fn build_tree(&self, entries: &[(&str, &[u8])]) -> Oid {
        let mut files: Vec<(&str, &[u8])> = Vec::new();
        let mut dirs: BTreeMap<&str, Vec<(&str, &[u8])>> = BTreeMap::new();
        for (path, contents) in entries {
            match path.split_once('/') {
                Some((dir, rest)) => dirs.entry(dir).or_default().push((rest, *contents)),
                None => files.push((*path, *contents)),
            }
        }

        let mut builder = self.repo.treebuilder(None).unwrap();
        for (name, contents) in files {
            let blob = self.repo.blob(contents).unwrap();
            builder.insert(name, blob, 0o100644).unwrap();
        }
        for (name, children) in dirs {
            let subtree = self.build_tree(&children);
            builder.insert(name, subtree, 0o040000).unwrap();
        }
        builder.write().unwrap()
    }

    /// Create or force-move a direct ref.
    pub fn set_ref(&self, name: &str, target: Oid) {
        self.repo.reference(name, target, true, "fixture").unwrap();
    }

    pub fn delete_ref(&self, name: &str) {
        self.repo.find_reference(name).unwrap().delete().unwrap();
    }

    /// Create an annotated tag object pointing at `target` and a ref to it.
    pub fn annotated_tag(&self, name: &str, target: Oid) -> Oid {
        let object = self.repo.find_object(target, None).unwrap();
        let sig = Signature::now("Upstream", "upstream@example.com").unwrap();
        self.repo.tag(name, &object, &sig, name, true).unwrap()
    }

    /// Point HEAD at `name` symbolically.
    pub fn set_head(&self, name: &str) {
        self.repo.set_head(name).unwrap();
    }
}

/// Read every file under `dir` into a map keyed by relative path.
pub fn snapshot_dir(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

pub const MAIN_BUNDLE: &str = "some-codeql-version-on-main";
pub const V1_V2_BUNDLE: &str = "some-codeql-version-on-v1-and-v2";

fn defaults_json(bundle: &str) -> String {
    format!("{{\n  \"bundleVersion\": \"{}\"\n}}\n", bundle)
}

/// An upstream shaped like a maintained action repository:
///
/// - `main` and `v1` carry `src/defaults.json` naming their bundle release
/// - tag `v2` points at the same commit as `v1`
/// - `v3` matches the branch pattern but has no defaults file
/// - a branch and a tag that match no pattern at all
/// - `a-ref-that-will-need-pruning`, later renamed into a deeper path
pub struct ActionUpstream {
    pub upstream: UpstreamRepo,
    pub main: Oid,
    pub v1: Oid,
    pub v3: Oid,
    pub ignored: Oid,
}

impl ActionUpstream {
    pub fn create(path: &Path) -> Self {
        let upstream = UpstreamRepo::init(path);
        let root = upstream.commit(&[("README.md", "action")], &[]);
        let v1 = upstream.commit(
            &[
                ("README.md", "action"),
                ("src/defaults.json", &defaults_json(V1_V2_BUNDLE)),
            ],
            &[root],
        );
        let main = upstream.commit(
            &[
                ("README.md", "action"),
                ("src/defaults.json", &defaults_json(MAIN_BUNDLE)),
            ],
            &[v1],
        );
        let v3 = upstream.commit(&[("README.md", "v3 without defaults")], &[main]);
        let ignored = upstream.commit(&[("notes.txt", "ignore me")], &[root]);

        upstream.set_ref("refs/heads/main", main);
        upstream.set_ref("refs/heads/v1", v1);
        upstream.set_ref("refs/heads/v3", v3);
        upstream.set_ref("refs/tags/v2", v1);
        upstream.set_ref("refs/heads/very-ignored-branch", ignored);
        upstream.set_ref("refs/tags/an-ignored-tag-too", ignored);
        upstream.set_ref("refs/heads/a-ref-that-will-need-pruning", v1);
        upstream.set_head("refs/heads/main");

        Self {
            upstream,
            main,
            v1,
            v3,
            ignored,
        }
    }

    pub fn url(&self) -> &str {
        self.upstream.url()
    }

    /// Every ref the initial upstream has, excluding HEAD.
    pub fn initial_refs(&self) -> Vec<(String, Oid)> {
        sorted(vec![
            ("refs/heads/main", self.main),
            ("refs/heads/v1", self.v1),
            ("refs/heads/v3", self.v3),
            ("refs/tags/v2", self.v1),
            ("refs/heads/very-ignored-branch", self.ignored),
            ("refs/tags/an-ignored-tag-too", self.ignored),
            ("refs/heads/a-ref-that-will-need-pruning", self.v1),
        ])
    }

    /// Force-push `v3` to an unrelated commit, add `v4`, drop tag `v2` and
    /// `very-ignored-branch`, and rename `a-ref-that-will-need-pruning` into a
    /// path below its old name. Returns the resulting ref set.
    pub fn apply_modifications(&self) -> Vec<(String, Oid)> {
        let new_v3 = self.upstream.commit(&[("README.md", "rewritten v3")], &[]);
        let v4 = self.upstream.commit(
            &[
                ("README.md", "v4"),
                ("src/defaults.json", &defaults_json("some-codeql-version-on-v4")),
            ],
            &[self.main],
        );

        self.upstream.set_ref("refs/heads/v3", new_v3);
        self.upstream.set_ref("refs/heads/v4", v4);
        self.upstream.delete_ref("refs/tags/v2");
        self.upstream.delete_ref("refs/heads/very-ignored-branch");
        self.upstream.delete_ref("refs/heads/a-ref-that-will-need-pruning");
        self.upstream.set_ref(
            "refs/heads/a-ref-that-will-need-pruning/because-it-now-has-this-extra-bit",
            self.v1,
        );

        sorted(vec![
            ("refs/heads/main", self.main),
            ("refs/heads/v1", self.v1),
            ("refs/heads/v3", new_v3),
            ("refs/heads/v4", v4),
            ("refs/tags/an-ignored-tag-too", self.ignored),
            (
                "refs/heads/a-ref-that-will-need-pruning/because-it-now-has-this-extra-bit",
                self.v1,
            ),
        ])
    }
}

fn sorted(refs: Vec<(&str, Oid)>) -> Vec<(String, Oid)> {
    let mut refs: Vec<(String, Oid)> = refs.into_iter().map(|(n, o)| (n.to_string(), o)).collect();
    refs.sort();
    refs
}

/// In-memory releases API that records every download.
#[derive(Default)]
pub struct FakeReleaseApi {
    releases: HashMap<String, Release>,
    bodies: HashMap<u64, Vec<u8>>,
    /// Status and remaining count of failures to inject per asset id.
    failures: Mutex<HashMap<u64, (u16, u32)>>,
    downloads: Mutex<Vec<u64>>,
}

impl FakeReleaseApi {
    /// Publish a release whose assets report the size of their body.
    pub fn add_release(&mut self, tag: &str, assets: &[(u64, &str, &[u8])]) {
        let release = Release {
            tag_name: tag.to_string(),
            name: Some(tag.to_string()),
            assets: assets
                .iter()
                .map(|(id, name, body)| Asset {
                    id: *id,
                    name: name.to_string(),
                    size: body.len() as u64,
                })
                .collect(),
        };
        for (id, _, body) in assets {
            self.bodies.insert(*id, body.to_vec());
        }
        self.releases.insert(tag.to_string(), release);
    }

    /// Serve `body` for `asset_id` without changing the advertised size.
    pub fn set_body(&mut self, asset_id: u64, body: &[u8]) {
        self.bodies.insert(asset_id, body.to_vec());
    }

    /// Fail the next `times` downloads of `asset_id` with HTTP `status`.
    pub fn fail(&self, asset_id: u64, status: u16, times: u32) {
        self.failures.lock().unwrap().insert(asset_id, (status, times));
    }

    /// Asset ids in the order they were requested.
    pub fn downloads(&self) -> Vec<u64> {
        self.downloads.lock().unwrap().clone()
    }
}

impl ReleaseApi for FakeReleaseApi {
    fn get_release_by_tag(&self, _repo: &RepoKey, tag: &ReleaseTag) -> Result<Option<Release>, ApiError> {
        Ok(self.releases.get(tag.as_str()).cloned())
    }

    fn download_asset(&self, _repo: &RepoKey, asset_id: u64) -> Result<Box<dyn Read + Send>, ApiError> {
        self.downloads.lock().unwrap().push(asset_id);
        if let Some((status, remaining)) = self.failures.lock().unwrap().get_mut(&asset_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApiError::Status {
                    status: *status,
                    url: format!("fake://assets/{}", asset_id),
                });
            }
        }
        let body = self.bodies.get(&asset_id).cloned().unwrap_or_default();
        Ok(Box::new(Cursor::new(body)))
    }
}
