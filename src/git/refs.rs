//! Ref sets and the plan that reconciles a local mirror with its upstream.
//!
//! Ref names form a slash-delimited namespace in which a name cannot be both
//! a leaf and a directory: `refs/heads/x` and `refs/heads/x/y` cannot coexist.
//! `RefUpdatePlan::compute` finds those collisions explicitly so stale refs are
//! deleted before the incoming ones are written.

use std::collections::{BTreeMap, BTreeSet};

use git2::Oid;
use thiserror::Error;

use super::GitError;

/// Two refs that cannot both exist because one is a path prefix of the other.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ref {name} conflicts with {other}")]
pub struct RefConflict {
    pub name: String,
    pub other: String,
}

/// Mapping from full ref name (e.g. `refs/heads/main`) to target object id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefMap(BTreeMap<String, Oid>);

impl RefMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, target: Oid) -> Option<Oid> {
        self.0.insert(name.into(), target)
    }

    pub fn get(&self, name: &str) -> Option<Oid> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Oid)> {
        self.0.iter().map(|(name, oid)| (name.as_str(), *oid))
    }

    /// Names whose target differs between the two maps, including names only one has.
    pub fn differing<'a>(&'a self, other: &'a RefMap) -> BTreeSet<&'a str> {
        self.0
            .keys()
            .chain(other.0.keys())
            .map(String::as_str)
            .filter(|name| self.get(name) != other.get(name))
            .collect()
    }

    /// Existing names that `name` would collide with: strict ancestors
    /// (`refs/heads/x` for `refs/heads/x/y`) and strict descendants.
    pub fn conflicts(&self, name: &str) -> Vec<&str> {
        let mut found: Vec<&str> = name
            .match_indices('/')
            .map(|(i, _)| &name[..i])
            .filter_map(|prefix| self.0.get_key_value(prefix).map(|(k, _)| k.as_str()))
            .collect();

        let dir = format!("{}/", name);
        found.extend(
            self.0
                .range(dir.clone()..)
                .take_while(|(k, _)| k.starts_with(&dir))
                .map(|(k, _)| k.as_str()),
        );
        found
    }

    /// Parse `git ls-remote` output.
    ///
    /// `HEAD`, other non-`refs/` entries and peeled tag lines (`^{}`) are
    /// skipped; they are derived data, not refs of their own.
    pub fn parse_ls_remote(output: &str) -> Result<Self, GitError> {
        let mut refs = RefMap::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let (oid, name) = line
                .split_once('\t')
                .ok_or_else(|| GitError::ParseError(format!("malformed ls-remote line: {line}")))?;
            if !name.starts_with("refs/") || name.ends_with("^{}") {
                continue;
            }
            let oid = Oid::from_str(oid.trim()).map_err(|e| {
                GitError::ParseError(format!("invalid object id for {name}: {e}"))
            })?;
            refs.insert(name, oid);
        }
        Ok(refs)
    }
}

impl FromIterator<(String, Oid)> for RefMap {
    fn from_iter<T: IntoIterator<Item = (String, Oid)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What has to change locally for a mirror to equal its upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefUpdatePlan {
    /// Local refs absent upstream, in name order.
    pub deletes: Vec<String>,
    /// Refs new upstream.
    pub creates: Vec<(String, Oid)>,
    /// Refs whose target moved, as (name, old, new). Moves need not be fast-forwards.
    pub updates: Vec<(String, Oid, Oid)>,
    /// Subset of `deletes` occupying a slot an incoming ref needs, as (stale, incoming).
    pub collisions: Vec<(String, String)>,
}

impl RefUpdatePlan {
    /// Compute the changes that turn `local` into `remote`.
    ///
    /// Fails only if `remote` itself contains colliding names, which no valid
    /// repository can have.
    pub fn compute(local: &RefMap, remote: &RefMap) -> Result<Self, RefConflict> {
        for (name, _) in remote.iter() {
            if let Some(other) = remote.conflicts(name).first() {
                return Err(RefConflict {
                    name: name.to_string(),
                    other: other.to_string(),
                });
            }
        }

        let mut plan = RefUpdatePlan::default();

        for (name, _) in local.iter() {
            if !remote.contains(name) {
                plan.deletes.push(name.to_string());
            }
        }

        for (name, target) in remote.iter() {
            match local.get(name) {
                None => {
                    plan.creates.push((name.to_string(), target));
                    for stale in local.conflicts(name) {
                        plan.collisions.push((stale.to_string(), name.to_string()));
                    }
                }
                Some(current) if current != target => {
                    plan.updates.push((name.to_string(), current, target));
                }
                Some(_) => {}
            }
        }

        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.creates.is_empty() && self.updates.is_empty()
    }

    /// The incoming ref that `name` is deleted to make room for, if any.
    pub fn collision_for(&self, name: &str) -> Option<&str> {
        self.collisions
            .iter()
            .find(|(stale, _)| stale == name)
            .map(|(_, incoming)| incoming.as_str())
    }
}
