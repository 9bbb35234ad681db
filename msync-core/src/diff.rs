//! Path-level diff between two digests
//!
//! [`diff`] classifies every path of `old ∪ new` into exactly one of
//! added, modified, deleted or unchanged. Unchanged paths are never part
//! of a [`Changeset`]; [`unchanged`] computes them on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::{validate_path, DigestEntry, DigestStore};
use crate::error::{DigestError, Result};
use crate::hash::ContentHash;

/// A path whose hash changed between two digests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedEntry {
    pub path: String,
    pub old_hash: ContentHash,
    pub new_hash: ContentHash,
}

/// Added, modified and deleted paths between two digests.
///
/// All three lists are sorted by path and never share a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub added: Vec<DigestEntry>,
    pub modified: Vec<ModifiedEntry>,
    pub deleted: Vec<String>,
}

/// Change counts, mostly for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "+{} ~{} -{}",
            self.added, self.modified, self.deleted
        )
    }
}

/// Compare two digests.
///
/// Stores with equal aggregate hashes return an empty changeset without
/// looking at individual paths.
pub fn diff(old: &DigestStore, new: &DigestStore) -> Changeset {
    if old.aggregate_hash() == new.aggregate_hash() {
        return Changeset::default();
    }

    let old_map = old.map();
    let new_map = new.map();
    let mut changes = Changeset::default();

    for (path, new_hash) in new_map {
        match old_map.get(path) {
            None => changes.added.push(DigestEntry {
                path: path.clone(),
                hash: *new_hash,
            }),
            Some(old_hash) if old_hash != new_hash => changes.modified.push(ModifiedEntry {
                path: path.clone(),
                old_hash: *old_hash,
                new_hash: *new_hash,
            }),
            Some(_) => {}
        }
    }

    changes.deleted = old_map
        .keys()
        .filter(|path| !new_map.contains_key(*path))
        .cloned()
        .collect();

    changes
}

/// Paths present in both digests with identical hashes
pub fn unchanged(old: &DigestStore, new: &DigestStore) -> Vec<String> {
    let new_map = new.map();
    old.map()
        .iter()
        .filter(|(path, hash)| new_map.get(*path) == Some(*hash))
        .map(|(path, _)| path.clone())
        .collect()
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    /// All paths touched by this changeset
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.added
            .iter()
            .map(|e| e.path.as_str())
            .chain(self.modified.iter().map(|e| e.path.as_str()))
            .chain(self.deleted.iter().map(String::as_str))
    }

    /// Apply this changeset to `base`, producing a new store.
    ///
    /// `base` is left untouched. The changeset must describe `base`
    /// exactly: deleted and modified paths must exist in it (with the
    /// recorded old hash for modified), added paths must not. Anything else
    /// is an [`DigestError::ApplyConflict`].
    pub fn apply(&self, base: &DigestStore) -> Result<DigestStore> {
        let mut entries: BTreeMap<String, ContentHash> = base.map().clone();

        for path in &self.deleted {
            if entries.remove(path).is_none() {
                return Err(conflict(path, "deleted path is not in the base digest"));
            }
        }

        for entry in &self.modified {
            match entries.get_mut(&entry.path) {
                Some(current) if *current == entry.old_hash => *current = entry.new_hash,
                Some(current) => {
                    return Err(conflict(
                        &entry.path,
                        &format!("base has {}, changeset expects {}", current, entry.old_hash),
                    ));
                }
                None => return Err(conflict(&entry.path, "modified path is not in the base digest")),
            }
        }

        for entry in &self.added {
            validate_path(&entry.path)?;
            if entries.insert(entry.path.clone(), entry.hash).is_some() {
                return Err(conflict(&entry.path, "added path already exists in the base digest"));
            }
        }

        Ok(DigestStore::from_map(entries))
    }
}

fn conflict(path: &str, reason: &str) -> DigestError {
    DigestError::ApplyConflict {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
