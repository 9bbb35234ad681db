//! Flat path → content-hash digest of a file set.
//!
//! A [`DigestStore`] is built once, validated up front, and never mutated.
//! Anything that "changes" a digest (applying a changeset, rescanning a
//! directory) produces a new store. Because stores are immutable, the
//! aggregate hash is computed lazily and cached for the lifetime of the
//! store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::OnceLock;

use crate::error::{DigestError, Result};
use crate::hash::ContentHash;

/// One (path, hash) pair of a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub path: String,
    pub hash: ContentHash,
}

/// Unvalidated entry as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
struct WireEntry {
    path: String,
    hash: String,
}

/// Immutable mapping from path to content hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<WireEntry>", into = "Vec<DigestEntry>")]
pub struct DigestStore {
    entries: BTreeMap<String, ContentHash>,
    aggregate: OnceLock<ContentHash>,
}

impl DigestStore {
    /// The empty digest
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a store from (path, hex hash) pairs.
    ///
    /// Fails on the first malformed hash, invalid path, or path that
    /// appears twice with different hashes. An exact repeat of an entry is
    /// collapsed. Nothing is built unless every entry validates.
    pub fn build<I, P, H>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, H)>,
        P: Into<String>,
        H: AsRef<str>,
    {
        let parsed = entries
            .into_iter()
            .map(|(path, hash)| {
                let path = path.into();
                let hash = ContentHash::from_hex(hash.as_ref()).map_err(|e| match e {
                    DigestError::MalformedHash { value, reason } => DigestError::MalformedHash {
                        value,
                        reason: format!("{} (path {:?})", reason, path),
                    },
                    other => other,
                })?;
                Ok((path, hash))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_hashes(parsed)
    }

    /// Build a store from already-parsed hashes.
    pub fn from_hashes<I, P>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, ContentHash)>,
        P: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (path, hash) in entries {
            let path = path.into();
            validate_path(&path)?;
            match map.entry(path) {
                Entry::Vacant(slot) => {
                    slot.insert(hash);
                }
                Entry::Occupied(slot) => {
                    if *slot.get() != hash {
                        return Err(DigestError::DuplicatePath {
                            path: slot.key().clone(),
                            first: *slot.get(),
                            second: hash,
                        });
                    }
                }
            }
        }
        Ok(Self::from_map(map))
    }

    /// Wrap a map whose paths were validated by the caller.
    pub(crate) fn from_map(entries: BTreeMap<String, ContentHash>) -> Self {
        Self {
            entries,
            aggregate: OnceLock::new(),
        }
    }

    /// Aggregate hash over the whole digest.
    ///
    /// SHA-256 over `path \0 hex(hash)` for every entry in byte-wise path
    /// order, so the result depends only on the set of entries.
    pub fn aggregate_hash(&self) -> ContentHash {
        *self.aggregate.get_or_init(|| {
            let mut hasher = Sha256::new();
            for (path, hash) in &self.entries {
                hasher.update(path.as_bytes());
                hasher.update([0u8]);
                hasher.update(hash.to_hex().as_bytes());
            }
            ContentHash::new(hasher.finalize().into())
        })
    }

    /// Look up the hash recorded for `path`
    pub fn get(&self, path: &str) -> Result<ContentHash> {
        self.entries
            .get(path)
            .copied()
            .ok_or_else(|| DigestError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate (path, hash) pairs in path order. Call again to restart.
    pub fn entries(&self) -> impl Iterator<Item = (&str, ContentHash)> + '_ {
        self.entries.iter().map(|(p, h)| (p.as_str(), *h))
    }

    /// Iterate paths in path order
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn map(&self) -> &BTreeMap<String, ContentHash> {
        &self.entries
    }
}

impl PartialEq for DigestStore {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for DigestStore {}

impl TryFrom<Vec<WireEntry>> for DigestStore {
    type Error = DigestError;

    fn try_from(entries: Vec<WireEntry>) -> Result<Self> {
        Self::build(entries.into_iter().map(|e| (e.path, e.hash)))
    }
}

impl From<DigestStore> for Vec<DigestEntry> {
    fn from(store: DigestStore) -> Self {
        store
            .entries
            .into_iter()
            .map(|(path, hash)| DigestEntry { path, hash })
            .collect()
    }
}

/// Paths are relative, `/`-separated, and free of NUL (the aggregate
/// separator).
pub(crate) fn validate_path(path: &str) -> Result<()> {
    let reason = if path.is_empty() {
        "path is empty"
    } else if path.contains('\0') {
        "path contains NUL"
    } else if path.starts_with('/') {
        "path must be relative"
    } else {
        return Ok(());
    };
    Err(DigestError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    })
}
