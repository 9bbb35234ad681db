//! Error types for digest construction, diffing and scanning

use std::path::PathBuf;

use crate::hash::ContentHash;

/// Result type for digest operations
pub type Result<T> = std::result::Result<T, DigestError>;

/// Errors that can occur while building, querying or applying digests
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("Duplicate path {path:?} with conflicting hashes {first} and {second}")]
    DuplicatePath {
        path: String,
        first: ContentHash,
        second: ContentHash,
    },

    #[error("Malformed hash {value:?}: {reason}")]
    MalformedHash { value: String, reason: String },

    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Aggregate hash mismatch after apply: expected {expected}, got {actual}")]
    ApplyMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Changeset does not fit its base at {path:?}: {reason}")]
    ApplyConflict { path: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DigestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DigestError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means the client's cached view can't be patched
    /// and the full digest must be fetched instead.
    pub fn requires_full_fallback(&self) -> bool {
        matches!(
            self,
            DigestError::ApplyMismatch { .. } | DigestError::ApplyConflict { .. }
        )
    }
}
