//! Sync protocol messages and the transport seam.
//!
//! The server answers three questions: what is your aggregate hash, what
//! changed since version V, and give me everything. These types are the
//! JSON bodies exchanged for each of them; [`SyncTransport`] is what the
//! client state machine talks to, whether the server is remote (HTTP) or
//! in-process ([`LocalTransport`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::diff::Changeset;
use crate::digest::DigestStore;
use crate::hash::ContentHash;
use crate::snapshot::SnapshotRegistry;

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Answer to the cheap staleness question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateHashResponse {
    pub aggregate_hash: ContentHash,
    pub version: u64,
    pub file_count: usize,
}

/// Request for the changes since a baseline version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetRequest {
    /// Version the client last synchronized against.
    pub baseline_version: u64,
    /// Aggregate hash the client holds for that version. When present the
    /// server refuses to diff if its own record of the version disagrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_hash: Option<ContentHash>,
}

/// Why the server could not produce an incremental changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Baseline version was never published or has been rotated out.
    UnknownVersion,
    /// Baseline version exists but its aggregate hash differs from the
    /// client's.
    BaselineMismatch,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::UnknownVersion => write!(f, "baseline version unknown"),
            FallbackReason::BaselineMismatch => write!(f, "baseline hash mismatch"),
        }
    }
}

/// Answer to a changeset request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangesetResponse {
    Changeset {
        base_version: u64,
        /// Version the changeset leads to.
        version: u64,
        /// Aggregate hash of `version`; the client checks its patched
        /// digest against it.
        aggregate_hash: ContentHash,
        changeset: Changeset,
    },
    FullFallbackRequired {
        version: u64,
        reason: FallbackReason,
    },
}

/// Complete digest of one server version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDigestResponse {
    pub version: u64,
    pub aggregate_hash: ContentHash,
    pub file_count: usize,
    pub digest: DigestStore,
}

/// Liveness/readiness body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: u64,
    pub aggregate_hash: ContentHash,
    pub file_count: usize,
    pub protocol_version: u32,
}

/// Result of a server-side rescan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanResponse {
    pub version: u64,
    pub aggregate_hash: ContentHash,
    pub file_count: usize,
    pub changed: bool,
}

/// The three logical operations a sync client needs from a server.
///
/// Implementations surface transport failures as errors and never retry
/// on their own.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn get_aggregate_hash(&self) -> anyhow::Result<AggregateHashResponse>;

    async fn get_changeset(&self, request: &ChangesetRequest) -> anyhow::Result<ChangesetResponse>;

    async fn get_full_digest(&self) -> anyhow::Result<FullDigestResponse>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn get_aggregate_hash(&self) -> anyhow::Result<AggregateHashResponse> {
        (**self).get_aggregate_hash().await
    }

    async fn get_changeset(&self, request: &ChangesetRequest) -> anyhow::Result<ChangesetResponse> {
        (**self).get_changeset(request).await
    }

    async fn get_full_digest(&self) -> anyhow::Result<FullDigestResponse> {
        (**self).get_full_digest().await
    }
}

/// Transport that talks to a registry in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    registry: Arc<SnapshotRegistry>,
}

impl LocalTransport {
    pub fn new(registry: Arc<SnapshotRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn get_aggregate_hash(&self) -> anyhow::Result<AggregateHashResponse> {
        Ok(self.registry.aggregate_hash().await)
    }

    async fn get_changeset(&self, request: &ChangesetRequest) -> anyhow::Result<ChangesetResponse> {
        Ok(self.registry.changeset(request).await)
    }

    async fn get_full_digest(&self) -> anyhow::Result<FullDigestResponse> {
        Ok(self.registry.full_digest().await)
    }
}
