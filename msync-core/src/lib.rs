//! msync Core Library
//!
//! Flat Merkle-digest synchronization:
//! - Content hashes and the path → hash digest with its aggregate hash
//! - Path-level diff and changeset application
//! - Versioned server snapshots with bounded history
//! - Sync protocol messages and the transport seam
//! - Client-side sync state machine
//! - Filesystem scanner

pub mod client;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod scanner;
pub mod snapshot;

pub use client::{
    ClientSyncState, FullSyncReason, StalenessReport, SyncClient, SyncError, SyncOutcome,
    SyncStatus, SyncStrategy,
};
pub use config::{ClientConfig, ServerConfig};
pub use diff::{diff, unchanged, ChangeSummary, Changeset, ModifiedEntry};
pub use digest::{DigestEntry, DigestStore};
pub use error::{DigestError, Result};
pub use hash::ContentHash;
pub use protocol::{
    AggregateHashResponse, ChangesetRequest, ChangesetResponse, FallbackReason,
    FullDigestResponse, HealthResponse, LocalTransport, RescanResponse, SyncTransport,
    PROTOCOL_VERSION,
};
pub use scanner::{ScanConfig, Scanner};
pub use snapshot::{PublishOutcome, Snapshot, SnapshotRegistry};
