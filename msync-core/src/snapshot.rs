//! Versioned server-side snapshots.
//!
//! The registry owns the authoritative digest. Each published digest gets
//! the next version number and is wrapped in an `Arc<Snapshot>`; swapping
//! the current snapshot is a single pointer replacement under a write
//! lock, and readers only hold the read lock long enough to clone the
//! `Arc`. Every response is computed from one snapshot, so the hash a
//! client checks and the changeset it receives always agree.
//!
//! A bounded number of previous snapshots is retained so clients a few
//! versions behind can still get an incremental changeset. Anything older
//! gets [`ChangesetResponse::FullFallbackRequired`].

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::diff::diff;
use crate::digest::DigestStore;
use crate::hash::ContentHash;
use crate::protocol::{
    AggregateHashResponse, ChangesetRequest, ChangesetResponse, FallbackReason,
    FullDigestResponse, HealthResponse, PROTOCOL_VERSION,
};

/// Default number of previous versions kept for incremental diffs.
pub const DEFAULT_HISTORY_DEPTH: usize = 8;

/// Version number of the first snapshot a registry holds.
pub const INITIAL_VERSION: u64 = 1;

/// A digest tagged with the version it was published as.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    store: DigestStore,
}

impl Snapshot {
    fn new(version: u64, store: DigestStore) -> Self {
        // Warm the aggregate cache outside of any lock.
        store.aggregate_hash();
        Self { version, store }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn store(&self) -> &DigestStore {
        &self.store
    }

    pub fn aggregate_hash(&self) -> ContentHash {
        self.store.aggregate_hash()
    }
}

/// Outcome of [`SnapshotRegistry::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub version: u64,
    pub aggregate_hash: ContentHash,
    /// False when the published digest equalled the current one.
    pub changed: bool,
}

struct RegistryState {
    current: Arc<Snapshot>,
    /// Oldest first.
    history: VecDeque<Arc<Snapshot>>,
}

impl RegistryState {
    fn find(&self, version: u64) -> Option<Arc<Snapshot>> {
        if self.current.version == version {
            return Some(self.current.clone());
        }
        self.history.iter().find(|s| s.version == version).cloned()
    }
}

/// Holder of the current snapshot and its retained predecessors.
pub struct SnapshotRegistry {
    state: RwLock<RegistryState>,
    history_depth: usize,
}

impl SnapshotRegistry {
    /// Create a registry whose first snapshot is `initial`.
    pub fn new(initial: DigestStore, history_depth: usize) -> Self {
        let current = Arc::new(Snapshot::new(INITIAL_VERSION, initial));
        info!(
            version = current.version,
            files = current.store.len(),
            aggregate = %current.aggregate_hash().short(),
            "Snapshot registry initialized"
        );
        Self {
            state: RwLock::new(RegistryState {
                current,
                history: VecDeque::with_capacity(history_depth),
            }),
            history_depth,
        }
    }

    /// Stable reference to the current snapshot
    pub async fn current(&self) -> Arc<Snapshot> {
        self.state.read().await.current.clone()
    }

    /// Versions that can still serve as a changeset baseline, oldest first.
    pub async fn retained_versions(&self) -> Vec<u64> {
        let state = self.state.read().await;
        state
            .history
            .iter()
            .map(|s| s.version)
            .chain(std::iter::once(state.current.version))
            .collect()
    }

    /// Make `store` the current snapshot.
    ///
    /// Publishing a digest identical to the current one does not bump the
    /// version.
    pub async fn publish(&self, store: DigestStore) -> PublishOutcome {
        let aggregate_hash = store.aggregate_hash();
        let mut state = self.state.write().await;

        if state.current.aggregate_hash() == aggregate_hash {
            debug!(version = state.current.version, "Publish skipped, digest unchanged");
            return PublishOutcome {
                version: state.current.version,
                aggregate_hash,
                changed: false,
            };
        }

        let next = Arc::new(Snapshot::new(state.current.version + 1, store));
        let previous = std::mem::replace(&mut state.current, next);
        if self.history_depth > 0 {
            state.history.push_back(previous);
            while state.history.len() > self.history_depth {
                if let Some(evicted) = state.history.pop_front() {
                    debug!(version = evicted.version, "Snapshot rotated out of history");
                }
            }
        }

        info!(
            version = state.current.version,
            files = state.current.store.len(),
            aggregate = %aggregate_hash.short(),
            "Published new snapshot"
        );

        PublishOutcome {
            version: state.current.version,
            aggregate_hash,
            changed: true,
        }
    }

    /// GetAggregateHash
    pub async fn aggregate_hash(&self) -> AggregateHashResponse {
        let current = self.current().await;
        AggregateHashResponse {
            aggregate_hash: current.aggregate_hash(),
            version: current.version,
            file_count: current.store.len(),
        }
    }

    /// GetChangeset
    pub async fn changeset(&self, request: &ChangesetRequest) -> ChangesetResponse {
        let (current, baseline) = {
            let state = self.state.read().await;
            (state.current.clone(), state.find(request.baseline_version))
        };

        let Some(baseline) = baseline else {
            debug!(
                baseline = request.baseline_version,
                current = current.version,
                "Baseline version not retained"
            );
            return ChangesetResponse::FullFallbackRequired {
                version: current.version,
                reason: FallbackReason::UnknownVersion,
            };
        };

        if let Some(claimed) = request.baseline_hash {
            if claimed != baseline.aggregate_hash() {
                debug!(
                    baseline = request.baseline_version,
                    claimed = %claimed.short(),
                    recorded = %baseline.aggregate_hash().short(),
                    "Baseline hash disagrees with recorded version"
                );
                return ChangesetResponse::FullFallbackRequired {
                    version: current.version,
                    reason: FallbackReason::BaselineMismatch,
                };
            }
        }

        let changeset = diff(&baseline.store, &current.store);
        debug!(
            base = baseline.version,
            version = current.version,
            changes = %changeset.summary(),
            "Computed changeset"
        );

        ChangesetResponse::Changeset {
            base_version: baseline.version,
            version: current.version,
            aggregate_hash: current.aggregate_hash(),
            changeset,
        }
    }

    /// GetFullDigest
    pub async fn full_digest(&self) -> FullDigestResponse {
        let current = self.current().await;
        FullDigestResponse {
            version: current.version,
            aggregate_hash: current.aggregate_hash(),
            file_count: current.store.len(),
            digest: current.store.clone(),
        }
    }

    /// Health/status surface
    pub async fn health(&self) -> HealthResponse {
        let current = self.current().await;
        HealthResponse {
            status: "healthy".to_string(),
            version: current.version,
            aggregate_hash: current.aggregate_hash(),
            file_count: current.store.len(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}
