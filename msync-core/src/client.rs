//! Client-side sync state machine.
//!
//! ```text
//!   NeverSynced ──check──▶ Stale ◀──check──▶ InSync
//!                            │                  ▲
//!                            └──────sync────────┘
//!   any synced state ──local drift──▶ Diverged ──reset──▶ Stale
//! ```
//!
//! The client keeps one cached digest. Syncing never patches it in place:
//! a changeset is applied to a copy, the copy's aggregate hash is checked
//! against what the server reported, and only then is the whole state
//! replaced. A failure at any step leaves the previous state untouched.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::diff::{diff, Changeset};
use crate::digest::DigestStore;
use crate::error::DigestError;
use crate::hash::ContentHash;
use crate::protocol::{
    AggregateHashResponse, ChangesetRequest, ChangesetResponse, FallbackReason, SyncTransport,
};
use crate::scanner::{ScanConfig, Scanner};

/// Name of the persisted client state file inside the state directory
pub const STATE_FILE: &str = "sync-state.json";

/// Where the client stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NeverSynced,
    Stale,
    InSync,
    /// Local files disagree with the cached digest. Stays until reset.
    Diverged,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::NeverSynced => "never synced",
            SyncStatus::Stale => "stale",
            SyncStatus::InSync => "in sync",
            SyncStatus::Diverged => "diverged",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by [`SyncClient`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Local files diverged from the cached digest; reset before syncing")]
    Diverged,

    #[error("Full digest failed verification: expected {expected}, got {actual}")]
    IntegrityFailure {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("Transport error: {0:#}")]
    Transport(anyhow::Error),
}

/// Everything the client knows about its last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSyncState {
    pub status: SyncStatus,
    /// Server version the cached digest corresponds to.
    pub version: Option<u64>,
    pub aggregate_hash: Option<ContentHash>,
    pub digest: DigestStore,
    /// Unix seconds of the last successful sync (0 if never).
    pub last_sync_timestamp: i64,
}

impl Default for ClientSyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSyncState {
    /// Fresh state for a client that has never talked to a server.
    pub fn new() -> Self {
        Self {
            status: SyncStatus::NeverSynced,
            version: None,
            aggregate_hash: None,
            digest: DigestStore::empty(),
            last_sync_timestamp: 0,
        }
    }

    /// Load state from a state directory.
    ///
    /// A recorded aggregate hash that doesn't match the stored digest means
    /// the file was tampered with or truncated; that is an error rather than
    /// a silent reset.
    pub fn load(state_dir: &Path) -> anyhow::Result<Option<Self>> {
        let state_path = Self::state_file_path(state_dir);
        if !state_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read sync state from {:?}", state_path))?;
        let state: ClientSyncState =
            serde_json::from_str(&data).with_context(|| "Failed to parse sync state JSON")?;

        if let Some(recorded) = state.aggregate_hash {
            let actual = state.digest.aggregate_hash();
            if recorded != actual {
                return Err(anyhow!(
                    "Sync state at {:?} is inconsistent: recorded aggregate {}, digest hashes to {}",
                    state_path,
                    recorded,
                    actual
                ));
            }
        }
        Ok(Some(state))
    }

    /// Save state to a state directory (write to a temp file, then rename).
    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        let state_path = Self::state_file_path(state_dir);
        fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
        let tmp_path = state_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &state_path)?;
        Ok(())
    }

    /// Remove persisted state.
    pub fn remove(state_dir: &Path) -> anyhow::Result<()> {
        let state_path = Self::state_file_path(state_dir);
        if state_path.exists() {
            fs::remove_file(&state_path)?;
        }
        Ok(())
    }

    pub fn state_file_path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }
}

/// Result of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessReport {
    pub status: SyncStatus,
    pub server: AggregateHashResponse,
    pub local_hash: Option<ContentHash>,
}

impl StalenessReport {
    pub fn in_sync(&self) -> bool {
        self.local_hash == Some(self.server.aggregate_hash)
    }
}

/// Why a sync downloaded the whole digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncReason {
    NeverSynced,
    ServerRequested(FallbackReason),
    /// The changeset did not reproduce the server's aggregate hash.
    ApplyFailed,
}

/// How a sync converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Aggregate hashes already matched; nothing was transferred.
    UpToDate,
    Incremental,
    Full(FullSyncReason),
}

/// What a successful sync did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub strategy: SyncStrategy,
    /// Changes between the previous cache and the new one.
    pub changeset: Changeset,
    pub version: u64,
    pub aggregate_hash: ContentHash,
}

/// Client that keeps a cached digest converged with a server.
pub struct SyncClient<T: SyncTransport> {
    transport: T,
    state: ClientSyncState,
}

impl<T: SyncTransport> SyncClient<T> {
    /// Client with no cached digest.
    pub fn new(transport: T) -> Self {
        Self::with_state(transport, ClientSyncState::new())
    }

    /// Client resuming from previously persisted state.
    pub fn with_state(transport: T, state: ClientSyncState) -> Self {
        Self { transport, state }
    }

    pub fn state(&self) -> &ClientSyncState {
        &self.state
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status
    }

    pub fn digest(&self) -> &DigestStore {
        &self.state.digest
    }

    pub fn into_state(self) -> ClientSyncState {
        self.state
    }

    /// Ask the server for its aggregate hash only and update the status.
    ///
    /// A transport failure leaves the status unchanged.
    pub async fn check_staleness(&mut self) -> Result<StalenessReport, SyncError> {
        let server = self
            .transport
            .get_aggregate_hash()
            .await
            .map_err(SyncError::Transport)?;

        let matches = self.state.status != SyncStatus::NeverSynced
            && self.state.aggregate_hash == Some(server.aggregate_hash);

        if matches && self.state.version != Some(server.version) {
            // Same content under a new version number (e.g. a restarted
            // server); track the server's numbering for the next baseline.
            debug!(
                from = ?self.state.version,
                to = server.version,
                "Adopting server version for identical digest"
            );
            self.state.version = Some(server.version);
        }

        if self.state.status != SyncStatus::Diverged {
            self.state.status = if matches {
                SyncStatus::InSync
            } else {
                SyncStatus::Stale
            };
        }

        debug!(
            status = %self.state.status,
            server_version = server.version,
            server_hash = %server.aggregate_hash.short(),
            "Staleness check"
        );

        Ok(StalenessReport {
            status: self.state.status,
            local_hash: self.state.aggregate_hash,
            server,
        })
    }

    /// Converge the cached digest to the server's current one.
    pub async fn sync(&mut self) -> Result<SyncOutcome, SyncError> {
        if self.state.status == SyncStatus::Diverged {
            return Err(SyncError::Diverged);
        }

        let report = self.check_staleness().await?;
        if report.status == SyncStatus::InSync {
            return Ok(SyncOutcome {
                strategy: SyncStrategy::UpToDate,
                changeset: Changeset::default(),
                version: report.server.version,
                aggregate_hash: report.server.aggregate_hash,
            });
        }

        let Some(baseline_version) = self.state.version else {
            return self.full_sync(FullSyncReason::NeverSynced).await;
        };

        let request = ChangesetRequest {
            baseline_version,
            baseline_hash: self.state.aggregate_hash,
        };
        let response = self
            .transport
            .get_changeset(&request)
            .await
            .map_err(SyncError::Transport)?;

        match response {
            ChangesetResponse::Changeset {
                base_version,
                version,
                aggregate_hash,
                changeset,
            } => {
                if base_version != baseline_version {
                    warn!(
                        requested = baseline_version,
                        received = base_version,
                        "Changeset answered against a different baseline"
                    );
                    return self.full_sync(FullSyncReason::ApplyFailed).await;
                }
                match self.apply_verified(&changeset, aggregate_hash) {
                    Ok(store) => {
                        info!(
                            from = baseline_version,
                            to = version,
                            changes = %changeset.summary(),
                            "Applied incremental changeset"
                        );
                        self.commit(store, version, aggregate_hash);
                        Ok(SyncOutcome {
                            strategy: SyncStrategy::Incremental,
                            changeset,
                            version,
                            aggregate_hash,
                        })
                    }
                    Err(e) if e.requires_full_fallback() => {
                        warn!("Changeset rejected ({}), falling back to full digest", e);
                        self.full_sync(FullSyncReason::ApplyFailed).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            ChangesetResponse::FullFallbackRequired { version, reason } => {
                info!(server_version = version, %reason, "Server requested full digest");
                self.full_sync(FullSyncReason::ServerRequested(reason)).await
            }
        }
    }

    /// Diff the cached digest against a freshly scanned one.
    ///
    /// Any difference marks the client `Diverged`. A client that never
    /// completed a sync has no baseline to diverge from, so its status is
    /// left alone even after a staleness check moved it to `Stale`.
    pub fn detect_local_drift(&mut self, scanned: &DigestStore) -> Changeset {
        let changes = diff(&self.state.digest, scanned);
        if !changes.is_empty() && self.state.version.is_some() {
            if self.state.status != SyncStatus::Diverged {
                warn!(changes = %changes.summary(), "Local files diverged from cached digest");
            }
            self.state.status = SyncStatus::Diverged;
        }
        changes
    }

    /// Scan `root` and run [`Self::detect_local_drift`] on the result.
    ///
    /// A failed scan leaves the state untouched.
    pub fn scan_local(&mut self, root: &Path, config: &ScanConfig) -> Result<Changeset, SyncError> {
        let scanned = Scanner::with_config(root, config.clone()).scan()?;
        Ok(self.detect_local_drift(&scanned))
    }

    /// Leave `Diverged`. The cache is kept, so the next check decides
    /// between `InSync` and `Stale`. Any other status is left as is.
    pub fn reset(&mut self) {
        if self.state.status != SyncStatus::Diverged {
            debug!(status = %self.state.status, "Reset ignored, not diverged");
            return;
        }
        self.state.status = if self.state.version.is_some() {
            SyncStatus::Stale
        } else {
            SyncStatus::NeverSynced
        };
        info!(status = %self.state.status, "Sync state reset");
    }

    /// Drop the cached digest entirely.
    pub fn forget(&mut self) {
        self.state = ClientSyncState::new();
    }

    fn apply_verified(
        &self,
        changeset: &Changeset,
        expected: ContentHash,
    ) -> Result<DigestStore, DigestError> {
        let store = changeset.apply(&self.state.digest)?;
        let actual = store.aggregate_hash();
        if actual != expected {
            return Err(DigestError::ApplyMismatch { expected, actual });
        }
        Ok(store)
    }

    async fn full_sync(&mut self, reason: FullSyncReason) -> Result<SyncOutcome, SyncError> {
        let response = self
            .transport
            .get_full_digest()
            .await
            .map_err(SyncError::Transport)?;

        let actual = response.digest.aggregate_hash();
        if actual != response.aggregate_hash {
            return Err(SyncError::IntegrityFailure {
                expected: response.aggregate_hash,
                actual,
            });
        }

        let changeset = diff(&self.state.digest, &response.digest);
        info!(
            version = response.version,
            files = response.digest.len(),
            changes = %changeset.summary(),
            ?reason,
            "Replaced cache with full digest"
        );
        self.commit(response.digest, response.version, response.aggregate_hash);

        Ok(SyncOutcome {
            strategy: SyncStrategy::Full(reason),
            changeset,
            version: response.version,
            aggregate_hash: response.aggregate_hash,
        })
    }

    fn commit(&mut self, digest: DigestStore, version: u64, aggregate_hash: ContentHash) {
        self.state = ClientSyncState {
            status: SyncStatus::InSync,
            version: Some(version),
            aggregate_hash: Some(aggregate_hash),
            digest,
            last_sync_timestamp: chrono::Utc::now().timestamp(),
        };
    }
}
