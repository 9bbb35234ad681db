//! End-to-end tests of the client state machine against an in-process
//! snapshot registry.

use async_trait::async_trait;
use msync_core::{
    AggregateHashResponse, ChangesetRequest, ChangesetResponse, ContentHash, DigestStore,
    FallbackReason, FullDigestResponse, FullSyncReason, LocalTransport, ScanConfig,
    SnapshotRegistry, SyncClient, SyncError, SyncStatus, SyncStrategy, SyncTransport,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn h(seed: &str) -> ContentHash {
    ContentHash::from_data(seed.as_bytes())
}

fn store(entries: &[(&str, &str)]) -> DigestStore {
    DigestStore::from_hashes(entries.iter().map(|(p, s)| (*p, h(s)))).unwrap()
}

fn tree_v1() -> DigestStore {
    store(&[
        ("src/mcp/__init__.py", "init"),
        ("src/mcp/server/__init__.py", "server"),
        ("src/mcp/client/__init__.py", "client"),
        ("tests/conftest.py", "conftest"),
        ("README.md", "readme"),
        ("RELEASE.md", "release"),
        ("pyproject.toml", "pyproject"),
    ])
}

fn tree_v2() -> DigestStore {
    store(&[
        ("src/mcp/__init__.py", "init-modified"),
        ("src/mcp/server/__init__.py", "server"),
        ("src/mcp/client/__init__.py", "client"),
        ("src/mcp/new_feature.py", "new-feature"),
        ("docs/sync_protocol.md", "sync-doc"),
        ("tests/conftest.py", "conftest"),
        ("README.md", "readme-modified"),
        ("pyproject.toml", "pyproject"),
    ])
}

/// Counts calls and optionally corrupts what the server says.
struct InstrumentedTransport {
    inner: LocalTransport,
    hash_calls: AtomicUsize,
    changeset_calls: AtomicUsize,
    full_calls: AtomicUsize,
    drop_first_added: AtomicBool,
    corrupt_full: AtomicBool,
    fail_changeset: AtomicBool,
}

impl InstrumentedTransport {
    fn new(registry: Arc<SnapshotRegistry>) -> Self {
        Self {
            inner: LocalTransport::new(registry),
            hash_calls: AtomicUsize::new(0),
            changeset_calls: AtomicUsize::new(0),
            full_calls: AtomicUsize::new(0),
            drop_first_added: AtomicBool::new(false),
            corrupt_full: AtomicBool::new(false),
            fail_changeset: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SyncTransport for InstrumentedTransport {
    async fn get_aggregate_hash(&self) -> anyhow::Result<AggregateHashResponse> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_aggregate_hash().await
    }

    async fn get_changeset(&self, request: &ChangesetRequest) -> anyhow::Result<ChangesetResponse> {
        self.changeset_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_changeset.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset by peer");
        }
        let mut resp = self.inner.get_changeset(request).await?;
        if self.drop_first_added.load(Ordering::SeqCst) {
            if let ChangesetResponse::Changeset { changeset, .. } = &mut resp {
                if !changeset.added.is_empty() {
                    changeset.added.remove(0);
                }
            }
        }
        Ok(resp)
    }

    async fn get_full_digest(&self) -> anyhow::Result<FullDigestResponse> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        let mut resp = self.inner.get_full_digest().await?;
        if self.corrupt_full.load(Ordering::SeqCst) {
            resp.aggregate_hash = h("not the real aggregate");
        }
        Ok(resp)
    }
}

fn setup(initial: DigestStore, depth: usize) -> (Arc<SnapshotRegistry>, Arc<InstrumentedTransport>) {
    let registry = Arc::new(SnapshotRegistry::new(initial, depth));
    let transport = Arc::new(InstrumentedTransport::new(registry.clone()));
    (registry, transport)
}

#[tokio::test]
async fn test_never_synced_check_is_stale() {
    let (_registry, transport) = setup(DigestStore::empty(), 4);
    let mut client = SyncClient::new(transport.clone());

    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::Stale);
    assert!(!report.in_sync());
    assert_eq!(transport.changeset_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initial_sync_fetches_full_digest() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Full(FullSyncReason::NeverSynced));
    assert_eq!(outcome.changeset.added.len(), tree_v1().len());
    assert_eq!(client.status(), SyncStatus::InSync);
    assert_eq!(client.digest(), &tree_v1());
    assert_eq!(
        client.state().aggregate_hash,
        Some(registry.current().await.aggregate_hash())
    );
    assert_eq!(transport.changeset_calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.full_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_already_in_sync_is_idempotent() {
    let (_registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    let first = client.check_staleness().await.unwrap();
    let second = client.check_staleness().await.unwrap();
    assert_eq!(first.status, SyncStatus::InSync);
    assert_eq!(second.status, SyncStatus::InSync);
    assert_eq!(first.server.aggregate_hash, second.server.aggregate_hash);

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::UpToDate);
    assert!(outcome.changeset.is_empty());
    assert_eq!(transport.changeset_calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.full_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reordered_identical_digest_short_circuits() {
    let (registry, transport) = setup(store(&[("a.py", "1"), ("b.py", "2")]), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    let outcome = registry.publish(store(&[("b.py", "2"), ("a.py", "1")])).await;
    assert!(!outcome.changed);

    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::InSync);
    assert_eq!(transport.changeset_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_update_detected_and_synced_incrementally() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    registry.publish(tree_v2()).await;
    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::Stale);

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Incremental);
    assert_eq!(outcome.version, 2);

    let added: Vec<&str> = outcome.changeset.added.iter().map(|e| e.path.as_str()).collect();
    let modified: Vec<&str> = outcome.changeset.modified.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(added, vec!["docs/sync_protocol.md", "src/mcp/new_feature.py"]);
    assert_eq!(modified, vec!["README.md", "src/mcp/__init__.py"]);
    assert_eq!(outcome.changeset.deleted, vec!["RELEASE.md".to_string()]);

    assert_eq!(client.digest(), &tree_v2());
    assert_eq!(client.status(), SyncStatus::InSync);
    assert_eq!(transport.full_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rotated_baseline_falls_back_to_full() {
    let (registry, transport) = setup(store(&[("a", "0")]), 1);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    for i in 1..=3 {
        registry.publish(store(&[("a", i.to_string().as_str())])).await;
    }

    let outcome = client.sync().await.unwrap();
    assert_eq!(
        outcome.strategy,
        SyncStrategy::Full(FullSyncReason::ServerRequested(FallbackReason::UnknownVersion))
    );
    assert_eq!(outcome.version, 4);
    assert_eq!(outcome.changeset.modified.len(), 1);
    assert_eq!(client.digest(), &store(&[("a", "3")]));
    assert_eq!(transport.full_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_corrupted_changeset_triggers_full_fallback() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    registry.publish(tree_v2()).await;
    transport.drop_first_added.store(true, Ordering::SeqCst);

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Full(FullSyncReason::ApplyFailed));
    assert_eq!(client.digest(), &tree_v2());
    assert_eq!(client.status(), SyncStatus::InSync);
}

#[tokio::test]
async fn test_corrupted_full_digest_leaves_cache_untouched() {
    let (registry, transport) = setup(tree_v1(), 0);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();
    let before = client.state().clone();

    registry.publish(tree_v2()).await;
    transport.corrupt_full.store(true, Ordering::SeqCst);

    let err = client.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::IntegrityFailure { .. }));
    assert_eq!(client.digest(), &before.digest);
    assert_eq!(client.state().version, before.version);
    assert_eq!(client.state().aggregate_hash, before.aggregate_hash);
    assert_eq!(client.status(), SyncStatus::Stale);
}

#[tokio::test]
async fn test_transport_failure_mid_sync_leaves_cache_untouched() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();
    let before = client.state().clone();

    registry.publish(tree_v2()).await;
    transport.fail_changeset.store(true, Ordering::SeqCst);

    let err = client.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(client.digest(), &before.digest);
    assert_eq!(client.state().version, before.version);

    transport.fail_changeset.store(false, Ordering::SeqCst);
    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Incremental);
}

#[tokio::test]
async fn test_restarted_server_with_same_content_keeps_client_in_sync() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();
    registry.publish(tree_v2()).await;
    client.sync().await.unwrap();
    assert_eq!(client.state().version, Some(2));

    // A fresh server numbers the same content as version 1.
    let (_fresh, fresh_transport) = setup(tree_v2(), 4);
    let mut client = SyncClient::with_state(fresh_transport.clone(), client.into_state());
    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::InSync);
    assert_eq!(client.state().version, Some(1));
}

#[tokio::test]
async fn test_restarted_server_with_reused_version_number() {
    let (registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();
    registry.publish(tree_v2()).await;
    client.sync().await.unwrap();

    // New server: version 1 is different content, version 2 is something else again.
    let (fresh, fresh_transport) = setup(store(&[("x", "1")]), 4);
    fresh.publish(store(&[("x", "2")])).await;
    let mut client = SyncClient::with_state(fresh_transport.clone(), client.into_state());

    let outcome = client.sync().await.unwrap();
    assert_eq!(
        outcome.strategy,
        SyncStrategy::Full(FullSyncReason::ServerRequested(FallbackReason::BaselineMismatch))
    );
    assert_eq!(client.digest(), &store(&[("x", "2")]));
}

#[tokio::test]
async fn test_local_drift_diverges_until_reset() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(tmp.path().join("b.txt"), b"beta").unwrap();

    let config = ScanConfig::default();
    let scanned = msync_core::Scanner::new(tmp.path()).scan().unwrap();
    let (registry, transport) = setup(scanned, 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();

    let clean = client.scan_local(tmp.path(), &config).unwrap();
    assert!(clean.is_empty());
    assert_eq!(client.status(), SyncStatus::InSync);

    std::fs::write(tmp.path().join("a.txt"), b"edited locally").unwrap();
    let drift = client.scan_local(tmp.path(), &config).unwrap();
    assert_eq!(drift.modified.len(), 1);
    assert_eq!(drift.modified[0].path, "a.txt");
    assert_eq!(client.status(), SyncStatus::Diverged);

    // Server checks don't clear divergence, and sync refuses.
    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::Diverged);
    assert!(report.in_sync());
    assert!(matches!(client.sync().await, Err(SyncError::Diverged)));

    client.reset();
    assert_eq!(client.status(), SyncStatus::Stale);
    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::InSync);

    registry.publish(DigestStore::empty()).await;
    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.changeset.deleted.len(), 2);
}

#[tokio::test]
async fn test_scan_failure_leaves_state() {
    let tmp = TempDir::new().unwrap();
    let (_registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport);
    client.sync().await.unwrap();

    let err = client
        .scan_local(&tmp.path().join("missing"), &ScanConfig::default())
        .unwrap_err();
    assert!(matches!(err, SyncError::Digest(msync_core::DigestError::Io { .. })));
    assert_eq!(client.status(), SyncStatus::InSync);
}

#[tokio::test]
async fn test_never_synced_drift_does_not_diverge() {
    let (_registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport);
    let drift = client.detect_local_drift(&store(&[("local.txt", "x")]));
    assert_eq!(drift.added.len(), 1);
    assert_eq!(client.status(), SyncStatus::NeverSynced);
}

#[tokio::test]
async fn test_check_then_drift_before_first_sync_still_syncs() {
    let (_registry, transport) = setup(store(&[("a.py", "1")]), 4);
    let mut client = SyncClient::new(transport.clone());

    let report = client.check_staleness().await.unwrap();
    assert_eq!(report.status, SyncStatus::Stale);
    assert_eq!(client.state().version, None);

    let drift = client.detect_local_drift(&store(&[("local.txt", "x")]));
    assert_eq!(drift.added.len(), 1);
    assert_eq!(client.status(), SyncStatus::Stale);

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Full(FullSyncReason::NeverSynced));
    assert_eq!(client.status(), SyncStatus::InSync);
    assert_eq!(client.digest(), &store(&[("a.py", "1")]));
}

#[tokio::test]
async fn test_reset_only_leaves_diverged() {
    let (_registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());

    client.reset();
    assert_eq!(client.status(), SyncStatus::NeverSynced);

    client.sync().await.unwrap();
    client.reset();
    assert_eq!(client.status(), SyncStatus::InSync);

    client.detect_local_drift(&DigestStore::empty());
    assert_eq!(client.status(), SyncStatus::Diverged);
    client.reset();
    assert_eq!(client.status(), SyncStatus::Stale);
}

#[tokio::test]
async fn test_forget_returns_to_never_synced() {
    let (_registry, transport) = setup(tree_v1(), 4);
    let mut client = SyncClient::new(transport.clone());
    client.sync().await.unwrap();
    client.forget();
    assert_eq!(client.status(), SyncStatus::NeverSynced);
    assert!(client.digest().is_empty());

    let outcome = client.sync().await.unwrap();
    assert_eq!(outcome.strategy, SyncStrategy::Full(FullSyncReason::NeverSynced));
}

#[tokio::test]
async fn test_concurrent_readers_during_publish() {
    let registry = Arc::new(SnapshotRegistry::new(tree_v1(), 4));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let full = registry.full_digest().await;
            // Every response is internally consistent, whichever snapshot it saw.
            assert_eq!(full.digest.aggregate_hash(), full.aggregate_hash);
            full.version
        }));
    }
    registry.publish(tree_v2()).await;
    for handle in handles {
        let version = handle.await.unwrap();
        assert!(version == 1 || version == 2);
    }
}
