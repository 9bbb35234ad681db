//! msync HTTP Protocol Implementation
//!
//! Serves the digest sync protocol over plain HTTP/1 with JSON bodies.

pub mod handlers;

pub use handlers::handle_sync_request;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Response};
use msync_core::{RescanResponse, ScanConfig, Scanner, SnapshotRegistry};
use std::path::PathBuf;
use std::sync::Arc;

/// Request handler bound to one snapshot registry.
///
/// When a scan root is configured the handler can also rescan it and
/// publish the result as a new snapshot.
#[derive(Clone)]
pub struct SyncService {
    registry: Arc<SnapshotRegistry>,
    scan_root: Option<PathBuf>,
    scan_config: ScanConfig,
}

impl SyncService {
    /// Serve `registry` without rescan support
    pub fn new(registry: Arc<SnapshotRegistry>) -> Self {
        Self {
            registry,
            scan_root: None,
            scan_config: ScanConfig::default(),
        }
    }

    /// Enable `POST /admin/rescan` against `root`
    pub fn with_scan_root(mut self, root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        self.scan_root = Some(root.into());
        self.scan_config = config;
        self
    }

    pub fn registry(&self) -> &Arc<SnapshotRegistry> {
        &self.registry
    }

    /// Rescan the configured root on the blocking pool and publish it.
    pub async fn rescan(&self) -> Result<RescanResponse, HttpError> {
        let root = self
            .scan_root
            .clone()
            .ok_or_else(|| HttpError::NotFound("Server has no scan root configured".into()))?;
        let config = self.scan_config.clone();

        let store = tokio::task::spawn_blocking(move || Scanner::with_config(root, config).scan())
            .await
            .map_err(|e| HttpError::Internal(format!("Scan task failed: {}", e)))?
            .map_err(|e| HttpError::Internal(format!("Scan failed: {}", e)))?;

        let file_count = store.len();
        let outcome = self.registry.publish(store).await;
        Ok(RescanResponse {
            version: outcome.version,
            aggregate_hash: outcome.aggregate_hash,
            file_count,
            changed: outcome.changed,
        })
    }

    /// Handle an incoming HTTP request. The body is never read.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        drop(req);

        tracing::debug!("Sync request: {} {}", method, path);
        handle_sync_request(&path, &method, &query, self).await
    }
}

/// HTTP errors
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) => 400,
            HttpError::NotFound(_) => 404,
            HttpError::MethodNotAllowed(_) => 405,
            HttpError::Internal(_) => 500,
        }
    }
}
