//! HTTP transport for talking to an msync server.
//!
//! Maps the three protocol operations onto the server's endpoints:
//! - `GET /digest/hash`
//! - `GET /digest/changeset?since=V&hash=H`
//! - `GET /digest`

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use msync_core::{
    AggregateHashResponse, ChangesetRequest, ChangesetResponse, FullDigestResponse,
    HealthResponse, SyncTransport,
};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for a remote msync server.
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport targeting `base_url` (e.g. `http://server:8000`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /health
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get_json("/health").await
    }

    fn changeset_path(request: &ChangesetRequest) -> String {
        match request.baseline_hash {
            Some(hash) => format!(
                "/digest/changeset?since={}&hash={}",
                request.baseline_version, hash
            ),
            None => format!("/digest/changeset?since={}", request.baseline_version),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} failed ({}): {}", path, status, body));
        }
        resp.json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn get_aggregate_hash(&self) -> Result<AggregateHashResponse> {
        self.get_json("/digest/hash").await
    }

    async fn get_changeset(&self, request: &ChangesetRequest) -> Result<ChangesetResponse> {
        self.get_json(&Self::changeset_path(request)).await
    }

    async fn get_full_digest(&self) -> Result<FullDigestResponse> {
        self.get_json("/digest").await
    }
}
