//! HTTP endpoint handlers for digest synchronization.
//!
//! Endpoints:
//!   GET  /health             → liveness plus current version and hash
//!   GET  /digest/hash        → aggregate hash of the current snapshot
//!   GET  /digest/changeset   → changes since `since` (optional `hash`)
//!   GET  /digest             → full digest of the current snapshot
//!   POST /admin/rescan       → rescan the served root and publish

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use msync_core::{ChangesetRequest, ContentHash};
use std::collections::HashMap;

use crate::{HttpError, SyncService};

// ─────────────────────────────────────────────────────
// Public dispatch
// ─────────────────────────────────────────────────────

/// Route a request to the appropriate handler.
pub async fn handle_sync_request(
    path: &str,
    method: &str,
    query: &str,
    service: &SyncService,
) -> Response<Full<Bytes>> {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };

    let result = match (method, path) {
        ("GET", "/health") => handle_health(service).await,
        ("GET", "/digest/hash") => handle_hash(service).await,
        ("GET", "/digest/changeset") => handle_changeset(service, query).await,
        ("GET", "/digest") => handle_full(service).await,
        ("POST", "/admin/rescan") => handle_rescan(service).await,
        (_, "/health" | "/digest/hash" | "/digest/changeset" | "/digest") => Err(
            HttpError::MethodNotAllowed(format!("{} {} (expected GET)", method, path)),
        ),
        (_, "/admin/rescan") => Err(HttpError::MethodNotAllowed(format!(
            "{} {} (expected POST)",
            method, path
        ))),
        _ => Err(HttpError::NotFound(format!("Unknown endpoint: {} {}", method, path))),
    };

    match result {
        Ok(resp) => resp,
        Err(e) => {
            if e.status() >= 500 {
                tracing::warn!("{} {} failed: {}", method, path, e);
            } else {
                tracing::debug!("{} {} rejected: {}", method, path, e);
            }
            json_error(e.status(), &e.to_string())
        }
    }
}

// ─────────────────────────────────────────────────────
// GET /health
// ─────────────────────────────────────────────────────

async fn handle_health(service: &SyncService) -> Result<Response<Full<Bytes>>, HttpError> {
    json_ok(&service.registry().health().await)
}

// ─────────────────────────────────────────────────────
// GET /digest/hash
// ─────────────────────────────────────────────────────

async fn handle_hash(service: &SyncService) -> Result<Response<Full<Bytes>>, HttpError> {
    json_ok(&service.registry().aggregate_hash().await)
}

// ─────────────────────────────────────────────────────
// GET /digest/changeset?since=V&hash=H
// ─────────────────────────────────────────────────────

async fn handle_changeset(
    service: &SyncService,
    query: &str,
) -> Result<Response<Full<Bytes>>, HttpError> {
    let request = parse_changeset_query(query)?;
    json_ok(&service.registry().changeset(&request).await)
}

fn parse_changeset_query(query: &str) -> Result<ChangesetRequest, HttpError> {
    let params = parse_query(query);

    let since = params
        .get("since")
        .ok_or_else(|| HttpError::BadRequest("Missing 'since' parameter".into()))?;
    let baseline_version: u64 = since
        .parse()
        .map_err(|_| HttpError::BadRequest(format!("Invalid version: {}", since)))?;

    let baseline_hash = match params.get("hash") {
        Some(hex) => Some(
            ContentHash::from_hex(hex)
                .map_err(|e| HttpError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };

    Ok(ChangesetRequest {
        baseline_version,
        baseline_hash,
    })
}

// ─────────────────────────────────────────────────────
// GET /digest
// ─────────────────────────────────────────────────────

async fn handle_full(service: &SyncService) -> Result<Response<Full<Bytes>>, HttpError> {
    json_ok(&service.registry().full_digest().await)
}

// ─────────────────────────────────────────────────────
// POST /admin/rescan
// ─────────────────────────────────────────────────────

async fn handle_rescan(service: &SyncService) -> Result<Response<Full<Bytes>>, HttpError> {
    let result = service.rescan().await?;
    tracing::info!(
        version = result.version,
        changed = result.changed,
        files = result.file_count,
        "Rescan requested over HTTP"
    );
    json_ok(&result)
}

// ─────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────

/// Parse a query string into a key-value map.
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(urldecode(k), urldecode(v));
        }
    }
    map
}

/// Minimal URL percent-decoding. Invalid UTF-8 is replaced.
fn urldecode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next().and_then(hex_val);
                let lo = bytes.next().and_then(hex_val);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn json_ok<T: serde::Serialize>(data: &T) -> Result<Response<Full<Bytes>>, HttpError> {
    let body = serde_json::to_vec(data)
        .map_err(|e| HttpError::Internal(format!("Failed to encode response: {}", e)))?;
    json_response(200, body)
}

fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    #[derive(serde::Serialize)]
    struct ErrorBody<'a> {
        error: &'a str,
    }
    let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
    json_response(status, body).unwrap_or_else(|_| {
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

fn json_response(status: u16, body: Vec<u8>) -> Result<Response<Full<Bytes>>, HttpError> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| HttpError::Internal(e.to_string()))
}
