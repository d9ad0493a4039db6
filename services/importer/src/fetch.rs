//! Source download: HTTP with bounded retry, or a local `file://` mirror.

use std::time::Duration;

use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use store::StoreError;
use tokio::fs;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// Total attempts, first one included.
    pub attempts: u32,
    /// Backoff before retry `n` is `backoff * n`.
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub mime_type: String,
}

pub fn build_client(policy: &FetchPolicy) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(policy.timeout)
        .user_agent("PescaStatistiche/1.0 (importer)")
        .build()
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Server-side and throttling statuses are worth another attempt; anything
/// else will not change on retry.
fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn fetch_file(url: &str, path: &str) -> Result<Fetched, StoreError> {
    let bytes = fs::read(path).await.map_err(|e| StoreError::FetchFailure {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let content_hash = content_hash(&bytes);
    info!(url, size_bytes = bytes.len(), %content_hash, "read local source");
    Ok(Fetched {
        bytes,
        content_hash,
        mime_type: "text/csv".to_string(),
    })
}

/// GET `url`, retrying transient failures up to `policy.attempts` times.
/// A `file://` url is read from disk, once.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    policy: &FetchPolicy,
) -> Result<Fetched, StoreError> {
    if let Some(path) = url.strip_prefix("file://") {
        return fetch_file(url, path).await;
    }

    let attempts = policy.attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 {
            let wait = policy.backoff * (attempt - 1);
            warn!(url, attempt, wait_ms = wait.as_millis() as u64, reason = %last_reason, "retrying fetch");
            sleep(wait).await;
        }

        let resp = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                last_reason = e.to_string();
                continue;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            last_reason = format!("HTTP {}", status);
            if is_retryable(status) {
                continue;
            }
            break;
        }

        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/csv")
            .to_string();

        match resp.bytes().await {
            Ok(bytes) => {
                let content_hash = content_hash(&bytes);
                info!(url, size_bytes = bytes.len(), %content_hash, %mime_type, "downloaded");
                return Ok(Fetched {
                    bytes: bytes.to_vec(),
                    content_hash,
                    mime_type,
                });
            }
            Err(e) => last_reason = e.to_string(),
        }
    }

    Err(StoreError::FetchFailure {
        url: url.to_string(),
        reason: last_reason,
    })
}
