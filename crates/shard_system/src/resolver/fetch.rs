//! Remote artifact transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use shard_api::{Coordinate, RemoteRepository};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

use super::checksum::ChecksumAlgorithm;

/// Transport-level failures. All of them are worth retrying.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Fetches raw bytes from a repository URL.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Returns `Ok(None)` when the resource does not exist.
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError>;
}

/// HTTP(S) fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("frost-shard-resolver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let request_error = |e: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(request_error)?;
        Ok(Some(body.to_vec()))
    }
}

/// An in-memory repository.
///
/// Serves artifacts published into it and counts every request, which makes
/// it suitable for offline mirrors and for tests that assert on fetch counts.
#[derive(Default)]
pub struct MemoryFetcher {
    resources: Mutex<HashMap<String, Vec<u8>>>,
    requests: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.resources.lock().insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.resources.lock().remove(url);
    }

    /// Publishes an artifact together with its SHA-256 sidecar.
    pub fn publish(&self, repository: &RemoteRepository, coordinate: &Coordinate, body: &[u8]) -> String {
        let url = repository.artifact_url(&coordinate.repository_path());
        let checksum = ChecksumAlgorithm::Sha256.digest_hex(body);
        self.insert(url.clone(), body.to_vec());
        self.insert(format!("{}.sha256", url), checksum.into_bytes());
        url
    }

    /// Makes the next `count` requests fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FetchError::Request {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        Ok(self.resources.lock().get(url).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetcher_serves_and_counts() {
        let fetcher = MemoryFetcher::new();
        let repository = RemoteRepository::new("https://repo.test/maven");
        let coordinate = Coordinate::new("org.test", "lib", "1.0");
        let url = fetcher.publish(&repository, &coordinate, b"bytes");

        assert_eq!(url, "https://repo.test/maven/org/test/lib/1.0/lib-1.0.jar");
        assert_eq!(fetcher.fetch(&url).await.unwrap(), Some(b"bytes".to_vec()));
        assert!(fetcher.fetch(&format!("{}.sha256", url)).await.unwrap().is_some());
        assert_eq!(fetcher.fetch("https://repo.test/other").await.unwrap(), None);
        assert_eq!(fetcher.request_count(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("u", b"x".to_vec());
        fetcher.fail_next(2);

        assert!(fetcher.fetch("u").await.is_err());
        assert!(fetcher.fetch("u").await.is_err());
        assert!(fetcher.fetch("u").await.unwrap().is_some());
    }
}
