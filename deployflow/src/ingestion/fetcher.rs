//! Artifact download from the distributor's time-limited URLs.

use async_trait::async_trait;
use thiserror::Error;

/// Why a download failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Worth retrying (timeouts, 5xx, connection resets).
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// Retrying will not help (4xx, expired signature, bad URL).
    #[error("fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Returns true if the error is transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Downloads artifact bytes from a URL.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetches the full body behind `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches artifacts over HTTP(S).
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpArtifactFetcher {
    /// Creates a fetcher with the given request timeout.
    pub fn new(timeout: std::time::Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Permanent(format!("client setup failed: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Permanent(e.to_string())
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {status}")));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Transient(e.to_string()))
    }
}
