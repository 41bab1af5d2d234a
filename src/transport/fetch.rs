//! Request/response transport consumed by the HTTP engine.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Payload;
use crate::task::AbortSignal;

// ============================================================================
// Types
// ============================================================================

/// A POST request descriptor.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Encoded body.
    pub body: Payload,
    /// Cancels the request when aborted.
    pub signal: AbortSignal,
}

impl FetchRequest {
    /// Returns the first value of header `name` (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Full response body.
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Returns `true` for 2xx status codes.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Sends one encoded RPC request and returns the raw response.
#[async_trait]
pub trait Fetcher: Send + Sync + fmt::Debug {
    /// POSTs `request` to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the signal's reason if aborted, or a transport error.
    async fn fetch(&self, endpoint: &Url, request: FetchRequest) -> Result<FetchResponse>;
}

// ============================================================================
// ReqwestFetcher
// ============================================================================

/// Default [`Fetcher`] built on `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Connect timeout of the default client.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Creates a fetcher with a default client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`](crate::Error::Http) if the TLS backend cannot
    /// be initialized.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[inline]
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, endpoint: &Url, request: FetchRequest) -> Result<FetchResponse> {
        request.signal.check()?;

        let mut builder = self.client.post(endpoint.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let builder = builder.body(request.body.into_bytes());

        let send = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?.to_vec();
            trace!(%endpoint, status, bytes = body.len(), "HTTP response received");
            Ok::<_, Error>(FetchResponse { status, body })
        };

        tokio::select! {
            result = send => result,
            reason = request.signal.aborted() => Err(reason),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = FetchRequest {
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Payload::from("{}"),
            signal: AbortSignal::new(),
        };
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("accept"), None);
    }

    #[test]
    fn test_success_range() {
        assert!(FetchResponse { status: 204, body: vec![] }.is_success());
        assert!(!FetchResponse { status: 404, body: vec![] }.is_success());
    }

    #[tokio::test]
    async fn test_aborted_signal_short_circuits() {
        let fetcher = ReqwestFetcher::new().expect("client");
        let url = Url::parse("http://127.0.0.1:9/rpc").expect("url");
        let request = FetchRequest {
            headers: vec![],
            body: Payload::from("{}"),
            signal: AbortSignal::aborted_with(Error::aborted("cancelled")),
        };

        let err = fetcher.fetch(&url, request).await.unwrap_err();
        assert!(matches!(err, Error::Aborted { .. }));
    }
}
