//! HTTP transport abstraction for listing pages and entry transfers.
//!
//! `HttpTransport` is the reqwest-backed implementation; `MockTransport`
//! serves canned responses and records every requested URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised while talking to a remote endpoint.
///
/// URLs carried here never contain secrets: only listing and transfer
/// endpoints go through the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be sent or the connection failed
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// Request exceeded its time budget
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    /// Response body could not be read to completion
    #[error("Reading response body failed: {reason}")]
    Body { reason: String },
}

/// Response whose body is consumed incrementally.
pub struct TransferResponse {
    /// HTTP status code
    pub status: u16,
    /// Value of the Content-Type header, if any
    pub content_type: Option<String>,
    /// Body chunks in arrival order
    pub chunks: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl TransferResponse {
    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Minimal HTTP surface used by the indexer and the downloader.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches a page as text. Non-success statuses are errors.
    ///
    /// # Errors
    ///
    /// - `TransportError::Request` - Connection failure or non-success status
    /// - `TransportError::Timeout` - Request exceeded its time budget
    /// - `TransportError::Body` - Body could not be decoded
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Starts a transfer and returns the status with a streaming body.
    ///
    /// # Errors
    ///
    /// - `TransportError::Request` - Connection failure
    /// - `TransportError::Timeout` - Request exceeded its time budget
    async fn get_body(&self, url: &str) -> Result<TransferResponse, TransportError>;
}

/// reqwest-backed transport with bounded timeouts.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport presenting itself as `user_agent`.
    ///
    /// `timeout` bounds each whole request, so a stalled endpoint cannot
    /// wedge the caller.
    pub fn new(user_agent: &str, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(connect_timeout)
                .user_agent(user_agent)
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
                .expect("HTTP client creation should not fail"),
        }
    }

    fn map_error(url: &str, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
            }
        } else {
            TransportError::Request {
                url: url.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Request {
                url: url.to_string(),
                reason: format!("status {status}"),
            });
        }

        response.text().await.map_err(|e| TransportError::Body {
            reason: e.to_string(),
        })
    }

    async fn get_body(&self, url: &str) -> Result<TransferResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let chunks = response
            .bytes_stream()
            .map_err(|e| TransportError::Body {
                reason: e.to_string(),
            })
            .boxed();

        Ok(TransferResponse {
            status,
            content_type,
            chunks,
        })
    }
}

/// Canned response served by `MockTransport`.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Responds with status and body
    Body { status: u16, body: Bytes },
    /// Responds with 200 and an HTML page instead of file bytes
    Html { body: String },
    /// Responds with 200 and the given chunks, then fails mid-body
    Truncated { chunks: Vec<Bytes> },
    /// Fails before any response arrives
    ConnectionFailure,
}

/// In-memory transport for tests and offline development.
///
/// Unknown URLs answer 404. Every request is recorded, which allows
/// asserting that a code path never touched the network.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    responses: Arc<Mutex<HashMap<String, MockResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    /// Creates a mock with no registered responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a 200 response with `body` for `url`.
    pub fn with_page(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.with_response(
            url,
            MockResponse::Body {
                status: 200,
                body: body.into(),
            },
        )
    }

    /// Registers a body-less response with `status` for `url`.
    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.with_response(
            url,
            MockResponse::Body {
                status,
                body: Bytes::new(),
            },
        )
    }

    /// Registers an arbitrary response for `url`.
    pub fn with_response(self, url: &str, response: MockResponse) -> Self {
        self.responses.lock().insert(url.to_string(), response);
        self
    }

    /// Number of requests issued so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// URLs requested so far, in order.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn lookup(&self, url: &str) -> MockResponse {
        self.requests.lock().push(url.to_string());
        self.responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(MockResponse::Body {
                status: 404,
                body: Bytes::new(),
            })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        match self.lookup(url) {
            MockResponse::Body { status, body } if (200..300).contains(&status) => {
                Ok(String::from_utf8_lossy(&body).into_owned())
            }
            MockResponse::Body { status, .. } => Err(TransportError::Request {
                url: url.to_string(),
                reason: format!("status {status}"),
            }),
            MockResponse::Html { body } => Ok(body),
            MockResponse::Truncated { .. } => Err(TransportError::Body {
                reason: "connection reset".to_string(),
            }),
            MockResponse::ConnectionFailure => Err(TransportError::Request {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn get_body(&self, url: &str) -> Result<TransferResponse, TransportError> {
        match self.lookup(url) {
            MockResponse::Body { status, body } => Ok(TransferResponse {
                status,
                content_type: Some("application/octet-stream".to_string()),
                chunks: stream::iter(vec![Ok(body)]).boxed(),
            }),
            MockResponse::Html { body } => Ok(TransferResponse {
                status: 200,
                content_type: Some("text/html; charset=utf-8".to_string()),
                chunks: stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
            }),
            MockResponse::Truncated { chunks } => {
                let items = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(TransportError::Body {
                        reason: "connection reset".to_string(),
                    })));
                Ok(TransferResponse {
                    status: 200,
                    content_type: Some("application/octet-stream".to_string()),
                    chunks: stream::iter(items.collect::<Vec<_>>()).boxed(),
                })
            }
            MockResponse::ConnectionFailure => Err(TransportError::Request {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_requests_and_defaults_to_not_found() {
        let transport = MockTransport::new().with_page("https://example.com/a", "hello");

        assert_eq!(transport.get_text("https://example.com/a").await.unwrap(), "hello");
        assert!(transport.get_text("https://example.com/missing").await.is_err());

        let response = transport.get_body("https://example.com/missing").await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());

        assert_eq!(
            transport.requested_urls(),
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/missing".to_string(),
                "https://example.com/missing".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_body_ends_with_error() {
        let transport = MockTransport::new().with_response(
            "https://example.com/file",
            MockResponse::Truncated {
                chunks: vec![Bytes::from_static(b"abc")],
            },
        );

        let response = transport.get_body("https://example.com/file").await.unwrap();
        let items: Vec<_> = response.chunks.collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
