//! Byte transports for metadata and targets.
//!
//! A [`Fetcher`] moves bytes and enforces a length ceiling; it knows nothing
//! about trust. [`HttpFetcher`] talks to HTTP(S) mirrors, [`FileFetcher`]
//! reads local repositories.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// User agent sent with every HTTP request.
const USER_AGENT_VALUE: &str = concat!("tuf-updater/", env!("CARGO_PKG_VERSION"));

/// Transport failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The resource does not exist on the remote.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The resource is larger than the caller allowed.
    #[error("response exceeds {max_length} bytes (received at least {received})")]
    LengthExceeded { max_length: u64, received: u64 },
    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Credentials were rejected (401/403).
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// The remote reported a temporary outage (503/504 or other 5xx).
    #[error("transient remote error: status {0}")]
    Retryable(u16),
    /// Unexpected status, including redirects and other 4xx.
    #[error("unexpected status {0}")]
    Status(u16),
    /// Plaintext URL used without opting in.
    #[error("insecure url requires explicit opt-in: {0}")]
    InsecureUrl(String),
    /// Transport-level issue (DNS, TLS, socket, etc.).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Local read failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether trying again later, or on another mirror, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Retryable(_) | FetchError::Transport(_)
        )
    }
}

/// Retrieves raw bytes by URL, refusing anything longer than `max_length`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, resource: &str, max_length: u64) -> Result<Vec<u8>, FetchError>;
}

/// Options governing how the HTTP fetcher is constructed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcherOptions {
    /// Whether plaintext (HTTP) URLs are allowed.
    pub allow_plaintext: bool,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
}

/// [`Fetcher`] backed by a reusable `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    options: HttpFetcherOptions,
}

impl HttpFetcher {
    pub fn new(options: HttpFetcherOptions) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self { client, options })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, resource: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        if !self.options.allow_plaintext && resource.starts_with("http://") {
            return Err(FetchError::InsecureUrl(resource.to_string()));
        }
        tracing::debug!(url = %resource, max_length, "tuf: HTTP request");

        let mut response = self.client.get(resource).send().await?;
        let status = response.status();
        let content_length = response.content_length();
        tracing::debug!(
            url = %resource,
            status = %status,
            content_length = ?content_length,
            "tuf: HTTP response"
        );
        classify_status(status, resource)?;

        if let Some(declared) = content_length {
            if declared > max_length {
                return Err(FetchError::LengthExceeded {
                    max_length,
                    received: declared,
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let received = (body.len() + chunk.len()) as u64;
            if received > max_length {
                return Err(FetchError::LengthExceeded {
                    max_length,
                    received,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Maps HTTP status codes to the transport error taxonomy.
fn classify_status(status: StatusCode, resource: &str) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(resource.to_string()));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Unauthorized(status.as_u16()));
    }
    if status.is_server_error() {
        return Err(FetchError::Retryable(status.as_u16()));
    }
    Err(FetchError::Status(status.as_u16()))
}

/// [`Fetcher`] reading `file://` URLs or plain paths from the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, resource: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        let path = PathBuf::from(resource.strip_prefix("file://").unwrap_or(resource));
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FetchError::NotFound(resource.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut body = Vec::new();
        file.take(max_length.saturating_add(1))
            .read_to_end(&mut body)
            .await?;
        let received = body.len() as u64;
        if received > max_length {
            return Err(FetchError::LengthExceeded {
                max_length,
                received,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request};
    use httptest::{responders::status_code, Expectation, Server};
    use std::io::Write;

    fn plaintext_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpFetcherOptions {
            allow_plaintext: true,
            accept_invalid_certs: false,
        })
        .expect("client")
    }

    #[test]
    fn classify_status_maps_expected_errors() {
        assert!(classify_status(StatusCode::OK, "r").is_ok());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "r"),
            Err(FetchError::NotFound(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "r"),
            Err(FetchError::Unauthorized(403))
        ));
        assert!(matches!(
            classify_status(StatusCode::FOUND, "r"),
            Err(FetchError::Status(302))
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, "r"),
            Err(FetchError::Retryable(504))
        ));
        assert!(FetchError::Retryable(500).is_retryable());
        assert!(!FetchError::NotFound("r".into()).is_retryable());
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_and_sends_user_agent() -> Result<(), FetchError> {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/metadata/timestamp.json"),
                request::headers(contains(("user-agent", USER_AGENT_VALUE)))
            ])
            .respond_with(status_code(200).body(r#"{"signed":{}}"#)),
        );

        let url = server.url_str("/metadata/timestamp.json");
        let body = plaintext_fetcher().fetch(&url, 1024).await?;
        assert_eq!(body, br#"{"signed":{}}"#.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn http_fetcher_enforces_length_ceiling() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/targets/big.bin"))
                .respond_with(status_code(200).body(vec![7u8; 64])),
        );

        let url = server.url_str("/targets/big.bin");
        let err = plaintext_fetcher()
            .fetch(&url, 16)
            .await
            .expect_err("over the ceiling");
        assert!(matches!(err, FetchError::LengthExceeded { max_length: 16, .. }));
    }

    #[tokio::test]
    async fn http_fetcher_reports_missing_resources() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metadata/2.root.json"))
                .respond_with(status_code(404)),
        );

        let url = server.url_str("/metadata/2.root.json");
        let err = plaintext_fetcher()
            .fetch(&url, 1024)
            .await
            .expect_err("missing");
        assert!(matches!(err, FetchError::NotFound(ref resource) if resource == &url));
    }

    #[tokio::test]
    async fn http_fetcher_rejects_plaintext_without_opt_in() {
        let fetcher = HttpFetcher::new(HttpFetcherOptions::default()).expect("client");
        let err = fetcher
            .fetch("http://updates.example.com/metadata/timestamp.json", 1024)
            .await
            .expect_err("insecure transport should fail");
        assert!(matches!(err, FetchError::InsecureUrl(_)));
    }

    #[tokio::test]
    async fn file_fetcher_reads_capped_files() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"0123456789").expect("write");
        let url = format!("file://{}", file.path().display());

        assert_eq!(
            FileFetcher.fetch(&url, 10).await.expect("fetch"),
            b"0123456789".to_vec()
        );
        assert!(matches!(
            FileFetcher.fetch(&url, 9).await,
            Err(FetchError::LengthExceeded { max_length: 9, received: 10 })
        ));
        assert!(matches!(
            FileFetcher.fetch("file:///nonexistent/timestamp.json", 10).await,
            Err(FetchError::NotFound(_))
        ));
    }
}
