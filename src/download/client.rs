//! HTTP client wrapper for metadata requests and ranged file transfers.
//!
//! This module provides the `HttpClient` struct which issues requests with
//! consistent timeout configuration, User-Agent and credential pass-through,
//! and maps transport failures into [`DownloadError`].

use std::time::Duration;

use reqwest::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, RETRY_AFTER,
};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, METADATA_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// Construction options for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request bound for metadata fetches and size probes.
    pub metadata_timeout: Duration,
    /// Value sent verbatim as the `Authorization` header on every request.
    pub access_token: Option<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            metadata_timeout: Duration::from_secs(METADATA_TIMEOUT_SECS),
            access_token: None,
        }
    }
}

/// HTTP client shared by the manifest resolver and the transfer workers.
///
/// This client is designed to be created once and reused for all requests,
/// taking advantage of connection pooling.
///
/// File transfers carry no whole-request timeout: they are bounded by the
/// per-chunk idle timeout applied by the worker. Metadata fetches and size
/// probes are bounded by [`HttpOptions::metadata_timeout`].
///
/// # Example
///
/// ```no_run
/// use grabia_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let response = client.get("https://archive.org/metadata/example").await?;
/// println!("status: {}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    metadata_timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default options.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_options(&HttpOptions::default())
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`ClientBuildError::InvalidToken`] when the access token is not
    /// a valid header value, or [`ClientBuildError::Build`] when the TLS
    /// backend cannot be initialised.
    pub fn with_options(options: &HttpOptions) -> Result<Self, ClientBuildError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = options.access_token.as_deref() {
            let mut value =
                HeaderValue::from_str(token).map_err(|_| ClientBuildError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .default_headers(headers)
            .build()
            .map_err(ClientBuildError::Build)?;
        Ok(Self {
            client,
            metadata_timeout: options.metadata_timeout,
        })
    }

    /// Sends a GET for a small document such as an item manifest and returns
    /// the response when its status is a success. The whole exchange,
    /// body included, is bounded by the metadata timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Timeout`], [`DownloadError::Network`],
    /// [`DownloadError::AuthRequired`] or [`DownloadError::HttpStatus`].
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, url: &str) -> Result<Response, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(self.metadata_timeout)
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;
        check_status(url, response)
    }

    /// Sends a file GET starting at `offset`.
    ///
    /// A non-zero offset adds `Range: bytes=<offset>-`. The caller inspects
    /// the status: `206` means the server honoured the range, `200` means the
    /// full body follows. A `416` is surfaced as [`DownloadError::HttpStatus`].
    /// Compression is disabled so byte offsets match the stored file.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::get`].
    #[instrument(level = "debug", skip(self))]
    pub async fn get_from(&self, url: &str, offset: u64) -> Result<Response, DownloadError> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT_ENCODING, "identity");
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(|e| map_send_error(url, e))?;
        debug!(status = response.status().as_u16(), offset, "transfer response");
        check_status(url, response)
    }

    /// Asks the server for the size of a file with a HEAD request.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::get`].
    #[instrument(level = "debug", skip(self))]
    pub async fn probe_size(&self, url: &str) -> Result<Option<u64>, DownloadError> {
        let response = self
            .client
            .head(url)
            .header(ACCEPT_ENCODING, "identity")
            .timeout(self.metadata_timeout)
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;
        let response = check_status(url, response)?;
        Ok(content_length(&response))
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Failure to construct an [`HttpClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    /// The access token contains characters not allowed in a header.
    #[error("access token is not a valid HTTP header value")]
    InvalidToken,
    /// reqwest could not build the client.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// Parsed `Content-Length` of a response, when present.
#[must_use]
pub fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn map_send_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, DownloadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(DownloadError::auth_required(url, status.as_u16()));
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string);
    Err(DownloadError::http_status_with_retry_after(
        url,
        status.as_u16(),
        retry_after,
    ))
}
