//! HTTP client wrapper shared by every transfer.
//!
//! One [`HttpClient`] is built per manager and cloned into each task so all
//! transfers share a connection pool.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, SIZE_PROBE_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// HTTP client for streaming downloads.
///
/// # Example
///
/// ```no_run
/// use assetfetch_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let size = client.probe_size("https://example.com/client.jar").await;
/// println!("size: {size:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    probe_timeout: Duration,
}

impl HttpClient {
    /// Creates a client with the default connect/read timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the TLS backend cannot be initialised.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_download_user_agent())
            .build()
            .map_err(DownloadError::client)?;
        Ok(Self {
            client,
            probe_timeout: Duration::from_secs(SIZE_PROBE_TIMEOUT_SECS),
        })
    }

    /// Overrides the HEAD probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Issues a GET, optionally with a `Range` header value such as `bytes=10-`.
    ///
    /// Non-success statuses become [`DownloadError::HttpStatus`].
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `Network` or `HttpStatus` errors.
    pub async fn get(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request.send().await.map_err(|e| map_send_error(url, e))?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status_code,
                retry_after,
            ));
        }

        Ok(response)
    }

    /// Learns a file's size from a HEAD request.
    ///
    /// Returns `None` on any failure or when the server omits Content-Length;
    /// callers treat that as "size unknown" and fall back to a single stream.
    #[instrument(level = "debug", skip(self))]
    pub async fn probe_size(&self, url: &str) -> Option<u64> {
        let response = match self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = response.status().as_u16(), "size probe rejected");
                return None;
            }
            Err(error) => {
                debug!(error = %error, "size probe failed");
                return None;
            }
        };

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn map_send_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}
