//! HTTP/HTTPS ranged-read transport.
//!
//! One `reqwest::Client` is constructed per byte source and shared by every
//! fetch for that source; a semaphore caps the number of in-flight requests.
//! Connect and request timeouts come from [`SourceOptions`] - there are no
//! implicit transport defaults beyond what is configured there.

use super::RangeFetcher;
use crate::{Error, Result, config::SourceOptions};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio::sync::Semaphore;
use url::Url;

/// Ranged-GET fetcher for a single remote resource URL.
pub struct HttpRangeFetcher {
    client: Client,
    url: Url,
    semaphore: Semaphore,
    retry_budget: u32,
}

impl HttpRangeFetcher {
    /// Create a fetcher for `url` with an explicitly configured client.
    pub fn new(url: Url, options: &SourceOptions) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle)
            .pool_idle_timeout(options.pool_idle_timeout)
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            semaphore: Semaphore::new(options.max_concurrent_requests.max(1)),
            retry_budget: options.retry_budget.max(1),
        })
    }

    /// Probe the resource's total size via a HEAD request.
    ///
    /// Returns `None` when the server does not declare a Content-Length.
    pub async fn content_length(&self) -> Result<Option<u64>> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::Internal(format!("HTTP HEAD request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "HTTP HEAD returned {} for {}",
                response.status(),
                self.url
            )));
        }

        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }

    /// One request attempt. Accepts a successful full/partial content status
    /// whose body carries exactly the requested byte count; anything else is
    /// a failure. A short body would otherwise surface as a truncated chunk
    /// window downstream.
    async fn request_range(&self, start: u64, end: u64) -> std::result::Result<Bytes, String> {
        let range_header = format!("bytes={}-{}", start, end - 1);
        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::RANGE, range_header)
            .send()
            .await
            .map_err(|e| format!("HTTP GET request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(format!("unexpected status {}", status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("failed to read HTTP response: {}", e))?;

        let expected = (end - start) as usize;
        if bytes.len() != expected {
            return Err(format!(
                "response body has {} bytes, expected {}",
                bytes.len(),
                expected
            ));
        }

        Ok(bytes)
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::SourceClosed)?;

        for attempt in 1..=self.retry_budget {
            match self.request_range(start, end).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    tracing::debug!(
                        offset = start,
                        attempt,
                        budget = self.retry_budget,
                        error = %err,
                        "range fetch attempt failed"
                    );
                }
            }
        }

        tracing::warn!(
            offset = start,
            attempts = self.retry_budget,
            "range fetch retry budget exhausted"
        );
        Err(Error::FetchFailed { offset: start })
    }
}
