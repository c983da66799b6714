//! S3 ranged-read transport.
//!
//! Fetches chunk ranges with ranged `GetObject` calls against a bucket/key.
//! Supports custom S3 endpoints (MinIO, LocalStack, etc.). Presigned-URL
//! generation is not handled here; presigned URLs are plain HTTP and go
//! through [`HttpRangeFetcher`](super::HttpRangeFetcher) instead.

use super::RangeFetcher;
use crate::{Error, Result, config::SourceOptions};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::sync::Semaphore;

/// Ranged `GetObject` fetcher for a single S3 object.
pub struct S3RangeFetcher {
    client: Client,
    bucket: String,
    key: String,
    semaphore: Semaphore,
    retry_budget: u32,
}

impl S3RangeFetcher {
    /// Create a fetcher for `bucket`/`key`.
    ///
    /// # Arguments
    ///
    /// * `region` - Optional AWS region (uses SDK defaults if not specified)
    /// * `endpoint` - Optional custom endpoint URL (for S3-compatible services)
    pub async fn new(
        bucket: String,
        key: String,
        options: &SourceOptions,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let mut config_loader = aws_config::from_env();

        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region));
        }

        let sdk_config = config_loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
            key,
            semaphore: Semaphore::new(options.max_concurrent_requests.max(1)),
            retry_budget: options.retry_budget.max(1),
        })
    }

    /// Probe the object's total size via HeadObject.
    pub async fn content_length(&self) -> Result<Option<u64>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("S3 HeadObject failed: {}", e)))?;

        Ok(response.content_length().and_then(|n| u64::try_from(n).ok()))
    }

    async fn request_range(&self, start: u64, end: u64) -> std::result::Result<Bytes, String> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(|e| format!("S3 GetObject failed: {}", e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| format!("failed to read S3 response body: {}", e))?;

        let bytes = body.into_bytes();
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
impl RangeFetcher for S3RangeFetcher {
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
                        "S3 range fetch attempt failed"
                    );
                }
            }
        }

        tracing::warn!(
            offset = start,
            attempts = self.retry_budget,
            "S3 range fetch retry budget exhausted"
        );
        Err(Error::FetchFailed { offset: start })
    }
}
