//! Ranged-read transport abstraction.
//!
//! A [`RangeFetcher`] issues one ranged GET per chunk. Implementations share
//! a single bounded-concurrency client per byte source and apply a fixed
//! retry budget per chunk; exhausting the budget is fatal for that chunk.
//!
//! # Implementations
//!
//! - [`HttpRangeFetcher`] - HTTP/HTTPS via `Range: bytes=start-(end-1)`
//! - [`S3RangeFetcher`] - ranged S3 `GetObject` (feature `s3`)

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "http")]
pub use http::HttpRangeFetcher;
#[cfg(feature = "s3")]
pub use s3::S3RangeFetcher;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Transport seam for fetching one chunk's bytes.
///
/// `fetch` covers the half-open range `[start, end)` and returns the full
/// body or an error; partial bytes are never surfaced.
#[async_trait]
pub trait RangeFetcher: Send + Sync + 'static {
    async fn fetch(&self, start: u64, end: u64) -> Result<Bytes>;
}
