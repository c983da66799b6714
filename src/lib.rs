pub mod chunks;
pub mod config;
pub mod error;
pub mod fetch;
pub mod source;

mod cache;

pub use chunks::{Chunk, ChunkTable};
pub use config::SourceOptions;
pub use error::{Error, Result};
pub use fetch::RangeFetcher;
pub use source::RemoteByteSource;

#[cfg(feature = "http")]
pub use fetch::HttpRangeFetcher;
#[cfg(feature = "s3")]
pub use fetch::S3RangeFetcher;
