//! Seekable byte-source façade over the chunk table and prefetch cache.
//!
//! Presents `position`/`seek`/`read`/`skip`/`eof`/`close` to a downstream
//! sequential reader (e.g., a BAM/BGZF parser) that is unaware the data is
//! remote. Cursor moves inside the active chunk window are free; moves
//! outside it resolve the owning chunk through the cache. Reads must fall
//! entirely within one chunk window - the external planner pads chunks so
//! that record boundaries never straddle a window.

use crate::cache::PrefetchCache;
use crate::chunks::{Chunk, ChunkTable};
use crate::config::SourceOptions;
use crate::fetch::RangeFetcher;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;

#[cfg(feature = "http")]
use crate::fetch::HttpRangeFetcher;
#[cfg(feature = "http")]
use url::Url;

/// Chunk-indexed, cache-backed seekable view of a remote resource.
pub struct RemoteByteSource {
    table: Arc<ChunkTable>,
    cache: PrefetchCache,
    position: u64,
    length: Option<u64>,
    window: Option<Window>,
    closed: bool,
}

/// The currently adopted chunk's bytes, covering `[start, end)`.
struct Window {
    start: u64,
    end: u64,
    bytes: Bytes,
}

impl RemoteByteSource {
    /// Build a source from an externally planned chunk list and an injected
    /// transport. `length` is the resource's declared total size, if known.
    pub fn new(
        fetcher: Arc<dyn RangeFetcher>,
        chunks: Vec<Chunk>,
        length: Option<u64>,
        options: SourceOptions,
    ) -> Result<Self> {
        let table = Arc::new(ChunkTable::new(chunks)?);
        let cache = PrefetchCache::new(Arc::clone(&table), fetcher, &options);
        Ok(Self {
            table,
            cache,
            position: 0,
            length,
            window: None,
            closed: false,
        })
    }

    /// Convenience constructor for HTTP/HTTPS resources: builds the ranged
    /// fetcher and probes the total size with a HEAD request.
    #[cfg(feature = "http")]
    pub async fn open(url: Url, chunks: Vec<Chunk>, options: SourceOptions) -> Result<Self> {
        let fetcher = HttpRangeFetcher::new(url, &options)?;
        let length = fetcher.content_length().await?;
        Self::new(Arc::new(fetcher), chunks, length, options)
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total resource size, or `None` if unknown.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Move the cursor to `pos`. A move within the active chunk window only
    /// touches the cursor; anything else resolves the owning chunk through
    /// the cache and adopts its bytes as the active window.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        self.ensure_open()?;
        if !self.window_covers(pos) {
            self.activate(pos).await?;
        }
        self.position = pos;
        Ok(())
    }

    /// Fill `buf` from the current position and advance the cursor.
    ///
    /// The requested span must lie entirely within the active chunk window;
    /// a read that crosses a window boundary fails with
    /// [`Error::ReadOutOfWindow`] - there is no truncation or cross-chunk
    /// stitching. A read with no active window (at start, or after a skip)
    /// resolves the owning chunk lazily first.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(());
        }

        if !self.window_covers(self.position) {
            self.activate(self.position).await?;
        }
        let window = match &self.window {
            Some(window) => window,
            None => return Err(Error::Internal("no active chunk window".to_string())),
        };

        let end = self.position + buf.len() as u64;
        if self.position < window.start || end > window.end {
            return Err(Error::ReadOutOfWindow {
                position: self.position,
                len: buf.len(),
                start: window.start,
                end: window.end,
            });
        }

        let lo = (self.position - window.start) as usize;
        buf.copy_from_slice(&window.bytes[lo..lo + buf.len()]);
        self.position = end;

        if self.position >= window.end {
            let consumed = window.start;
            self.window = None;
            self.cache.consume(consumed);
        }
        Ok(())
    }

    /// Advance the cursor by up to `n` bytes without touching data; the next
    /// read resolves the owning chunk lazily. Returns the advance applied,
    /// clamped to the end of the resource when the length is known. Fails
    /// with [`Error::SourceClosed`] after [`close`](Self::close), like the
    /// other cursor operations.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        let advance = match self.length {
            Some(length) => n.min(length.saturating_sub(self.position)),
            None => n,
        };
        self.position += advance;
        Ok(advance)
    }

    /// True iff the length is known and the cursor has reached it.
    pub fn eof(&self) -> bool {
        matches!(self.length, Some(length) if self.position >= length)
    }

    /// Stop scheduling new fetches. In-flight fetches are allowed to drain;
    /// subsequent seeks and reads fail with [`Error::SourceClosed`].
    /// Idempotent and safe after any error path.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.window = None;
            self.cache.close();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SourceClosed);
        }
        Ok(())
    }

    fn window_covers(&self, pos: u64) -> bool {
        matches!(&self.window, Some(w) if pos >= w.start && pos < w.end)
    }

    /// Resolve the chunk owning `pos` and adopt its bytes as the window.
    async fn activate(&mut self, pos: u64) -> Result<()> {
        let chunk = self.table.floor(pos)?;
        // A window abandoned mid-chunk is consumed now; otherwise its entry
        // stays unevictable and pins cache capacity.
        if let Some(old) = self.window.take() {
            if old.start != chunk.start {
                self.cache.consume(old.start);
            }
        }
        let bytes = self.cache.get_or_fetch(chunk.start).await?;
        // The window covers the bytes actually returned, which normally
        // equals the chunk extent.
        self.window = Some(Window {
            start: chunk.start,
            end: chunk.start + bytes.len() as u64,
            bytes,
        });
        Ok(())
    }
}

impl Drop for RemoteByteSource {
    fn drop(&mut self) {
        self.close();
    }
}
