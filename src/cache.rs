//! Bounded prefetching chunk cache.
//!
//! The cache maps chunk start offsets to entries in one of three states:
//! `Pending` (a fetch is in flight), `Ready` (bytes resident), or `Failed`
//! (retry budget exhausted - terminal). Entries are created
//! insert-if-absent under a single mutex, which guarantees at most one
//! underlying fetch per offset no matter how many callers ask concurrently;
//! everyone else awaits a watch channel that the fetching task resolves
//! exactly once.
//!
//! Eviction is watermark/refill based rather than LRU: the façade consumes
//! chunks roughly in ascending order, so consumed entries are dropped lazily
//! (lowest offset first) when capacity is needed, and a refill of upcoming
//! offsets is scheduled whenever the unconsumed count drops below the low
//! watermark.

use crate::chunks::{Chunk, ChunkTable};
use crate::config::SourceOptions;
use crate::fetch::RangeFetcher;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

pub(crate) struct PrefetchCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    table: Arc<ChunkTable>,
    fetcher: Arc<dyn RangeFetcher>,
    map: Mutex<CacheMap>,
    closed: AtomicBool,
    max_resident: usize,
    low_watermark: usize,
    refill_window: usize,
}

#[derive(Default)]
struct CacheMap {
    entries: HashMap<u64, Entry>,
}

struct Entry {
    state: EntryState,
    consumed: bool,
    done: watch::Sender<bool>,
}

enum EntryState {
    Pending,
    Ready(Bytes),
    Failed,
}

/// What a lookup decided while the map lock was held: either this task owns
/// the fetch for the offset, or it waits on the owner's resolution.
enum Step {
    Fetch(Chunk),
    Wait(watch::Receiver<bool>),
}

impl CacheMap {
    /// Entries holding or awaiting bytes. Failed entries carry no payload
    /// and never count against capacity.
    fn resident_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !matches!(e.state, EntryState::Failed))
            .count()
    }

    /// Unconsumed entries still ahead of the reader.
    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.consumed && !matches!(e.state, EntryState::Failed))
            .count()
    }
}

impl PrefetchCache {
    pub(crate) fn new(
        table: Arc<ChunkTable>,
        fetcher: Arc<dyn RangeFetcher>,
        options: &SourceOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                table,
                fetcher,
                map: Mutex::new(CacheMap::default()),
                closed: AtomicBool::new(false),
                max_resident: options.max_resident_chunks.max(1),
                low_watermark: options.low_watermark(),
                refill_window: options.refill_window(),
            }),
        }
    }

    /// Return the bytes of the chunk starting at `offset`, fetching them if
    /// necessary. This is the reader's sole suspension point.
    pub(crate) async fn get_or_fetch(&self, offset: u64) -> Result<Bytes> {
        Arc::clone(&self.inner).get_or_fetch(offset).await
    }

    /// Mark the chunk at `offset` evictable and, if the cache has drained to
    /// the low watermark, schedule a background refill of upcoming chunks.
    pub(crate) fn consume(&self, offset: u64) {
        let planned = {
            let mut map = self.inner.lock_map();
            if let Some(entry) = map.entries.get_mut(&offset) {
                entry.consumed = true;
            }

            if map.live_count() >= self.inner.low_watermark {
                return;
            }
            self.inner.plan_refill(&map, offset)
        };

        if planned.is_empty() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        tracing::debug!(
            after = offset,
            count = planned.len(),
            "scheduling background chunk refill"
        );
        for next in planned {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(err) = inner.get_or_fetch(next).await {
                    tracing::debug!(offset = next, error = %err, "background prefetch failed");
                }
            });
        }
    }

    /// Stop scheduling new fetches. In-flight fetches are not aborted; they
    /// drain and resolve their waiters. Idempotent.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, offset: u64) -> bool {
        self.inner.lock_map().entries.contains_key(&offset)
    }

    #[cfg(test)]
    pub(crate) fn resident_offsets(&self) -> Vec<u64> {
        let map = self.inner.lock_map();
        let mut offsets: Vec<u64> = map
            .entries
            .iter()
            .filter(|(_, e)| !matches!(e.state, EntryState::Failed))
            .map(|(o, _)| *o)
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

impl CacheInner {
    fn lock_map(&self) -> MutexGuard<'_, CacheMap> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn get_or_fetch(self: Arc<Self>, offset: u64) -> Result<Bytes> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::SourceClosed);
            }

            // The lock scope must close before any await so the future stays
            // Send; the guard never crosses the suspension points below.
            let step = {
                let mut map = self.lock_map();
                match map.entries.get(&offset) {
                    Some(entry) => match &entry.state {
                        EntryState::Ready(bytes) => return Ok(bytes.clone()),
                        EntryState::Failed => return Err(Error::FetchFailed { offset }),
                        EntryState::Pending => Step::Wait(entry.done.subscribe()),
                    },
                    None => {
                        let chunk = match self.table.get(offset) {
                            Some(chunk) => chunk,
                            None => {
                                return Err(Error::Internal(format!(
                                    "offset {} is not a chunk start",
                                    offset
                                )));
                            }
                        };
                        self.make_room(&mut map);
                        let (done, _) = watch::channel(false);
                        map.entries.insert(
                            offset,
                            Entry {
                                state: EntryState::Pending,
                                consumed: false,
                                done,
                            },
                        );
                        Step::Fetch(chunk)
                    }
                }
            };

            match step {
                Step::Fetch(chunk) => return self.run_fetch(chunk.start, chunk.end).await,
                // Another task owns the fetch for this offset; wait for it
                // to resolve (or for the entry to disappear), then re-read.
                Step::Wait(mut waiter) => {
                    let _ = waiter.wait_for(|resolved| *resolved).await;
                }
            }
        }
    }

    /// Perform the fetch this task owns and resolve the entry exactly once.
    async fn run_fetch(self: Arc<Self>, start: u64, end: u64) -> Result<Bytes> {
        let mut guard = PendingGuard {
            inner: Arc::clone(&self),
            offset: start,
            armed: true,
        };

        let result = self.fetcher.fetch(start, end).await;
        guard.armed = false;

        let mut map = self.lock_map();
        if let Some(entry) = map.entries.get_mut(&start) {
            entry.state = match &result {
                Ok(bytes) => EntryState::Ready(bytes.clone()),
                Err(_) => EntryState::Failed,
            };
            let _ = entry.done.send(true);
        }
        result
    }

    /// Evict consumed entries (lowest offset first) until a new entry fits.
    fn make_room(&self, map: &mut CacheMap) {
        while map.resident_count() >= self.max_resident {
            let victim = map
                .entries
                .iter()
                .filter(|(_, e)| e.consumed && matches!(e.state, EntryState::Ready(_)))
                .map(|(offset, _)| *offset)
                .min();
            match victim {
                Some(offset) => {
                    tracing::debug!(offset, "evicting consumed chunk");
                    map.entries.remove(&offset);
                }
                None => break,
            }
        }
    }

    /// Choose not-yet-resident offsets following the most recently consumed
    /// one, capped by the refill window and remaining capacity.
    fn plan_refill(&self, map: &CacheMap, after: u64) -> Vec<u64> {
        let evictable = map
            .entries
            .values()
            .filter(|e| e.consumed && matches!(e.state, EntryState::Ready(_)))
            .count();
        let room = self
            .max_resident
            .saturating_sub(map.resident_count() - evictable);

        self.table
            .next_offsets(after, self.refill_window)
            .into_iter()
            .filter(|offset| !map.entries.contains_key(offset))
            .take(room)
            .collect()
    }
}

/// Removes a still-pending entry if the owning fetch is cancelled mid-await,
/// so waiters are released and a later access can retry.
struct PendingGuard {
    inner: Arc<CacheInner>,
    offset: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut map = self.inner.lock_map();
        if let Some(entry) = map.entries.get(&self.offset) {
            if matches!(entry.state, EntryState::Pending) {
                map.entries.remove(&self.offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::Chunk;
    use async_trait::async_trait;
    use std::time::Duration;

    /// In-memory fetcher over a synthetic resource, with per-offset failure
    /// injection and attempt counting.
    struct ScriptedFetcher {
        data: Vec<u8>,
        delay: Option<Duration>,
        fail_first: Mutex<HashMap<u64, u32>>,
        attempts: Mutex<HashMap<u64, u32>>,
    }

    impl ScriptedFetcher {
        fn new(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| (i % 251) as u8).collect(),
                delay: None,
                fail_first: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn fail_first(self, offset: u64, times: u32) -> Self {
            self.fail_first.lock().unwrap().insert(offset, times);
            self
        }

        fn attempts_for(&self, offset: u64) -> u32 {
            self.attempts.lock().unwrap().get(&offset).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RangeFetcher for ScriptedFetcher {
        async fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
            *self.attempts.lock().unwrap().entry(start).or_insert(0) += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut fail = self.fail_first.lock().unwrap();
                if let Some(remaining) = fail.get_mut(&start) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(Error::FetchFailed { offset: start });
                    }
                }
            }
            Ok(Bytes::copy_from_slice(
                &self.data[start as usize..end as usize],
            ))
        }
    }

    fn ten_chunk_table() -> Arc<ChunkTable> {
        let chunks = (0..10).map(|i| Chunk::new(i * 10, (i + 1) * 10)).collect();
        Arc::new(ChunkTable::new(chunks).unwrap())
    }

    fn cache_with(
        table: Arc<ChunkTable>,
        fetcher: Arc<ScriptedFetcher>,
        max_resident: usize,
    ) -> PrefetchCache {
        let options = SourceOptions {
            max_resident_chunks: max_resident,
            ..SourceOptions::default()
        };
        PrefetchCache::new(table, fetcher, &options)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_get_or_fetch_returns_chunk_bytes() {
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4);

        let bytes = cache.get_or_fetch(20).await.unwrap();
        assert_eq!(&bytes[..], &fetcher.data[20..30]);
        assert_eq!(fetcher.attempts_for(20), 1);

        // Second access is served from the cache.
        let again = cache.get_or_fetch(20).await.unwrap();
        assert_eq!(bytes, again);
        assert_eq!(fetcher.attempts_for(20), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_deduplicate_to_one_fetch() {
        let fetcher =
            Arc::new(ScriptedFetcher::new(100).with_delay(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get_or_fetch(0).await }));
        }
        for handle in handles {
            let bytes = handle.await.unwrap().unwrap();
            assert_eq!(&bytes[..], &fetcher.data[0..10]);
        }
        assert_eq!(fetcher.attempts_for(0), 1);
    }

    #[tokio::test]
    async fn test_failed_entry_is_terminal() {
        // ScriptedFetcher has no internal retry, so a single failure
        // exhausts the (mock) budget and the entry lands in Failed.
        let fetcher = Arc::new(ScriptedFetcher::new(100).fail_first(30, u32::MAX));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4);

        let err = cache.get_or_fetch(30).await.unwrap_err();
        assert!(matches!(err, Error::FetchFailed { offset: 30 }));
        assert_eq!(fetcher.attempts_for(30), 1);

        // A later access surfaces the same failure without re-fetching.
        let err = cache.get_or_fetch(30).await.unwrap_err();
        assert!(matches!(err, Error::FetchFailed { offset: 30 }));
        assert_eq!(fetcher.attempts_for(30), 1);
    }

    // Multi-threaded runtime: the spawned refill tasks must be movable
    // across worker threads.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_consume_triggers_refill_toward_capacity() {
        // max_resident=4: watermark 1, refill window 3.
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4);

        cache.get_or_fetch(0).await.unwrap();
        cache.consume(0);

        let fetcher2 = Arc::clone(&fetcher);
        wait_until(move || {
            fetcher2.attempts_for(10) == 1
                && fetcher2.attempts_for(20) == 1
                && fetcher2.attempts_for(30) == 1
        })
        .await;

        // Refill looks forward only and stays within the window.
        assert_eq!(fetcher.attempts_for(40), 0);
        assert!(cache.resident_offsets().len() <= 4);
    }

    #[tokio::test]
    async fn test_resident_count_never_exceeds_capacity() {
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 3);

        for offset in (0..100).step_by(10) {
            cache.get_or_fetch(offset).await.unwrap();
            assert!(cache.resident_offsets().len() <= 3);
            cache.consume(offset);
        }
    }

    #[tokio::test]
    async fn test_eviction_drops_lowest_consumed_offset_first() {
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 2);

        cache.get_or_fetch(0).await.unwrap();
        cache.get_or_fetch(10).await.unwrap();
        {
            let mut map = cache.inner.lock_map();
            for entry in map.entries.values_mut() {
                entry.consumed = true;
            }
        }

        cache.get_or_fetch(50).await.unwrap();
        assert!(!cache.contains(0));
        assert!(cache.contains(10));
        assert!(cache.contains(50));
    }

    #[tokio::test]
    async fn test_close_stops_new_fetches() {
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4);

        cache.close();
        cache.close(); // idempotent

        let err = cache.get_or_fetch(0).await.unwrap_err();
        assert!(matches!(err, Error::SourceClosed));
        assert_eq!(fetcher.attempts_for(0), 0);
    }

    #[tokio::test]
    async fn test_get_or_fetch_rejects_non_chunk_offset() {
        let fetcher = Arc::new(ScriptedFetcher::new(100));
        let cache = cache_with(ten_chunk_table(), Arc::clone(&fetcher), 4);

        let err = cache.get_or_fetch(5).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
