use std::time::Duration;

/// Tuning knobs for a remote byte source.
///
/// The prefetch constants (`low_watermark`, `refill_window`) are derived from
/// `max_resident_chunks`; they were chosen empirically and are kept as
/// defaults rather than re-tuned per workload.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Upper bound on chunks held in memory at once (prefetch depth).
    pub max_resident_chunks: usize,

    /// Cap on concurrent ranged requests sharing one client.
    pub max_concurrent_requests: usize,

    /// Total attempts per chunk before the fetch is fatal.
    pub retry_budget: u32,

    /// Idle connections retained in the transport pool.
    pub pool_max_idle: usize,

    /// How long idle pooled connections are kept alive.
    pub pool_idle_timeout: Duration,

    /// Transport connect timeout.
    pub connect_timeout: Duration,

    /// Per-request timeout covering the full response body.
    pub request_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            max_resident_chunks: 2000,
            max_concurrent_requests: 50,
            retry_budget: 5,
            pool_max_idle: 20,
            pool_idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SourceOptions {
    /// Unconsumed-chunk count at which a background refill is triggered.
    pub fn low_watermark(&self) -> usize {
        self.max_resident_chunks / 5 + 1
    }

    /// Maximum number of upcoming chunks scheduled by one refill.
    pub fn refill_window(&self) -> usize {
        (self.max_resident_chunks * 3 / 4).max(1)
    }
}
