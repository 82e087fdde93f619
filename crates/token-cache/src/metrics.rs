//! Counters and latency percentiles for the token cache.
//!
//! All counters are lock-free atomics updated on the request path. Resolver
//! latency is kept in a bounded ring of recent samples so percentiles reflect
//! current behavior rather than process lifetime.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use token_cache::TokenCacheMetrics;
//!
//! let metrics = TokenCacheMetrics::new();
//! metrics.record_hit();
//! metrics.record_miss();
//! metrics.record_resolver_call(Duration::from_micros(150));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.resolver_calls, 1);
//! assert_eq!(snapshot.resolver_percentiles.p50, 150);
//! assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
//! ```

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

/// Number of recent resolver latency samples kept for percentiles.
const DEFAULT_HISTOGRAM_WINDOW_SIZE: usize = 1024;

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// Median latency.
    pub p50: u64,
    /// 95th percentile latency.
    pub p95: u64,
    /// 99th percentile latency.
    pub p99: u64,
}

/// Bounded circular buffer of latency samples.
struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(HistogramInner { buf: Vec::with_capacity(capacity), pos: 0, capacity }) }
    }

    fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % inner.capacity;
    }

    fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted = self.inner.lock().buf.clone();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len - 1)
}

/// Live counters for a [`TokenCache`](crate::TokenCache).
pub struct TokenCacheMetrics {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    resolver_calls: AtomicU64,
    resolved: AtomicU64,
    not_found: AtomicU64,
    resolver_errors: AtomicU64,
    abandoned_waits: AtomicU64,
    discarded_writes: AtomicU64,
    expirations: AtomicU64,
    size_evictions: AtomicU64,
    resolver_latency_us: AtomicU64,
    resolver_histogram: LatencyHistogram,
}

impl Default for TokenCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCacheMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            resolver_calls: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            resolver_errors: AtomicU64::new(0),
            abandoned_waits: AtomicU64::new(0),
            discarded_writes: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            size_evictions: AtomicU64::new(0),
            resolver_latency_us: AtomicU64::new(0),
            resolver_histogram: LatencyHistogram::new(DEFAULT_HISTOGRAM_WINDOW_SIZE),
        }
    }

    /// A live positive entry answered the lookup.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A live absent entry answered the lookup.
    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// The store had nothing for the key.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller attached to a fetch already in flight.
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// The resolver was invoked and took `latency`.
    pub fn record_resolver_call(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.resolver_calls.fetch_add(1, Ordering::Relaxed);
        self.resolver_latency_us.fetch_add(us, Ordering::Relaxed);
        self.resolver_histogram.record(us);
    }

    /// The resolver returned a token.
    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    /// The resolver reported the token as not found.
    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// The resolver failed.
    pub fn record_resolver_error(&self) {
        self.resolver_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller stopped waiting before its fetch completed.
    pub fn record_abandoned_wait(&self) {
        self.abandoned_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// A fetch result was not written because an invalidation raced it.
    pub fn record_discarded_write(&self) {
        self.discarded_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry was removed because its TTL elapsed.
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry was removed under capacity pressure.
    pub fn record_size_eviction(&self) {
        self.size_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> TokenCacheMetricsSnapshot {
        TokenCacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            resolver_calls: self.resolver_calls.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            resolver_errors: self.resolver_errors.load(Ordering::Relaxed),
            abandoned_waits: self.abandoned_waits.load(Ordering::Relaxed),
            discarded_writes: self.discarded_writes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size_evictions: self.size_evictions.load(Ordering::Relaxed),
            resolver_latency_us: self.resolver_latency_us.load(Ordering::Relaxed),
            resolver_percentiles: self.resolver_histogram.percentiles(),
        }
    }
}

/// Snapshot of [`TokenCacheMetrics`].
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct TokenCacheMetricsSnapshot {
    /// Lookups answered by a positive entry.
    #[builder(default)]
    pub hits: u64,
    /// Lookups answered by an absent entry.
    #[builder(default)]
    pub negative_hits: u64,
    /// Lookups that found nothing in the store.
    #[builder(default)]
    pub misses: u64,
    /// Misses that joined an in-flight fetch instead of starting one.
    #[builder(default)]
    pub coalesced: u64,
    /// Resolver invocations.
    #[builder(default)]
    pub resolver_calls: u64,
    /// Resolver invocations that returned a token.
    #[builder(default)]
    pub resolved: u64,
    /// Resolver invocations that returned "not found".
    #[builder(default)]
    pub not_found: u64,
    /// Resolver invocations that failed.
    #[builder(default)]
    pub resolver_errors: u64,
    /// Callers that gave up waiting (timeout or dropped future).
    #[builder(default)]
    pub abandoned_waits: u64,
    /// Fetch results dropped because of a concurrent invalidation.
    #[builder(default)]
    pub discarded_writes: u64,
    /// Entries removed by TTL.
    #[builder(default)]
    pub expirations: u64,
    /// Entries removed under capacity pressure.
    #[builder(default)]
    pub size_evictions: u64,
    /// Cumulative resolver latency in microseconds.
    #[builder(default)]
    pub resolver_latency_us: u64,
    /// Resolver latency percentiles over recent calls.
    #[builder(default)]
    pub resolver_percentiles: LatencyPercentiles,
}

impl TokenCacheMetricsSnapshot {
    /// Total lookups observed.
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.hits + self.negative_hits + self.misses
    }

    /// Fraction of lookups answered from the store (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            return 0.0;
        }
        (self.hits + self.negative_hits) as f64 / lookups as f64
    }

    /// Mean resolver latency in microseconds.
    #[must_use]
    pub fn avg_resolver_latency_us(&self) -> u64 {
        self.resolver_latency_us.checked_div(self.resolver_calls).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = TokenCacheMetrics::new().snapshot();
        assert_eq!(snapshot.lookups(), 0);
        assert_eq!(snapshot.hit_rate(), 0.0);
        assert_eq!(snapshot.avg_resolver_latency_us(), 0);
        assert_eq!(snapshot.resolver_percentiles, LatencyPercentiles::default());
    }

    #[test]
    fn test_hit_rate_counts_negative_hits() {
        let snapshot =
            TokenCacheMetricsSnapshot::builder().hits(2).negative_hits(1).misses(1).build();
        assert_eq!(snapshot.lookups(), 4);
        assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolver_latency_accumulates() {
        let metrics = TokenCacheMetrics::new();
        metrics.record_resolver_call(Duration::from_micros(100));
        metrics.record_resolver_call(Duration::from_micros(300));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.resolver_calls, 2);
        assert_eq!(snapshot.resolver_latency_us, 400);
        assert_eq!(snapshot.avg_resolver_latency_us(), 200);
    }

    #[test]
    fn test_histogram_window_overwrites_oldest() {
        let histogram = LatencyHistogram::new(4);
        for value in [1_000, 1_000, 1_000, 1_000, 1, 2, 3, 4] {
            histogram.record(value);
        }
        let p = histogram.percentiles();
        assert_eq!(p.p99, 4, "old samples must have been overwritten");
        assert_eq!(p.p50, 2);
    }

    #[rstest]
    #[case(1, 50, 0)]
    #[case(100, 50, 49)]
    #[case(100, 95, 94)]
    #[case(100, 99, 98)]
    #[case(10, 99, 9)]
    fn test_percentile_index(#[case] len: usize, #[case] pct: u32, #[case] expected: usize) {
        assert_eq!(percentile_index(len, pct), expected);
    }
}
