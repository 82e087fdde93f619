//! Bearer token micro-cache with request coalescing.
//!
//! This module provides [`TokenCache`], which wraps a [`TokenResolver`] with a
//! short-lived in-memory cache so that an authorization check does not hit the
//! upstream store on every request.
//!
//! # Architecture
//!
//! ```text
//! get(token) → store hit?   → Resolved → return token
//!                           → Absent   → return None
//!            → miss → in-flight fetch for token?
//!                       yes → wait for its result
//!                       no  → spawn fetch → resolver
//!                                  → Ok(Some) → write Resolved (positive TTL)
//!                                  → Ok(None) → write Absent   (negative TTL)
//!                                  → Err      → write nothing, report
//!                               → fan result out to every waiter
//! ```
//!
//! # Guarantees
//!
//! - **Coalescing**: at most one resolver call per key is in flight at any time, however many
//!   callers miss at once. Every caller in a round receives the same `Arc`.
//! - **Negative caching**: "not found" is cached for the negative TTL, so a burst of lookups for a
//!   bogus token costs one upstream call per TTL window.
//! - **Errors are never cached**: the next miss after a failure retries upstream.
//! - **Fail-closed**: callers only ever see a token or `None`.
//! - **Decoupled fetches**: the fetch runs in its own task. A caller that times out or is
//!   dropped stops waiting; the fetch still completes for everyone else.
//!
//! # Examples
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use token_cache::{StaticResolver, TokenCache};
//!
//! # async fn example() -> Result<(), token_cache::TokenCacheError> {
//! let resolver = Arc::new(StaticResolver::new());
//! let cache = TokenCache::new(resolver, Duration::from_secs(5))?;
//!
//! match cache.get("bearer-token-from-header").await {
//!     Some(token) if token.has_permission("read") => { /* allow */ },
//!     _ => { /* deny */ },
//! }
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use fail::fail_point;
use moka::{Expiry, future::Cache, notification::RemovalCause};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::TokenCacheConfig,
    error::{ResolveError, Result, TokenCacheError},
    metrics::{TokenCacheMetrics, TokenCacheMetricsSnapshot},
    observer::{CacheObserver, TracingObserver},
    resolver::TokenResolver,
    singleflight::{FlightGuard, Singleflight, Slot, Ticket},
    types::{ResolvedToken, TokenFingerprint},
};

/// What every caller of a coalescing round receives.
type Outcome = Option<Arc<ResolvedToken>>;

/// A stored lookup result.
#[derive(Clone)]
enum CachedLookup {
    Resolved(Arc<ResolvedToken>),
    Absent,
}

impl CachedLookup {
    fn into_outcome(self) -> Outcome {
        match self {
            Self::Resolved(token) => Some(token),
            Self::Absent => None,
        }
    }
}

/// Assigns each entry its TTL from the outcome it records.
struct OutcomeExpiry {
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl OutcomeExpiry {
    /// Positive entries never outlive the token itself. `now_millis` is
    /// epoch milliseconds.
    fn ttl_for(&self, value: &CachedLookup, now_millis: i64) -> Duration {
        match value {
            CachedLookup::Resolved(token) => match token.remaining_at(now_millis) {
                Some(remaining) => self.positive_ttl.min(remaining),
                None => self.positive_ttl,
            },
            CachedLookup::Absent => self.negative_ttl,
        }
    }
}

impl Expiry<String, CachedLookup> for OutcomeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedLookup,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl_for(value, Utc::now().timestamp_millis()))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedLookup,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.ttl_for(value, Utc::now().timestamp_millis()))
    }
}

/// Short-lived cache in front of a [`TokenResolver`].
///
/// Cheap to share behind an `Arc`. Dropping the cache stops its maintenance
/// task; calling [`shutdown`](Self::shutdown) first is optional.
pub struct TokenCache {
    /// Token → outcome, with per-entry TTL and capacity-bounded eviction.
    store: Cache<String, CachedLookup>,
    resolver: Arc<dyn TokenResolver>,
    observer: Arc<dyn CacheObserver>,
    flights: Arc<Singleflight<String, Outcome>>,
    metrics: Arc<TokenCacheMetrics>,
    /// Bumped by every `clear_all`.
    ///
    /// Single-key invalidation flags the key's in-flight round instead (see
    /// [`Singleflight::mark_stale`]); a fetch keeps its result only if neither
    /// changed while it ran.
    clear_epoch: Arc<AtomicU64>,
    config: TokenCacheConfig,
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokenCache {
    /// Creates a cache that uses `ttl` for both resolved and not-found entries.
    ///
    /// # Errors
    ///
    /// Returns [`TokenCacheError::Config`] if `ttl` is below 1ms.
    pub fn new(resolver: Arc<dyn TokenResolver>, ttl: Duration) -> Result<Self> {
        Self::from_config(resolver, TokenCacheConfig::with_ttl(ttl)?)
    }

    /// Creates a cache from a full configuration.
    ///
    /// If the configuration sets a maintenance interval, the maintenance task
    /// is spawned on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`TokenCacheError::Config`] if the configuration fails validation.
    /// - [`TokenCacheError::CacheUnavailable`] if a maintenance interval is configured but no
    ///   Tokio runtime is running.
    pub fn from_config(resolver: Arc<dyn TokenResolver>, config: TokenCacheConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(TokenCacheMetrics::new());
        let listener_metrics = Arc::clone(&metrics);
        let store = Cache::builder()
            .name("token_cache")
            .max_capacity(config.max_capacity())
            .expire_after(OutcomeExpiry {
                positive_ttl: config.positive_ttl(),
                negative_ttl: config.negative_ttl(),
            })
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Expired => listener_metrics.record_expiration(),
                RemovalCause::Size => listener_metrics.record_size_eviction(),
                RemovalCause::Explicit | RemovalCause::Replaced => {},
            })
            .build();

        let cache = Self {
            store,
            resolver,
            observer: Arc::new(TracingObserver),
            flights: Arc::new(Singleflight::new()),
            metrics,
            clear_epoch: Arc::new(AtomicU64::new(0)),
            config,
            cancel_token: CancellationToken::new(),
            maintenance_handle: Mutex::new(None),
        };

        if let Some(interval) = cache.config.maintenance_interval() {
            cache.start_maintenance(interval)?;
        }

        tracing::debug!(
            positive_ttl_ms = cache.config.positive_ttl().as_millis() as u64,
            negative_ttl_ms = cache.config.negative_ttl().as_millis() as u64,
            max_capacity = cache.config.max_capacity(),
            "token cache created"
        );

        Ok(cache)
    }

    /// Replaces the default [`TracingObserver`].
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Starts a background task that applies pending store maintenance
    /// (TTL sweeping, capacity eviction) every `interval`.
    ///
    /// Without it, maintenance piggybacks on cache reads and writes.
    ///
    /// # Errors
    ///
    /// Returns [`TokenCacheError::CacheUnavailable`] if called outside a
    /// Tokio runtime or if maintenance is already running.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Result<Self> {
        self.start_maintenance(interval)?;
        self.config.maintenance_interval = Some(interval);
        Ok(self)
    }

    fn start_maintenance(&self, interval: Duration) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            TokenCacheError::cache_unavailable(format!("maintenance task needs a Tokio runtime: {err}"))
        })?;

        let mut slot = self.maintenance_handle.lock();
        if slot.is_some() {
            return Err(TokenCacheError::cache_unavailable("maintenance task already running"));
        }

        let store = self.store.clone();
        let token = self.cancel_token.clone();
        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; start with a full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("token cache maintenance stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.run_pending_tasks().await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Returns what `token` currently resolves to.
    ///
    /// Never fails: a resolver error, a missing token, and a fetch that died
    /// all produce `None`. Errors and not-found outcomes are reported to the
    /// observer instead.
    ///
    /// Fetches run as spawned tasks. A miss outside a Tokio runtime cannot
    /// start one and yields `None`.
    #[tracing::instrument(
        name = "token_cache.get",
        skip_all,
        fields(token = %TokenFingerprint::of(token))
    )]
    pub async fn get(&self, token: &str) -> Option<Arc<ResolvedToken>> {
        if let Some(entry) = self.store.get(token).await {
            match entry {
                CachedLookup::Resolved(_) => {
                    self.metrics.record_hit();
                    tracing::debug!("cache hit");
                },
                CachedLookup::Absent => {
                    self.metrics.record_negative_hit();
                    tracing::debug!("negative cache hit");
                },
            }
            return entry.into_outcome();
        }
        self.metrics.record_miss();
        tracing::debug!("cache miss");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("token lookup missed outside a Tokio runtime; failing closed");
            return None;
        };

        let mut receiver = match self.flights.acquire(token.to_owned()) {
            Slot::Follower(receiver) => {
                self.metrics.record_coalesced();
                tracing::trace!("joined in-flight fetch");
                receiver
            },
            Slot::Leader(ticket) => {
                let receiver = ticket.subscribe();
                let round = self.fetch_round(token);
                runtime.spawn(round.run(ticket).in_current_span());
                receiver
            },
        };

        let mut wait = WaitGuard { metrics: &self.metrics, finished: false };
        let outcome = match receiver.recv().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "token fetch ended without a result");
                None
            },
        };
        wait.finished = true;
        outcome
    }

    /// Like [`get`](Self::get), but gives up after `wait`.
    ///
    /// Giving up only ends this caller's wait. A fetch this call started
    /// keeps running and still populates the cache for later callers.
    pub async fn get_within(&self, token: &str, wait: Duration) -> Option<Arc<ResolvedToken>> {
        match tokio::time::timeout(wait, self.get(token)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(
                    token = %TokenFingerprint::of(token),
                    wait_ms = wait.as_millis() as u64,
                    "stopped waiting for token fetch"
                );
                None
            },
        }
    }

    fn fetch_round(&self, token: &str) -> FetchRound {
        FetchRound {
            key: token.to_owned(),
            store: self.store.clone(),
            resolver: Arc::clone(&self.resolver),
            observer: Arc::clone(&self.observer),
            flights: Arc::clone(&self.flights),
            metrics: Arc::clone(&self.metrics),
            clear_epoch: Arc::clone(&self.clear_epoch),
        }
    }

    /// Caches `resolved` for `token` without calling the resolver.
    pub async fn insert(&self, token: impl Into<String>, resolved: ResolvedToken) {
        self.store.insert(token.into(), CachedLookup::Resolved(Arc::new(resolved))).await;
    }

    /// Caches a "not found" outcome for `token` without calling the resolver.
    pub async fn insert_absent(&self, token: impl Into<String>) {
        self.store.insert(token.into(), CachedLookup::Absent).await;
    }

    /// Removes `token` from the cache.
    ///
    /// A fetch for `token` that is in flight when this runs still answers its
    /// waiters but does not write its result.
    #[tracing::instrument(skip_all, fields(token = %TokenFingerprint::of(token)))]
    pub async fn invalidate(&self, token: &str) {
        // Flag before removing: a fetch that writes after the removal sees the
        // flag on its re-check and takes the write back.
        self.flights.mark_stale(token);
        self.store.invalidate(token).await;
        tracing::info!(
            audit.action = "invalidate_token",
            audit.result = "success",
            "audit_event"
        );
    }

    /// Removes every entry.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) {
        let evicted = self.store.entry_count();
        self.clear_epoch.fetch_add(1, Ordering::SeqCst);
        self.store.invalidate_all();
        tracing::info!(
            audit.action = "clear_token_cache",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Stops background maintenance and releases all cached entries.
    ///
    /// Idempotent. Lookups after shutdown still work; they simply start from
    /// an empty cache.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.maintenance_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "token cache maintenance task panicked");
        }
        self.clear_all().await;
        self.store.run_pending_tasks().await;
        tracing::info!("token cache shut down");
    }

    /// Applies pending store maintenance now.
    ///
    /// Entry counts are eventually consistent; call this first when an exact
    /// count matters.
    pub async fn run_pending_tasks(&self) {
        self.store.run_pending_tasks().await;
    }

    /// Approximate number of cached entries, positive and negative.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.store.entry_count()
    }

    /// Number of tokens with a fetch in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.flights.len()
    }

    /// Returns a snapshot of the cache counters.
    #[must_use]
    pub fn metrics(&self) -> TokenCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &TokenCacheConfig {
        &self.config
    }

    /// Returns `true` while the maintenance task is running.
    #[must_use]
    pub fn maintenance_running(&self) -> bool {
        self.maintenance_handle.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TokenCache {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("config", &self.config)
            .field("entry_count", &self.store.entry_count())
            .field("in_flight", &self.flights.len())
            .finish_non_exhaustive()
    }
}

/// Counts callers that stop waiting before their round completes.
struct WaitGuard<'a> {
    metrics: &'a TokenCacheMetrics,
    finished: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record_abandoned_wait();
        }
    }
}

/// One coalescing round: everything the detached fetch task owns.
struct FetchRound {
    key: String,
    store: Cache<String, CachedLookup>,
    resolver: Arc<dyn TokenResolver>,
    observer: Arc<dyn CacheObserver>,
    flights: Arc<Singleflight<String, Outcome>>,
    metrics: Arc<TokenCacheMetrics>,
    clear_epoch: Arc<AtomicU64>,
}

impl FetchRound {
    async fn run(self, ticket: Ticket<Outcome>) {
        let guard = FlightGuard::new(&self.flights, self.key.clone(), ticket);

        // A round that completed between our miss and our registration has
        // already written the entry.
        if let Some(entry) = self.store.get(&self.key).await {
            guard.publish(entry.into_outcome());
            return;
        }

        let fingerprint = TokenFingerprint::of(&self.key);
        let epoch_before = self.clear_epoch.load(Ordering::SeqCst);

        let started = Instant::now();
        let result = self.resolve().await;
        self.metrics.record_resolver_call(started.elapsed());

        let entry = match result {
            Ok(Some(token)) => {
                self.metrics.record_resolved();
                CachedLookup::Resolved(Arc::new(token))
            },
            Ok(None) => {
                self.metrics.record_not_found();
                self.observer.token_not_found(&fingerprint);
                CachedLookup::Absent
            },
            Err(error) => {
                self.metrics.record_resolver_error();
                self.observer.resolver_failed(&fingerprint, &error);
                guard.publish(None);
                return;
            },
        };

        if !self.write_back(&guard, entry.clone(), epoch_before).await {
            self.metrics.record_discarded_write();
            tracing::debug!(
                token = %fingerprint,
                "discarding fetch result: invalidation occurred during fetch"
            );
        }

        guard.publish(entry.into_outcome());
    }

    /// Stores `entry` unless this key was invalidated, or the cache cleared,
    /// since the fetch started. Returns `false` if the result was not kept.
    ///
    /// The check runs again after the insert. An invalidation that lands
    /// between the first check and the insert is caught there and the entry
    /// is removed; one that lands after the second check removes it itself.
    async fn write_back(
        &self,
        guard: &FlightGuard<'_, String, Outcome>,
        entry: CachedLookup,
        epoch_before: u64,
    ) -> bool {
        let superseded =
            || guard.is_stale() || self.clear_epoch.load(Ordering::SeqCst) != epoch_before;

        if superseded() {
            return false;
        }
        self.store.insert(self.key.clone(), entry).await;
        if superseded() {
            self.store.invalidate(&self.key).await;
            return false;
        }
        true
    }

    async fn resolve(&self) -> std::result::Result<Option<ResolvedToken>, ResolveError> {
        fail_point!("token-cache-before-resolve", |_| {
            Err(ResolveError::internal("injected failure before resolve"))
        });
        self.resolver.resolve(&self.key).await
    }
}
