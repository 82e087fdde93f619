//! Shared test utilities for token cache testing.
//!
//! This module provides a [`CountingResolver`] that records how often the
//! cache reaches upstream and can inject latency, failures, and pauses, plus
//! fixture builders for [`ResolvedToken`]. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! token-cache = { path = ".", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use token_cache::testutil::{CountingResolver, sample_token};
//! ```

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    error::ResolveError,
    resolver::{StaticResolver, TokenResolver},
    types::ResolvedToken,
};

/// Builds the canonical fixture token: actor 123, queue 7, expiring in one
/// hour, granting `read`.
pub fn sample_token(id: &str) -> ResolvedToken {
    ResolvedToken::builder()
        .id(id)
        .actor_id(123)
        .queue_id(7)
        .expire(Utc::now().timestamp() + 3600)
        .permissions(vec!["read".to_owned()])
        .build()
}

/// Builds a token that expires `secs` seconds from now.
pub fn token_expiring_in(id: &str, secs: i64) -> ResolvedToken {
    ResolvedToken { expire: Utc::now().timestamp() + secs, ..sample_token(id) }
}

/// [`TokenResolver`] backed by an in-memory table that counts its calls.
///
/// Injection knobs apply to every subsequent call:
///
/// - [`set_delay`](Self::set_delay) sleeps before answering
/// - [`set_failure`](Self::set_failure) returns an error instead of looking up
/// - [`enable_gate`](Self::enable_gate) parks each call until [`open_gate`](Self::open_gate)
pub struct CountingResolver {
    tokens: StaticResolver,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    failure: Mutex<Option<ResolveError>>,
    gated: AtomicBool,
    started: Notify,
    gate: Notify,
}

impl CountingResolver {
    /// Creates a resolver with no tokens and no injected behavior.
    pub fn new() -> Self {
        Self {
            tokens: StaticResolver::new(),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            gated: AtomicBool::new(false),
            started: Notify::new(),
            gate: Notify::new(),
        }
    }

    /// Registers `resolved` under `token`.
    pub fn insert(&self, token: impl Into<String>, resolved: ResolvedToken) {
        self.tokens.insert(token, resolved);
    }

    /// Removes `token`; later lookups report "not found".
    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Number of `resolve` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resets the call counter.
    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Sleeps for `delay` before answering each call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Makes every call fail with a clone of `failure`, or clears the failure.
    pub fn set_failure(&self, failure: Option<ResolveError>) {
        *self.failure.lock() = failure;
    }

    /// Parks each call until [`open_gate`](Self::open_gate) is called.
    pub fn enable_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Releases one parked call.
    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    /// Waits until a call has entered the resolver.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

impl Default for CountingResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenResolver for CountingResolver {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.tokens.resolve(token).await
    }
}
