//! Side channel for outcomes the cache hides from its callers.
//!
//! `get` never surfaces errors: a resolver failure and a missing token both
//! look like "no token" to the authorization point. Operators still need to
//! tell "token truly invalid" from "upstream degraded", so the cache reports
//! both events here.

use crate::{error::ResolveError, types::TokenFingerprint};

/// Receives cache events that must not reach the caller.
///
/// Implementations must be cheap and non-blocking; they run on the fetch path.
/// Only the token's [`TokenFingerprint`] is ever passed, never the raw token.
pub trait CacheObserver: Send + Sync {
    /// A resolver call failed. Nothing was cached; waiters saw "no token".
    fn resolver_failed(&self, token: &TokenFingerprint, error: &ResolveError);

    /// The resolver reported that the token does not exist. An absent entry
    /// was cached with the negative TTL.
    fn token_not_found(&self, token: &TokenFingerprint);
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn resolver_failed(&self, token: &TokenFingerprint, error: &ResolveError) {
        tracing::warn!(
            token = %token,
            error = %error,
            error_kind = error.kind(),
            transient = error.is_transient(),
            "token resolver failed"
        );
    }

    fn token_not_found(&self, token: &TokenFingerprint) {
        tracing::debug!(token = %token, "token not found");
    }
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {
    fn resolver_failed(&self, _token: &TokenFingerprint, _error: &ResolveError) {}

    fn token_not_found(&self, _token: &TokenFingerprint) {}
}
