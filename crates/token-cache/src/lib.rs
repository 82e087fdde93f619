//! # Token Cache
//!
//! Short-lived, in-memory cache in front of a bearer token lookup.
//!
//! This crate provides:
//! - **Request coalescing**: concurrent misses for one token share a single upstream call
//! - **Negative caching**: "not found" is cached briefly; upstream errors never are
//! - **Fail-closed lookups**: [`TokenCache::get`] yields a token or `None`, never an error
//! - **Bootstrap support**: a setup token honored until first-run provisioning completes
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use token_cache::{FnResolver, ResolveError, ResolvedToken, TokenCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Arc::new(FnResolver::new(|token: String| async move {
//!     // Query the credential store here.
//!     let _ = token;
//!     let token = ResolvedToken::builder().id("t1").actor_id(123).queue_id(7).build();
//!     Ok::<_, ResolveError>(Some(token))
//! }));
//!
//! let cache = TokenCache::new(resolver, Duration::from_secs(5))?;
//! if let Some(token) = cache.get("bearer-token").await {
//!     println!("actor {} on queue {}", token.actor_id, token.queue_id);
//! }
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with a call-counting resolver and token
//!   fixtures. Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Compiles in the `token-cache-before-resolve` fail point.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// First-run setup token support.
pub mod bootstrap;
/// The coalescing token cache.
pub mod cache;
/// Cache configuration.
pub mod config;
/// Error types.
pub mod error;
/// Cache counters and latency percentiles.
pub mod metrics;
/// Observability sink for suppressed outcomes.
pub mod observer;
/// Upstream token lookup.
pub mod resolver;
mod singleflight;
/// Shared test helpers.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, missing_docs)]
pub mod testutil;
/// Resolved token and fingerprint types.
pub mod types;

// Re-export key types for convenience
pub use bootstrap::{BootstrapResolver, BootstrapState, ProvisioningProbe};
pub use cache::TokenCache;
pub use config::{
    DEFAULT_MAX_CAPACITY, DEFAULT_NEGATIVE_TTL, DEFAULT_POSITIVE_TTL, TokenCacheConfig,
};
pub use error::{BoxError, ConfigError, ResolveError, Result, TokenCacheError};
pub use metrics::{LatencyPercentiles, TokenCacheMetrics, TokenCacheMetricsSnapshot};
pub use observer::{CacheObserver, NoopObserver, TracingObserver};
pub use resolver::{FnResolver, StaticResolver, TokenResolver};
pub use types::{ResolvedToken, TokenFingerprint};
