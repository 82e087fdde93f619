//! The upstream lookup the cache sits in front of.
//!
//! The cache is polymorphic over [`TokenResolver`]: a database query, a remote
//! introspection call, or a static table all plug in the same way.
//!
//! # Contract
//!
//! | Return value      | Meaning                          | Cached?                 |
//! |-------------------|----------------------------------|-------------------------|
//! | `Ok(Some(token))` | Token is valid                   | yes, positive TTL       |
//! | `Ok(None)`        | Token definitively does not exist| yes, negative TTL       |
//! | `Err(_)`          | Could not decide                 | no                      |
//!
//! The cache makes no assumption about retries; a resolver that retries
//! internally should bound its own total latency.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{error::ResolveError, types::ResolvedToken};

/// Resolves a raw bearer token to what it grants.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Looks up `token` upstream.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the outcome is indeterminate. A token
    /// that simply does not exist is `Ok(None)`, not an error.
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError>;
}

#[async_trait]
impl<R: TokenResolver + ?Sized> TokenResolver for Arc<R> {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError> {
        (**self).resolve(token).await
    }
}

/// Adapts an async closure into a [`TokenResolver`].
///
/// The closure receives an owned copy of the token so the returned future
/// can be `'static`.
///
/// ```
/// use token_cache::{FnResolver, ResolveError, ResolvedToken};
///
/// let resolver = FnResolver::new(|token: String| async move {
///     if token == "validtoken" {
///         Ok(Some(ResolvedToken::builder().id("t1").actor_id(123).queue_id(7).build()))
///     } else {
///         Ok::<_, ResolveError>(None)
///     }
/// });
/// # let _ = resolver;
/// ```
pub struct FnResolver<F> {
    lookup: F,
}

impl<F> FnResolver<F> {
    /// Wraps `lookup`.
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl<F, Fut> TokenResolver for FnResolver<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<ResolvedToken>, ResolveError>> + Send,
{
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError> {
        (self.lookup)(token.to_owned()).await
    }
}

/// In-memory token table.
///
/// Useful for tests and for deployments with a fixed set of service tokens.
/// Lookups never fail; unknown tokens resolve to `Ok(None)`.
#[derive(Default)]
pub struct StaticResolver {
    tokens: RwLock<HashMap<String, ResolvedToken>>,
}

impl StaticResolver {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resolved` under `token`, replacing any previous entry.
    pub fn insert(&self, token: impl Into<String>, resolved: ResolvedToken) {
        self.tokens.write().insert(token.into(), resolved);
    }

    /// Removes `token` from the table, returning its previous value.
    pub fn remove(&self, token: &str) -> Option<ResolvedToken> {
        self.tokens.write().remove(token)
    }

    /// Number of registered tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Returns `true` if no tokens are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl FromIterator<(String, ResolvedToken)> for StaticResolver {
    fn from_iter<I: IntoIterator<Item = (String, ResolvedToken)>>(iter: I) -> Self {
        Self { tokens: RwLock::new(iter.into_iter().collect()) }
    }
}

#[async_trait]
impl TokenResolver for StaticResolver {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>, ResolveError> {
        Ok(self.tokens.read().get(token).cloned())
    }
}
