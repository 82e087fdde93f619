//! Error types for token resolution and cache construction.
//!
//! Two families of errors exist, and they never meet at the same boundary:
//!
//! - [`ResolveError`] is produced by a [`TokenResolver`](crate::TokenResolver) when a lookup is
//!   indeterminate. The cache swallows it (fail-closed), reports it to the observer, and never
//!   caches it.
//! - [`TokenCacheError`] is produced at construction time when the cache cannot be built. It is
//!   meant to abort startup rather than degrade into an always-miss cache.

use std::sync::Arc;

use thiserror::Error;

/// A shareable error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for cache construction.
pub type Result<T> = std::result::Result<T, TokenCacheError>;

/// Indeterminate outcome of a token lookup.
///
/// Returning `Err(ResolveError)` from a resolver means "could not decide";
/// returning `Ok(None)` means "definitively not found". Only the latter is
/// cached.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// The upstream store could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The upstream lookup exceeded its own deadline.
    #[error("Resolver timeout")]
    Timeout,

    /// Any other upstream failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl ResolveError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` for connection and timeout failures.
    ///
    /// Transient failures usually clear on their own; operators alert on the
    /// rate of non-transient ones.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Short, stable label for structured logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout => "timeout",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field is below its allowed minimum.
    #[error("{field} = {value} is below the minimum of {min}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered for humans.
        value: String,
        /// The minimum accepted value, rendered for humans.
        min: String,
    },
}

/// The token cache could not be constructed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenCacheError {
    /// Configuration was rejected during validation.
    #[error("Invalid token cache configuration: {0}")]
    Config(#[from] ConfigError),

    /// The backing store or its maintenance machinery is unavailable.
    #[error("Token cache unavailable: {message}")]
    CacheUnavailable {
        /// Why the cache could not be brought up.
        message: String,
    },
}

impl TokenCacheError {
    /// Creates a new `CacheUnavailable` error.
    #[must_use]
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::CacheUnavailable { message: message.into() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_resolve_error_display() {
        assert_eq!(
            ResolveError::connection("refused").to_string(),
            "Connection error: refused"
        );
        assert_eq!(ResolveError::timeout().to_string(), "Resolver timeout");
        assert_eq!(ResolveError::internal("boom").to_string(), "Internal error: boom");
    }

    #[rstest]
    #[case::connection(ResolveError::connection("x"), true, "connection")]
    #[case::timeout(ResolveError::timeout(), true, "timeout")]
    #[case::internal(ResolveError::internal("x"), false, "internal")]
    fn test_resolve_error_classification(
        #[case] err: ResolveError,
        #[case] transient: bool,
        #[case] kind: &str,
    ) {
        assert_eq!(err.is_transient(), transient);
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_resolve_error_preserves_source_chain() {
        let err = ResolveError::connection_with_source("pool exhausted", ResolveError::timeout());
        let source = err.source().expect("source chain must be preserved");
        assert_eq!(source.to_string(), "Resolver timeout");
    }

    #[test]
    fn test_config_error_converts_into_cache_error() {
        let err: TokenCacheError = ConfigError::BelowMinimum {
            field: "max_capacity",
            value: "0".into(),
            min: "1".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid token cache configuration: max_capacity = 0 is below the minimum of 1"
        );
    }

    #[test]
    fn test_cache_unavailable_display() {
        let err = TokenCacheError::cache_unavailable("no async runtime");
        assert_eq!(err.to_string(), "Token cache unavailable: no async runtime");
    }
}
