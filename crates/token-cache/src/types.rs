//! Resolved token and token fingerprint types.

use std::{fmt, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest in a fingerprint.
const FINGERPRINT_LEN: usize = 12;

/// What a bearer token resolves to.
///
/// Produced by a [`TokenResolver`](crate::TokenResolver) and shared, behind an
/// `Arc`, with every caller of the coalescing round that fetched it.
///
/// # Examples
///
/// ```
/// use token_cache::ResolvedToken;
///
/// let token = ResolvedToken::builder()
///     .id("t1")
///     .actor_id(123)
///     .queue_id(7)
///     .expire(0)
///     .permissions(vec!["read".to_owned()])
///     .build();
///
/// assert!(token.never_expires());
/// assert!(token.has_permission("read"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct ResolvedToken {
    /// Token identifier (not the secret itself).
    #[builder(into)]
    pub id: String,
    /// The actor that owns this token.
    pub actor_id: i64,
    /// Resource queue the token is scoped to.
    pub queue_id: i64,
    /// Expiry as Unix epoch seconds. `0` means the token never expires.
    #[builder(default)]
    pub expire: i64,
    /// Granted permissions. Duplicates are allowed and order carries no meaning.
    #[builder(default)]
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl ResolvedToken {
    /// Returns `true` when the token carries no expiry.
    #[must_use]
    pub fn never_expires(&self) -> bool {
        self.expire == 0
    }

    /// Returns `true` if the token is expired at `now` (epoch seconds).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        !self.never_expires() && now >= self.expire
    }

    /// Returns `true` if the token is expired right now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    /// Validity left at `now_millis` (epoch milliseconds), or `None` for
    /// tokens that never expire.
    ///
    /// Millisecond precision: never reports validity past the `expire`
    /// second. Expired tokens report zero.
    #[must_use]
    pub fn remaining_at(&self, now_millis: i64) -> Option<Duration> {
        if self.never_expires() {
            return None;
        }
        let remaining = self.expire.saturating_mul(1000).saturating_sub(now_millis);
        Some(Duration::from_millis(u64::try_from(remaining).unwrap_or(0)))
    }

    /// Returns `true` if `permission` is among the granted permissions.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Non-reversible, log-safe identifier for a raw token string.
///
/// Raw tokens are credentials and must never reach logs, spans, or metrics.
/// The fingerprint is a truncated SHA-256 digest: stable across calls, so
/// repeated failures for the same token correlate in logs, but useless for
/// replay.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenFingerprint(String);

impl TokenFingerprint {
    /// Computes the fingerprint of a raw token.
    #[must_use]
    pub fn of(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        Self(hex)
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TokenFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenFingerprint({})", self.0)
    }
}
