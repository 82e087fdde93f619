//! Token cache configuration.
//!
//! [`TokenCacheConfig`] can be built in code through its validating builder or
//! deserialized from a service configuration file. Durations use
//! [`humantime`](https://docs.rs/humantime) notation (`"5s"`, `"750ms"`).
//!
//! ```
//! use std::time::Duration;
//! use token_cache::TokenCacheConfig;
//!
//! let config = TokenCacheConfig::builder()
//!     .positive_ttl(Duration::from_secs(5))
//!     .negative_ttl(Duration::from_secs(2))
//!     .max_capacity(50_000)
//!     .build()?;
//! assert_eq!(config.negative_ttl(), Duration::from_secs(2));
//! # Ok::<(), token_cache::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default TTL for resolved tokens (5 seconds).
///
/// Short enough that a disabled token stops working within seconds.
pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(5);

/// Default TTL for "not found" outcomes (5 seconds).
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(5);

/// Default maximum number of cached tokens.
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Smallest accepted TTL or maintenance interval.
const MIN_DURATION: Duration = Duration::from_millis(1);

/// Configuration for [`TokenCache`](crate::TokenCache).
///
/// # Validation
///
/// - `positive_ttl` and `negative_ttl` must be at least 1ms
/// - `max_capacity` must be at least 1
/// - `maintenance_interval`, if set, must be at least 1ms
///
/// Deserialized values are validated when handed to
/// [`TokenCache::from_config`](crate::TokenCache::from_config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenCacheConfig {
    /// TTL for entries holding a resolved token.
    #[serde(with = "humantime_serde", default = "default_positive_ttl")]
    pub(crate) positive_ttl: Duration,

    /// TTL for entries recording a definitive "not found".
    #[serde(with = "humantime_serde", default = "default_negative_ttl")]
    pub(crate) negative_ttl: Duration,

    /// Maximum number of cached entries, positive and negative combined.
    #[serde(default = "default_max_capacity")]
    pub(crate) max_capacity: u64,

    /// Interval of the background maintenance task, if any.
    #[serde(with = "humantime_serde", default)]
    pub(crate) maintenance_interval: Option<Duration>,
}

fn default_positive_ttl() -> Duration {
    DEFAULT_POSITIVE_TTL
}

fn default_negative_ttl() -> Duration {
    DEFAULT_NEGATIVE_TTL
}

fn default_max_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: DEFAULT_POSITIVE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_capacity: DEFAULT_MAX_CAPACITY,
            maintenance_interval: None,
        }
    }
}

#[bon::bon]
impl TokenCacheConfig {
    /// Creates a validated configuration.
    ///
    /// # Optional Fields
    ///
    /// * `positive_ttl` - TTL for resolved tokens (default: 5 seconds).
    /// * `negative_ttl` - TTL for "not found" outcomes (default: 5 seconds).
    /// * `max_capacity` - Maximum cached entries (default: 10 000).
    /// * `maintenance_interval` - Background maintenance period (default: none).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if any field is out of range.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_POSITIVE_TTL)] positive_ttl: Duration,
        #[builder(default = DEFAULT_NEGATIVE_TTL)] negative_ttl: Duration,
        #[builder(default = DEFAULT_MAX_CAPACITY)] max_capacity: u64,
        maintenance_interval: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self { positive_ttl, negative_ttl, max_capacity, maintenance_interval };
        config.validate()?;
        Ok(config)
    }

    /// Configuration that applies one TTL to both positive and negative outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `ttl` is below 1ms.
    pub fn with_ttl(ttl: Duration) -> Result<Self, ConfigError> {
        Self::builder().positive_ttl(ttl).negative_ttl(ttl).build()
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("positive_ttl", self.positive_ttl)?;
        check_duration("negative_ttl", self.negative_ttl)?;
        if self.max_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_capacity",
                value: self.max_capacity.to_string(),
                min: "1".to_owned(),
            });
        }
        if let Some(interval) = self.maintenance_interval {
            check_duration("maintenance_interval", interval)?;
        }
        Ok(())
    }

    /// Returns the TTL for resolved tokens.
    #[must_use]
    pub fn positive_ttl(&self) -> Duration {
        self.positive_ttl
    }

    /// Returns the TTL for "not found" outcomes.
    #[must_use]
    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    /// Returns the maximum number of cached entries.
    #[must_use]
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Returns the background maintenance interval, if enabled.
    #[must_use]
    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval
    }
}

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value < MIN_DURATION {
        return Err(ConfigError::BelowMinimum {
            field,
            value: format!("{}us", value.as_micros()),
            min: "1ms".to_owned(),
        });
    }
    Ok(())
}
