//! Configuration for the statement store façade.
//!
//! [`StoreConfig`] collects the server-side limits and defaults applied by
//! [`StatementStore`](crate::StatementStore): the read limit ceiling, the
//! per-call timeouts, the default [`WriteOptions`] and the
//! [`EquivalencePolicy`] used for identity checks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, statement::EquivalencePolicy, writer::WriteOptions};

/// Default ceiling on statements returned by one read.
pub const DEFAULT_MAX_READ_LIMIT: usize = 100;

/// Default timeout for one `fetch_page` call made by `read`.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the health probe.
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`StatementStore`](crate::StatementStore).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use lrs_store::{StoreConfig, WriteOptions};
///
/// let config = StoreConfig::builder()
///     .max_read_limit(50)
///     .health_timeout(Duration::from_secs(1))
///     .write(WriteOptions::builder().chunk_size(100).concurrency(4).build()?)
///     .build()?;
/// assert_eq!(config.max_read_limit(), 50);
/// # Ok::<(), lrs_store::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Server-enforced maximum for read limits.
    #[serde(default = "default_max_read_limit")]
    pub(crate) max_read_limit: usize,

    /// Timeout for each adapter call made by `read`.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub(crate) read_timeout: Duration,

    /// Timeout for the health probe made by `status`.
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub(crate) health_timeout: Duration,

    /// Write options used when a write does not override them.
    #[serde(default)]
    pub(crate) write: WriteOptions,

    /// Fields ignored when comparing a re-submitted statement with the stored one.
    #[serde(default)]
    pub(crate) equivalence: EquivalencePolicy,
}

fn default_max_read_limit() -> usize {
    DEFAULT_MAX_READ_LIMIT
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_health_timeout() -> Duration {
    DEFAULT_HEALTH_TIMEOUT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_read_limit: DEFAULT_MAX_READ_LIMIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            write: WriteOptions::default(),
            equivalence: EquivalencePolicy::default(),
        }
    }
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new configuration, validating every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_read_limit` is zero, a timeout is zero,
    /// or the write options are invalid.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_READ_LIMIT)] max_read_limit: usize,
        #[builder(default = DEFAULT_READ_TIMEOUT)] read_timeout: Duration,
        #[builder(default = DEFAULT_HEALTH_TIMEOUT)] health_timeout: Duration,
        #[builder(default)] write: WriteOptions,
        #[builder(default)] equivalence: EquivalencePolicy,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_read_limit, read_timeout, health_timeout, write, equivalence };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("max_read_limit", self.max_read_limit)?;
        for (field, value) in
            [("read_timeout", self.read_timeout), ("health_timeout", self.health_timeout)]
        {
            if value.is_zero() {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
        }
        self.write.validate()
    }

    /// Server-enforced maximum for read limits.
    #[must_use]
    pub fn max_read_limit(&self) -> usize {
        self.max_read_limit
    }

    /// Timeout for each adapter call made by `read`.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Timeout for the health probe.
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    /// Default write options.
    #[must_use]
    pub fn write(&self) -> &WriteOptions {
        &self.write
    }

    /// Equivalence policy used for identity checks.
    #[must_use]
    pub fn equivalence(&self) -> &EquivalencePolicy {
        &self.equivalence
    }

    /// Clamps a requested read limit to the server maximum.
    ///
    /// `None` and `0` both mean "as many as the server allows".
    #[must_use]
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.max_read_limit,
            Some(limit) => limit.min(self.max_read_limit),
        }
    }
}
