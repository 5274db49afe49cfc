//! Configuration for the remote LRS adapter and the forwarder.
//!
//! This module provides [`LrsAdapterConfig`], which configures how
//! [`LrsAdapter`](crate::LrsAdapter) reaches a remote LRS, [`RetryConfig`]
//! for transient-failure retries, and [`ForwarderConfig`] for the
//! [`Forwarder`](crate::Forwarder) worker.

use std::time::Duration;

use lrs_store::ConfigError;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::target::Credentials;

/// Default request timeout (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default path of the statements resource.
const DEFAULT_STATEMENTS_ENDPOINT: &str = "/xAPI/statements";

/// Default path of the heartbeat resource.
const DEFAULT_STATUS_ENDPOINT: &str = "/__heartbeat__";

/// Default value of the `X-Experience-API-Version` header.
const DEFAULT_XAPI_VERSION: &str = "1.0.3";

/// Default number of concurrent single-statement requests made by a lookup.
const DEFAULT_LOOKUP_CONCURRENCY: usize = 8;

/// Default forwarding queue capacity, in batches.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default time `shutdown` waits for queued batches to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_statements_endpoint() -> String {
    DEFAULT_STATEMENTS_ENDPOINT.to_owned()
}

fn default_status_endpoint() -> String {
    DEFAULT_STATUS_ENDPOINT.to_owned()
}

fn default_xapi_version() -> String {
    DEFAULT_XAPI_VERSION.to_owned()
}

fn default_lookup_concurrency() -> usize {
    DEFAULT_LOOKUP_CONCURRENCY
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn require_nonzero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
    }
    Ok(())
}

/// Retry behaviour for transient failures.
///
/// Attempts are `max_retries + 1` in total. Delays grow exponentially from
/// `initial_backoff`, are capped at `max_backoff`, and carry up to 50% jitter.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use lrs_store_http::RetryConfig;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .initial_backoff(Duration::from_millis(50))
///     .build()?;
/// assert_eq!(config.max_retries, 5);
/// # Ok::<(), lrs_store::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Upper bound on the delay before jitter.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or greater than
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("initial_backoff", self.initial_backoff)?;
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Invalid {
                field: "max_backoff",
                reason: format!(
                    "must be at least initial_backoff ({}ms)",
                    self.initial_backoff.as_millis()
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for [`LrsAdapter`](crate::LrsAdapter).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use lrs_store_http::{Credentials, LrsAdapterConfig};
///
/// let config = LrsAdapterConfig::builder()
///     .base_url("http://lrs.example.com:8100")
///     .credentials(Credentials::new("ralph", "secret"))
///     .timeout(Duration::from_secs(5))
///     .build()?;
/// assert_eq!(config.statements_url()?.path(), "/xAPI/statements");
/// # Ok::<(), lrs_store::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LrsAdapterConfig {
    /// Root URL of the remote LRS.
    pub(crate) base_url: String,

    /// Basic auth credentials sent with every request.
    #[serde(default)]
    pub(crate) credentials: Option<Credentials>,

    /// Path of the statements resource.
    #[serde(default = "default_statements_endpoint")]
    pub(crate) statements_endpoint: String,

    /// Path of the heartbeat resource used by the health probe.
    #[serde(default = "default_status_endpoint")]
    pub(crate) status_endpoint: String,

    /// Value of the `X-Experience-API-Version` header.
    #[serde(default = "default_xapi_version")]
    pub(crate) xapi_version: String,

    /// Timeout for each HTTP request.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub(crate) timeout: Duration,

    /// Maximum single-statement requests in flight during a lookup.
    #[serde(default = "default_lookup_concurrency")]
    pub(crate) lookup_concurrency: usize,

    /// Retries for idempotent requests (reads, lookups, heartbeat).
    #[serde(default)]
    pub(crate) retry: RetryConfig,
}

#[bon::bon]
impl LrsAdapterConfig {
    /// Creates a new configuration, validating every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `base_url` is not an absolute `http`/`https` URL
    /// - an endpoint path does not start with `/`
    /// - `timeout` or `lookup_concurrency` is zero
    /// - the retry configuration is invalid
    #[builder]
    pub fn new(
        #[builder(into)] base_url: String,
        credentials: Option<Credentials>,
        #[builder(into, default = default_statements_endpoint())] statements_endpoint: String,
        #[builder(into, default = default_status_endpoint())] status_endpoint: String,
        #[builder(into, default = default_xapi_version())] xapi_version: String,
        #[builder(default = DEFAULT_TIMEOUT)] timeout: Duration,
        #[builder(default = DEFAULT_LOOKUP_CONCURRENCY)] lookup_concurrency: usize,
        #[builder(default)] retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            base_url,
            credentials,
            statements_endpoint,
            status_endpoint,
            xapi_version,
            timeout,
            lookup_concurrency,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.parsed_base_url()?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "base_url",
                reason: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }
        for (field, path) in [
            ("statements_endpoint", &self.statements_endpoint),
            ("status_endpoint", &self.status_endpoint),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid { field, reason: "must start with '/'".into() });
            }
        }
        require_nonzero("timeout", self.timeout)?;
        ConfigError::require_positive("lookup_concurrency", self.lookup_concurrency)?;
        self.retry.validate()
    }

    /// Root URL of the remote LRS, as configured.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid { field: "base_url", reason: e.to_string() })
    }

    /// Basic auth credentials, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retry configuration for idempotent requests.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Absolute URL of the statements resource.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `base_url` does not parse.
    pub fn statements_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.parsed_base_url()?;
        url.set_path(&self.statements_endpoint);
        url.set_query(None);
        Ok(url)
    }

    /// Absolute URL of the heartbeat resource.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `base_url` does not parse.
    pub fn status_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.parsed_base_url()?;
        url.set_path(&self.status_endpoint);
        url.set_query(None);
        Ok(url)
    }
}

/// Configuration for the [`Forwarder`](crate::Forwarder) worker.
///
/// Per-target settings (timeout, retry count) live on
/// [`ForwardingTarget`](crate::ForwardingTarget); this struct holds what is
/// shared by every relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwarderConfig {
    /// Batches waiting to be relayed before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub(crate) queue_capacity: usize,

    /// Delay before a target's first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub(crate) initial_backoff: Duration,

    /// Upper bound on the delay between retries.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub(crate) max_backoff: Duration,

    /// How long `shutdown` waits for queued batches to drain.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub(crate) shutdown_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[bon::bon]
impl ForwarderConfig {
    /// Creates a forwarder configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `queue_capacity` is zero, a duration is
    /// zero, or `initial_backoff` exceeds `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_QUEUE_CAPACITY)] queue_capacity: usize,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
        #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)] shutdown_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { queue_capacity, initial_backoff, max_backoff, shutdown_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("queue_capacity", self.queue_capacity)?;
        require_nonzero("shutdown_timeout", self.shutdown_timeout)?;
        self.retry_for(0).validate()
    }

    /// Queue capacity in batches.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Drain timeout used by `shutdown`.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Retry configuration for a target allowing `max_retries` retries.
    #[must_use]
    pub fn retry_for(&self, max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}
