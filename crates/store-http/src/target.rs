//! Forwarding targets and where they come from.
//!
//! A [`ForwardingTarget`] is a remote statements endpoint that receives a
//! copy of every accepted batch. Targets are resolved through a
//! [`TargetSource`] each time a batch is relayed, so configuration changes
//! apply to the next batch without a restart, while one relay always sees a
//! single immutable snapshot.

use std::{env, fmt, sync::Arc, time::Duration};

use lrs_store::{ConfigError, StoreError, StoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable read by [`EnvTargetSource::default`].
pub const DEFAULT_TARGETS_ENV: &str = "XAPI_FORWARDINGS";

fn default_max_retries() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_active() -> bool {
    true
}

/// Basic auth credentials.
///
/// The password is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Creates credentials from a username and password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A remote endpoint receiving forwarded statements.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use lrs_store_http::{Credentials, ForwardingTarget};
///
/// let target = ForwardingTarget::builder()
///     .url("http://mirror.example.com/xAPI/statements")
///     .credentials(Credentials::new("ralph", "secret"))
///     .max_retries(3)
///     .timeout(Duration::from_secs(2))
///     .build()?;
/// assert!(target.is_active);
/// # Ok::<(), lrs_store::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingTarget {
    /// Statements endpoint the batch is POSTed to.
    pub url: String,

    /// Basic auth credentials, if the target requires them.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Retries after the first failed delivery.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout for each delivery attempt.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Inactive targets are logged and skipped.
    #[serde(default = "default_active")]
    pub is_active: bool,
}

#[bon::bon]
impl ForwardingTarget {
    /// Creates a target.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is empty or the timeout is zero.
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        credentials: Option<Credentials>,
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_timeout())] timeout: Duration,
        #[builder(default = true)] is_active: bool,
    ) -> Result<Self, ConfigError> {
        let target = Self { url, credentials, max_retries, timeout, is_active };
        target.validate()?;
        Ok(target)
    }

    /// Validates a target obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "url", reason: "must not be empty".into() });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Supplies the forwarding targets for a relay.
///
/// Called once per batch; the returned list is used unchanged for that
/// batch. An empty list disables forwarding.
pub trait TargetSource: Send + Sync {
    /// Returns the currently configured targets, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or parsed.
    fn targets(&self) -> StoreResult<Vec<ForwardingTarget>>;
}

/// An in-process target list that can be replaced at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticTargetSource {
    targets: Arc<RwLock<Arc<Vec<ForwardingTarget>>>>,
}

impl StaticTargetSource {
    /// Creates a source serving `targets`.
    #[must_use]
    pub fn new(targets: Vec<ForwardingTarget>) -> Self {
        Self { targets: Arc::new(RwLock::new(Arc::new(targets))) }
    }

    /// Replaces the target list. Relays already running keep their snapshot.
    pub fn replace(&self, targets: Vec<ForwardingTarget>) {
        info!(count = targets.len(), "Replacing forwarding targets");
        *self.targets.write() = Arc::new(targets);
    }
}

impl TargetSource for StaticTargetSource {
    fn targets(&self) -> StoreResult<Vec<ForwardingTarget>> {
        let snapshot = Arc::clone(&self.targets.read());
        Ok(snapshot.as_ref().clone())
    }
}

/// Reads a JSON array of targets from an environment variable.
///
/// A missing or blank variable means no targets. The variable is read on
/// every call.
#[derive(Debug, Clone)]
pub struct EnvTargetSource {
    variable: String,
}

impl EnvTargetSource {
    /// Creates a source reading `variable`.
    #[must_use]
    pub fn new(variable: impl Into<String>) -> Self {
        Self { variable: variable.into() }
    }

    /// The environment variable this source reads.
    #[must_use]
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Parses a JSON target list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for malformed JSON and
    /// [`StoreError::Parameter`] for an invalid target.
    pub fn parse(raw: &str) -> StoreResult<Vec<ForwardingTarget>> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let targets: Vec<ForwardingTarget> = serde_json::from_str(raw).map_err(|e| {
            StoreError::serialization_with_source("invalid forwarding target list", e)
        })?;
        for target in &targets {
            target.validate()?;
        }
        Ok(targets)
    }
}

impl Default for EnvTargetSource {
    fn default() -> Self {
        Self::new(DEFAULT_TARGETS_ENV)
    }
}

impl TargetSource for EnvTargetSource {
    fn targets(&self) -> StoreResult<Vec<ForwardingTarget>> {
        match env::var(&self.variable) {
            Ok(raw) => Self::parse(&raw),
            Err(env::VarError::NotPresent) => Ok(Vec::new()),
            Err(err @ env::VarError::NotUnicode(_)) => Err(StoreError::validation(format!(
                "{} is not valid forwarding configuration: {err}",
                self.variable
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn target(url: &str) -> ForwardingTarget {
        ForwardingTarget::builder().url(url).build().unwrap()
    }

    #[test]
    fn test_target_defaults() {
        let target = target("http://mirror.example.com/xAPI/statements");
        assert_eq!(target.max_retries, 1);
        assert_eq!(target.timeout, Duration::from_secs(5));
        assert!(target.is_active);
        assert!(target.credentials.is_none());
    }

    #[test]
    fn test_target_validation() {
        assert!(ForwardingTarget::builder().url(" ").build().is_err());
        assert!(ForwardingTarget::builder().url("http://x").timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("ralph", "secret"));
        assert!(rendered.contains("ralph"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_static_source_replace_applies_to_next_snapshot() {
        let source = StaticTargetSource::new(vec![target("http://a")]);
        let before = source.targets().unwrap();
        source.replace(vec![target("http://b"), target("http://c")]);

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].url, "http://a");
        let after: Vec<_> = source.targets().unwrap().into_iter().map(|t| t.url).collect();
        assert_eq!(after, ["http://b", "http://c"]);
    }

    #[test]
    fn test_parse_target_list() {
        let targets = EnvTargetSource::parse(
            r#"[
                {"url": "http://a/xAPI/statements", "credentials": {"username": "u", "password": "p"},
                 "max_retries": 4, "timeout": "250ms"},
                {"url": "http://b/xAPI/statements", "is_active": false}
            ]"#,
        )
        .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].max_retries, 4);
        assert_eq!(targets[0].timeout, Duration::from_millis(250));
        assert!(!targets[1].is_active);
    }

    #[test]
    fn test_parse_blank_and_invalid() {
        assert!(EnvTargetSource::parse("  ").unwrap().is_empty());
        assert!(matches!(
            EnvTargetSource::parse("{not json"),
            Err(StoreError::Serialization { .. })
        ));
        assert!(matches!(
            EnvTargetSource::parse(r#"[{"url": ""}]"#),
            Err(StoreError::Parameter(_))
        ));
        assert!(EnvTargetSource::parse(r#"[{"url": "http://a", "retries": 2}]"#).is_err());
    }

    #[test]
    fn test_env_source_missing_variable_is_empty() {
        let source = EnvTargetSource::new("LRS_STORE_HTTP_TEST_UNSET_FORWARDINGS");
        assert!(source.targets().unwrap().is_empty());
        assert_eq!(EnvTargetSource::default().variable(), DEFAULT_TARGETS_ENV);
    }
}
