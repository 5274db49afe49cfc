//! Health types reported by backend adapters and the statement store.
//!
//! [`BackendAdapter::health_probe`](crate::BackendAdapter::health_probe) returns
//! a [`Health`] value carrying [`HealthMetadata`]. The store's `status()`
//! operation wraps the probe with its own timeout and converts probe errors
//! into [`Health::Unreachable`].
//!
//! # Health States
//!
//! - **Healthy**: the engine answers and can serve reads and writes.
//! - **Degraded**: the engine answers but reports a problem (a remote LRS
//!   heartbeat returning an error status, a cluster in yellow state).
//! - **Unreachable**: the engine could not be contacted at all.
//!
//! # Mapping to HTTP
//!
//! | `Health`      | Heartbeat response |
//! |---------------|--------------------|
//! | `Healthy`     | 200 OK             |
//! | `Degraded`    | 200 OK             |
//! | `Unreachable` | 503                |

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Health of a backend engine.
///
/// Each variant carries [`HealthMetadata`] with timing and adapter-specific details.
///
/// # Examples
///
/// ```
/// use lrs_store::{Health, HealthMetadata};
/// use std::time::Duration;
///
/// let health = Health::healthy(HealthMetadata::new(Duration::from_millis(2), "memory"));
/// assert!(health.is_healthy());
/// assert_eq!(health.to_string(), "healthy (2ms)");
/// ```
#[derive(Debug, Clone)]
pub enum Health {
    /// Engine is fully operational.
    Healthy(HealthMetadata),
    /// Engine answers but reports a problem.
    ///
    /// The `String` describes the degradation reason.
    Degraded(HealthMetadata, String),
    /// Engine could not be contacted.
    ///
    /// The `String` describes the failure reason.
    Unreachable(HealthMetadata, String),
}

impl Health {
    /// Creates a `Healthy` status.
    #[must_use = "creating a status has no side effects"]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unreachable` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn unreachable(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unreachable(metadata, reason.into())
    }

    /// Returns `true` if the engine is fully healthy.
    #[must_use = "health status predicates should be checked"]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if the engine is degraded.
    #[must_use = "health status predicates should be checked"]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(..))
    }

    /// Returns `true` if the engine could not be contacted.
    #[must_use = "health status predicates should be checked"]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(..))
    }

    /// Returns the short status label: `ok`, `degraded` or `unreachable`.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy(_) => "ok",
            Self::Degraded(..) => "degraded",
            Self::Unreachable(..) => "unreachable",
        }
    }

    /// Returns the metadata associated with this status.
    #[must_use = "returns metadata by reference without side effects"]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unreachable(m, _) => m,
        }
    }

    /// Returns the degradation or failure reason, if any.
    #[must_use = "returns the reason without side effects"]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unreachable(_, reason) => Some(reason),
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy(m) => write!(f, "healthy ({}ms)", m.check_duration.as_millis()),
            Self::Degraded(m, reason) => {
                write!(f, "degraded: {} ({}ms)", reason, m.check_duration.as_millis())
            },
            Self::Unreachable(m, reason) => {
                write!(f, "unreachable: {} ({}ms)", reason, m.check_duration.as_millis())
            },
        }
    }
}

/// Metadata about a health probe.
///
/// Contains timing information, the adapter name, and an extensible
/// key-value map for adapter-specific details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetadata {
    /// How long the probe itself took.
    #[serde(with = "humantime_serde")]
    pub check_duration: Duration,
    /// Identifier for the adapter (e.g. "memory", "lrs").
    pub backend: String,
    /// Adapter-specific details.
    ///
    /// Common keys include:
    /// - `statement_count`: number of stored statements
    /// - `endpoint`: base URL of a remote engine
    /// - `http_status`: status returned by a remote heartbeat
    pub details: HashMap<String, String>,
}

impl HealthMetadata {
    /// Creates a new `HealthMetadata` with the given probe duration and adapter name.
    #[must_use = "constructing metadata has no side effects"]
    pub fn new(check_duration: Duration, backend: impl Into<String>) -> Self {
        Self { check_duration, backend: backend.into(), details: HashMap::new() }
    }

    /// Adds a detail entry, returning `self` for chaining.
    #[must_use = "returns the modified metadata for chaining"]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
