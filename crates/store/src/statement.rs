//! The xAPI statement model, identity equivalence and content validation.
//!
//! A [`Statement`] keeps the mandatory `actor`, `verb` and `object` as opaque
//! JSON values: the store checks their presence but never interprets them.
//! Unknown top-level properties are carried through verbatim.
//!
//! Two statements sharing an id are *equivalent* when they are equal after
//! removing the fields listed in an [`EquivalencePolicy`]. Equivalent
//! re-submissions are no-ops; anything else is a conflict.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Identifier of a statement.
///
/// Wraps a [`Uuid`] so that arbitrary strings cannot be passed where a
/// validated statement id is expected.
///
/// # Examples
///
/// ```
/// use lrs_store::StatementId;
///
/// let id: StatementId = "3f2c1b9e-0d7a-4c7e-9a51-2b6f8e1d4a20".parse().unwrap();
/// assert_eq!(id.to_string(), "3f2c1b9e-0d7a-4c7e-9a51-2b6f8e1d4a20");
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementId(pub Uuid);

impl StatementId {
    /// Generates a fresh random (v4) identifier.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for StatementId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<StatementId> for Uuid {
    fn from(id: StatementId) -> Self {
        id.0
    }
}

impl FromStr for StatementId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StoreError::validation(format!("statement id `{s}` is not a UUID: {e}")))
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// An xAPI statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Primary identity. Generated server-side when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<StatementId>,
    /// Who performed the activity.
    pub actor: Value,
    /// What was done.
    pub verb: Value,
    /// What it was done to.
    pub object: Value,
    /// When the activity occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// When the store accepted the statement. Always set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<DateTime<Utc>>,
    /// Who asserted the statement. Stamped from the caller when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Any other top-level properties, carried through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Statement {
    /// Creates a statement with only the mandatory triple set.
    #[must_use]
    pub fn new(actor: Value, verb: Value, object: Value) -> Self {
        Self {
            id: None,
            actor,
            verb,
            object,
            timestamp: None,
            stored: None,
            authority: None,
            result: None,
            context: None,
            attachments: None,
            version: None,
            extra: BTreeMap::new(),
        }
    }

    /// Sets the identifier, returning `self` for chaining.
    #[must_use]
    pub fn with_id(mut self, id: StatementId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the timestamp, returning `self` for chaining.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns the verb IRI, if the verb carries one.
    #[must_use]
    pub fn verb_id(&self) -> Option<&str> {
        self.verb.get("id").and_then(Value::as_str)
    }

    /// Returns the id of the statement this one voids, if it is a voiding statement.
    #[must_use]
    pub fn voided_target(&self) -> Option<StatementId> {
        if self.verb_id() != Some(VOIDED_VERB) {
            return None;
        }
        if self.object.get("objectType").and_then(Value::as_str) != Some("StatementRef") {
            return None;
        }
        self.object.get("id").and_then(Value::as_str).and_then(|s| s.parse().ok())
    }

    /// Serializes the statement to a JSON object map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if a carried value cannot be encoded.
    pub fn to_json_map(&self) -> StoreResult<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::serialization("statement did not encode to an object")),
            Err(e) => Err(StoreError::serialization_with_source("failed to encode statement", e)),
        }
    }
}

/// Verb IRI marking a statement as voiding another.
pub const VOIDED_VERB: &str = "http://adlnet.gov/expapi/verbs/voided";

/// Top-level statement fields an [`EquivalencePolicy`] can exclude from comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementField {
    Timestamp,
    Stored,
    Authority,
    Version,
    Result,
    Context,
    Attachments,
}

impl StatementField {
    /// The JSON property name of this field.
    #[must_use]
    pub fn json_name(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Stored => "stored",
            Self::Authority => "authority",
            Self::Version => "version",
            Self::Result => "result",
            Self::Context => "context",
            Self::Attachments => "attachments",
        }
    }
}

/// Decides whether a submitted statement matches one already stored under the same id.
///
/// The default ignores `stored`, `authority` and `version`, which the store
/// stamps itself, and ignores `timestamp` when the submission omits it (the
/// stored copy was stamped on first acceptance).
///
/// ```
/// use lrs_store::{EquivalencePolicy, Statement};
/// use serde_json::json;
///
/// let policy = EquivalencePolicy::default();
/// let a = Statement::new(json!({"mbox": "mailto:a@example.com"}), json!({"id": "v"}), json!({"id": "o"}));
/// let mut b = a.clone();
/// b.stored = Some(chrono::Utc::now());
/// assert!(policy.equivalent(&a, &b).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EquivalencePolicy {
    /// Fields excluded from the comparison.
    pub ignored: BTreeSet<StatementField>,
    /// Skip `timestamp` when the submitted statement does not carry one.
    pub ignore_absent_timestamp: bool,
}

impl Default for EquivalencePolicy {
    fn default() -> Self {
        Self {
            ignored: [StatementField::Stored, StatementField::Authority, StatementField::Version]
                .into_iter()
                .collect(),
            ignore_absent_timestamp: true,
        }
    }
}

impl EquivalencePolicy {
    /// A policy that compares every field.
    #[must_use]
    pub fn strict() -> Self {
        Self { ignored: BTreeSet::new(), ignore_absent_timestamp: false }
    }

    /// Adds a field to the ignored set, returning `self` for chaining.
    #[must_use]
    pub fn ignoring(mut self, field: StatementField) -> Self {
        self.ignored.insert(field);
        self
    }

    /// Returns `true` if `submitted` is equivalent to the `stored` statement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if either statement cannot be encoded.
    pub fn equivalent(&self, submitted: &Statement, stored: &Statement) -> StoreResult<bool> {
        let skip_timestamp = self.ignore_absent_timestamp && submitted.timestamp.is_none();
        let mut left = submitted.to_json_map()?;
        let mut right = stored.to_json_map()?;
        for field in &self.ignored {
            left.remove(field.json_name());
            right.remove(field.json_name());
        }
        if skip_timestamp {
            left.remove("timestamp");
            right.remove("timestamp");
        }
        Ok(left == right)
    }
}

/// Turns a raw JSON record into a [`Statement`] or rejects it.
pub trait StatementValidator: Send + Sync {
    /// Validates one raw record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when the record is malformed.
    fn validate(&self, raw: Value) -> StoreResult<Statement>;
}

/// Minimal validator accepting any record with an actor, a verb id and an object.
///
/// Optional `id` must be a UUID and optional `timestamp` an RFC 3339 date.
/// Everything else is accepted as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaxValidator;

impl StatementValidator for LaxValidator {
    fn validate(&self, raw: Value) -> StoreResult<Statement> {
        let Value::Object(map) = &raw else {
            return Err(StoreError::validation("statement must be a JSON object"));
        };
        for field in ["actor", "verb", "object"] {
            match map.get(field) {
                None | Some(Value::Null) => {
                    return Err(StoreError::validation(format!("missing required field `{field}`")));
                },
                Some(_) => {},
            }
        }
        if map.get("verb").and_then(|v| v.get("id")).and_then(Value::as_str).is_none() {
            return Err(StoreError::validation("`verb.id` must be a string"));
        }
        if let Some(id) = map.get("id")
            && !id.is_null()
        {
            let Some(id) = id.as_str() else {
                return Err(StoreError::validation("`id` must be a string"));
            };
            id.parse::<StatementId>()?;
        }
        serde_json::from_value(raw)
            .map_err(|e| StoreError::validation(format!("malformed statement: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Statement {
        Statement::new(
            json!({"mbox": "mailto:learner@example.com"}),
            json!({"id": "http://adlnet.gov/expapi/verbs/completed"}),
            json!({"id": "http://example.com/course/1"}),
        )
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let raw = json!({
            "actor": {"mbox": "mailto:a@example.com"},
            "verb": {"id": "v"},
            "object": {"id": "o"},
            "x-custom": [1, 2, 3],
        });
        let statement: Statement = serde_json::from_value(raw).unwrap();
        assert_eq!(statement.extra.get("x-custom"), Some(&json!([1, 2, 3])));

        let encoded = serde_json::to_value(&statement).unwrap();
        assert_eq!(encoded["x-custom"], json!([1, 2, 3]));
        assert!(encoded.get("stored").is_none(), "absent optionals are not encoded");
    }

    #[test]
    fn test_default_policy_ignores_server_stamped_fields() {
        let policy = EquivalencePolicy::default();
        let submitted = sample().with_id(StatementId::new_v4());
        let mut stored = submitted.clone();
        stored.stored = Some(Utc::now());
        stored.authority = Some(json!({"mbox": "mailto:admin@example.com"}));
        stored.version = Some("1.0.3".into());
        stored.timestamp = Some(Utc::now());

        assert!(policy.equivalent(&submitted, &stored).unwrap());
    }

    #[test]
    fn test_default_policy_compares_present_timestamp() {
        let policy = EquivalencePolicy::default();
        let t1 = "2024-01-01T00:00:00Z".parse().unwrap();
        let t2 = "2024-01-02T00:00:00Z".parse().unwrap();
        let submitted = sample().with_timestamp(t1);
        let stored = sample().with_timestamp(t2);

        assert!(!policy.equivalent(&submitted, &stored).unwrap());
        assert!(policy.equivalent(&submitted, &sample().with_timestamp(t1)).unwrap());
    }

    #[test]
    fn test_different_actor_is_not_equivalent() {
        let policy = EquivalencePolicy::default();
        let mut other = sample();
        other.actor = json!({"mbox": "mailto:someone-else@example.com"});
        assert!(!policy.equivalent(&sample(), &other).unwrap());
    }

    #[test]
    fn test_strict_policy_compares_everything() {
        let policy = EquivalencePolicy::strict();
        let mut stored = sample();
        stored.stored = Some(Utc::now());
        assert!(!policy.equivalent(&sample(), &stored).unwrap());

        let relaxed = EquivalencePolicy::strict().ignoring(StatementField::Stored);
        assert!(relaxed.equivalent(&sample(), &stored).unwrap());
    }

    #[test]
    fn test_policy_deserializes_from_config() {
        let policy: EquivalencePolicy =
            serde_json::from_value(json!({"ignored": ["stored", "context"]})).unwrap();
        assert!(policy.ignored.contains(&StatementField::Context));
        assert!(policy.ignore_absent_timestamp, "unspecified fields keep defaults");

        let unknown = serde_json::from_value::<EquivalencePolicy>(json!({"ignore": []}));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_lax_validator_accepts_minimal_statement() {
        let statement = LaxValidator
            .validate(json!({
                "id": "8f8b3a4e-9d49-4c62-8d0b-5e5a8e0e4a11",
                "actor": {"mbox": "mailto:a@example.com"},
                "verb": {"id": "v"},
                "object": {"id": "o"},
            }))
            .unwrap();
        assert_eq!(statement.id.unwrap().to_string(), "8f8b3a4e-9d49-4c62-8d0b-5e5a8e0e4a11");
    }

    #[test]
    fn test_lax_validator_rejections() {
        let cases = [
            json!([]),
            json!({"verb": {"id": "v"}, "object": {}}),
            json!({"actor": {}, "verb": {}, "object": {}}),
            json!({"actor": {}, "verb": {"id": "v"}}),
            json!({"id": "not-a-uuid", "actor": {}, "verb": {"id": "v"}, "object": {}}),
            json!({"timestamp": "yesterday", "actor": {}, "verb": {"id": "v"}, "object": {}}),
        ];
        for raw in cases {
            let err = LaxValidator.validate(raw.clone()).unwrap_err();
            assert!(matches!(err, StoreError::Validation { .. }), "{raw} gave {err:?}");
        }
    }

    #[test]
    fn test_voided_target() {
        let target = StatementId::new_v4();
        let voiding = Statement::new(
            json!({"mbox": "mailto:admin@example.com"}),
            json!({"id": VOIDED_VERB}),
            json!({"objectType": "StatementRef", "id": target.to_string()}),
        );
        assert_eq!(voiding.voided_target(), Some(target));
        assert_eq!(sample().voided_target(), None);
    }
}
