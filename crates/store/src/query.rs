//! Statement queries, continuation cursors and pages.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    error::{StoreError, StoreResult},
    statement::{Statement, StatementId},
};

/// Filters applied when reading statements.
///
/// All filters are optional and combine with AND. A query is a pure value:
/// it carries no state between requests, the [`Cursor`] does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatementQuery {
    /// Return only this statement, unless it has been voided.
    pub statement_id: Option<StatementId>,
    /// Return only this statement, and only if it has been voided.
    pub voided_statement_id: Option<StatementId>,
    /// Match statements whose actor identifies this agent.
    pub agent: Option<AgentFilter>,
    /// Match statements with this verb IRI.
    pub verb: Option<String>,
    /// Match statements whose object is the activity with this IRI.
    pub activity: Option<String>,
    /// Match statements whose context carries this registration.
    pub registration: Option<Uuid>,
    /// Only statements stored strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only statements stored at or before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of statements the caller wants in total.
    pub limit: Option<usize>,
    pub format: ResultFormat,
    /// Oldest first when `true`; newest first otherwise.
    pub ascending: bool,
}

impl StatementQuery {
    /// A query matching a single statement id.
    #[must_use]
    pub fn by_id(id: StatementId) -> Self {
        Self { statement_id: Some(id), ..Self::default() }
    }

    /// Encodes this query as statements resource parameters.
    ///
    /// `limit` is left out; the page size is chosen per request.
    #[must_use]
    pub fn to_xapi_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(id) = self.statement_id {
            params.push(("statementId", id.to_string()));
        }
        if let Some(id) = self.voided_statement_id {
            params.push(("voidedStatementId", id.to_string()));
        }
        if let Some(agent) = &self.agent {
            params.push(("agent", agent.to_agent_json().to_string()));
        }
        if let Some(verb) = &self.verb {
            params.push(("verb", verb.clone()));
        }
        if let Some(activity) = &self.activity {
            params.push(("activity", activity.clone()));
        }
        if let Some(registration) = self.registration {
            params.push(("registration", registration.to_string()));
        }
        if let Some(since) = self.since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        if let Some(until) = self.until {
            params.push(("until", until.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        if self.format != ResultFormat::Exact {
            params.push(("format", self.format.as_str().to_owned()));
        }
        if self.ascending {
            params.push(("ascending", "true".to_owned()));
        }
        params
    }

    /// Parses statements resource parameters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an unknown parameter or a value
    /// that does not parse.
    pub fn from_xapi_params<K, V>(params: impl IntoIterator<Item = (K, V)>) -> StoreResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        fn invalid(name: &str, value: &str) -> StoreError {
            StoreError::validation(format!("invalid value for '{name}': {value}"))
        }
        fn timestamp(name: &str, value: &str) -> StoreResult<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| invalid(name, value))
        }

        let mut query = Self::default();
        for (name, value) in params {
            let (name, value) = (name.as_ref(), value.as_ref());
            match name {
                "statementId" => query.statement_id = Some(StatementId::from_str(value)?),
                "voidedStatementId" => {
                    query.voided_statement_id = Some(StatementId::from_str(value)?);
                },
                "agent" => {
                    let agent = serde_json::from_str::<Value>(value)
                        .ok()
                        .and_then(|v| AgentFilter::from_agent_json(&v))
                        .ok_or_else(|| invalid(name, value))?;
                    query.agent = Some(agent);
                },
                "verb" => query.verb = Some(value.to_owned()),
                "activity" => query.activity = Some(value.to_owned()),
                "registration" => {
                    query.registration =
                        Some(Uuid::parse_str(value).map_err(|_| invalid(name, value))?);
                },
                "since" => query.since = Some(timestamp(name, value)?),
                "until" => query.until = Some(timestamp(name, value)?),
                "limit" => query.limit = Some(value.parse().map_err(|_| invalid(name, value))?),
                "format" => {
                    query.format = match value {
                        "ids" => ResultFormat::Ids,
                        "exact" => ResultFormat::Exact,
                        "canonical" => ResultFormat::Canonical,
                        _ => return Err(invalid(name, value)),
                    };
                },
                "ascending" => {
                    query.ascending = value.parse().map_err(|_| invalid(name, value))?;
                },
                _ => {
                    return Err(StoreError::validation(format!("unknown query parameter '{name}'")));
                },
            }
        }
        Ok(query)
    }

    /// Returns `true` if `statement` passes every content filter of this query.
    ///
    /// Voiding and time-range filters depend on store state and are applied
    /// by adapters themselves.
    #[must_use]
    pub fn matches_content(&self, statement: &Statement) -> bool {
        if let Some(agent) = &self.agent
            && !agent.matches(&statement.actor)
        {
            return false;
        }
        if let Some(verb) = &self.verb
            && statement.verb_id() != Some(verb.as_str())
        {
            return false;
        }
        if let Some(activity) = &self.activity {
            let is_activity = statement
                .object
                .get("objectType")
                .and_then(Value::as_str)
                .is_none_or(|kind| kind == "Activity");
            if !is_activity
                || statement.object.get("id").and_then(Value::as_str) != Some(activity.as_str())
            {
                return false;
            }
        }
        if let Some(registration) = &self.registration {
            let found = statement
                .context
                .as_ref()
                .and_then(|c| c.get("registration"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            if found != Some(*registration) {
                return false;
            }
        }
        true
    }
}

/// Identifies an agent by one of its inverse functional identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum AgentFilter {
    Mbox(String),
    MboxSha1sum(String),
    Openid(String),
    Account { name: String, home_page: String },
}

impl AgentFilter {
    /// Returns `true` if `actor` is identified by this filter.
    #[must_use]
    pub fn matches(&self, actor: &Value) -> bool {
        let field = |name: &str| actor.get(name).and_then(Value::as_str);
        match self {
            Self::Mbox(mbox) => field("mbox") == Some(mbox.as_str()),
            Self::MboxSha1sum(sum) => field("mbox_sha1sum") == Some(sum.as_str()),
            Self::Openid(openid) => field("openid") == Some(openid.as_str()),
            Self::Account { name, home_page } => actor.get("account").is_some_and(|account| {
                account.get("name").and_then(Value::as_str) == Some(name.as_str())
                    && account.get("homePage").and_then(Value::as_str) == Some(home_page.as_str())
            }),
        }
    }

    /// The agent object this filter identifies, as sent in an `agent` parameter.
    #[must_use]
    pub fn to_agent_json(&self) -> Value {
        match self {
            Self::Mbox(mbox) => json!({ "mbox": mbox }),
            Self::MboxSha1sum(sum) => json!({ "mbox_sha1sum": sum }),
            Self::Openid(openid) => json!({ "openid": openid }),
            Self::Account { name, home_page } => {
                json!({ "account": { "name": name, "homePage": home_page } })
            },
        }
    }

    /// Extracts the identifier of an agent object, if it has one.
    #[must_use]
    pub fn from_agent_json(agent: &Value) -> Option<Self> {
        let field = |name: &str| agent.get(name).and_then(Value::as_str).map(str::to_owned);
        if let Some(mbox) = field("mbox") {
            return Some(Self::Mbox(mbox));
        }
        if let Some(sum) = field("mbox_sha1sum") {
            return Some(Self::MboxSha1sum(sum));
        }
        if let Some(openid) = field("openid") {
            return Some(Self::Openid(openid));
        }
        let account = agent.get("account")?;
        Some(Self::Account {
            name: account.get("name")?.as_str()?.to_owned(),
            home_page: account.get("homePage")?.as_str()?.to_owned(),
        })
    }

    /// Reduces an agent or group value to its identifying fields.
    fn reduce(actor: &Value) -> Value {
        let mut reduced = serde_json::Map::new();
        for key in ["objectType", "mbox", "mbox_sha1sum", "openid", "account"] {
            if let Some(value) = actor.get(key) {
                reduced.insert(key.to_owned(), value.clone());
            }
        }
        if let Some(Value::Array(members)) = actor.get("member") {
            reduced.insert("member".into(), Value::Array(members.iter().map(Self::reduce).collect()));
        }
        Value::Object(reduced)
    }
}

/// Shape of the statements returned by a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// Agents, verbs and activities reduced to their identifiers.
    Ids,
    /// Statements exactly as stored.
    #[default]
    Exact,
    /// Statements as stored; language maps are not filtered.
    Canonical,
}

impl ResultFormat {
    /// The parameter value naming this format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ids => "ids",
            Self::Exact => "exact",
            Self::Canonical => "canonical",
        }
    }

    /// Applies this format to a statement returned by a read.
    #[must_use]
    pub fn apply(self, mut statement: Statement) -> Statement {
        if self == Self::Ids {
            statement.actor = AgentFilter::reduce(&statement.actor);
            statement.verb = id_only(&statement.verb);
            let is_agent = matches!(
                statement.object.get("objectType").and_then(Value::as_str),
                Some("Agent" | "Group")
            );
            statement.object = if is_agent {
                AgentFilter::reduce(&statement.object)
            } else {
                let mut object = id_only(&statement.object);
                if let Some(kind) = statement.object.get("objectType")
                    && let Value::Object(map) = &mut object
                {
                    map.insert("objectType".into(), kind.clone());
                }
                object
            };
        }
        statement
    }
}

fn id_only(value: &Value) -> Value {
    match value.get("id") {
        Some(id) => json!({ "id": id }),
        None => value.clone(),
    }
}

/// Opaque continuation token returned with a page.
///
/// Only the adapter that produced a cursor can interpret it. Callers pass it
/// back unchanged to resume a read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps an adapter-specific token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of statements as returned by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub statements: Vec<Statement>,
    /// Cursor for the next page; `None` when the listing is exhausted.
    pub more: Option<Cursor>,
}

impl Page {
    /// Creates a final page with no continuation.
    #[must_use]
    pub fn last(statements: Vec<Statement>) -> Self {
        Self { statements, more: None }
    }

    /// Returns `true` if no further page exists.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.more.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn statement() -> Statement {
        let mut statement = Statement::new(
            json!({
                "objectType": "Agent",
                "name": "Learner",
                "account": {"name": "learner", "homePage": "https://lms.example.com"},
            }),
            json!({"id": "http://adlnet.gov/expapi/verbs/completed", "display": {"en-US": "completed"}}),
            json!({"id": "http://example.com/course/1", "definition": {"name": {"en-US": "Course"}}}),
        );
        statement.context = Some(json!({"registration": "2a7d1c8e-5b1e-4f0e-8d2e-6b1b9a3c4d5e"}));
        statement
    }

    #[test]
    fn test_agent_filter_matches_account() {
        let filter = AgentFilter::Account {
            name: "learner".into(),
            home_page: "https://lms.example.com".into(),
        };
        assert!(filter.matches(&statement().actor));
        assert!(!AgentFilter::Mbox("mailto:learner@example.com".into()).matches(&statement().actor));
    }

    #[test]
    fn test_content_filters_combine() {
        let query = StatementQuery {
            verb: Some("http://adlnet.gov/expapi/verbs/completed".into()),
            activity: Some("http://example.com/course/1".into()),
            registration: Some("2a7d1c8e-5b1e-4f0e-8d2e-6b1b9a3c4d5e".parse().unwrap()),
            ..StatementQuery::default()
        };
        assert!(query.matches_content(&statement()));

        let other_verb = StatementQuery { verb: Some("other".into()), ..query.clone() };
        assert!(!other_verb.matches_content(&statement()));

        let other_registration = StatementQuery { registration: Some(Uuid::new_v4()), ..query };
        assert!(!other_registration.matches_content(&statement()));
    }

    #[test]
    fn test_ids_format_reduces_triple() {
        let reduced = ResultFormat::Ids.apply(statement());
        assert!(reduced.actor.get("name").is_none());
        assert_eq!(reduced.actor["account"]["name"], "learner");
        assert_eq!(reduced.verb, json!({"id": "http://adlnet.gov/expapi/verbs/completed"}));
        assert_eq!(reduced.object, json!({"id": "http://example.com/course/1"}));

        assert_eq!(ResultFormat::Exact.apply(statement()), statement());
    }

    #[test]
    fn test_query_deserializes_with_defaults() {
        let query: StatementQuery =
            serde_json::from_value(json!({"agent": {"mbox": "mailto:a@example.com"}, "ascending": true}))
                .unwrap();
        assert_eq!(query.agent, Some(AgentFilter::Mbox("mailto:a@example.com".into())));
        assert!(query.ascending);
        assert_eq!(query.format, ResultFormat::Exact);
    }

    #[test]
    fn test_xapi_params_survive_a_request() {
        let query = StatementQuery {
            agent: Some(AgentFilter::Account {
                name: "learner".into(),
                home_page: "https://lms.example.com".into(),
            }),
            verb: Some("http://adlnet.gov/expapi/verbs/completed".into()),
            since: Some("2024-03-01T10:00:00Z".parse().unwrap()),
            format: ResultFormat::Ids,
            ascending: true,
            ..StatementQuery::default()
        };
        let params = query.to_xapi_params();
        assert!(params.contains(&("format", "ids".to_owned())));
        assert!(params.contains(&("since", "2024-03-01T10:00:00Z".to_owned())));

        let parsed = StatementQuery::from_xapi_params(params).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn test_from_xapi_params_rejects_bad_input() {
        let err = StatementQuery::from_xapi_params([("related_agents", "true")]).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(StatementQuery::from_xapi_params([("statementId", "not-a-uuid")]).is_err());
        assert!(StatementQuery::from_xapi_params([("agent", r#"{"name": "anonymous"}"#)]).is_err());
        assert!(StatementQuery::from_xapi_params([("limit", "-1")]).is_err());

        let query = StatementQuery::from_xapi_params([("limit", "25")]).unwrap();
        assert_eq!(query.limit, Some(25));
    }
}
