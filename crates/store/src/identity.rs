//! Statement identity and conflict resolution.
//!
//! Before a batch is written every statement is given an id (generated when
//! absent) and checked against what is already stored, using a single
//! [`BackendAdapter::lookup_by_ids`] round trip:
//!
//! | Stored copy | Outcome |
//! |-------------|---------|
//! | none | [`Decision::Insert`] |
//! | equivalent | [`Decision::AlreadyStored`] (no-op) |
//! | different | the whole batch fails with [`StoreError::Conflict`] |
//!
//! A batch that repeats an id fails with [`StoreError::DuplicateInBatch`]
//! before the adapter is consulted. In both failure cases nothing is written.
//!
//! The lookup and the insert are separate adapter calls, so a concurrent
//! writer can store the same id in between. [`ConflictReconciler`] settles
//! such collisions after the fact: an equivalent copy makes the statement a
//! no-op, a different one is a real conflict.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    adapter::BackendAdapter,
    error::{StoreError, StoreResult},
    statement::{EquivalencePolicy, Statement, StatementId},
};

/// What to do with one submitted statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Not stored yet; the statement (now carrying an id) must be inserted.
    Insert(Statement),
    /// An equivalent statement is already stored under this id.
    AlreadyStored(StatementId),
}

impl Decision {
    /// The id this decision is about.
    #[must_use]
    pub fn id(&self) -> Option<StatementId> {
        match self {
            Self::Insert(statement) => statement.id,
            Self::AlreadyStored(id) => Some(*id),
        }
    }
}

/// Per-statement decisions for a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub decisions: Vec<Decision>,
}

impl Resolution {
    /// Number of statements that need inserting.
    #[must_use]
    pub fn insert_count(&self) -> usize {
        self.decisions.iter().filter(|d| matches!(d, Decision::Insert(_))).count()
    }
}

/// Assigns ids and classifies a batch against stored statements.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    policy: EquivalencePolicy,
}

impl IdentityResolver {
    /// Creates a resolver comparing statements with `policy`.
    #[must_use]
    pub fn new(policy: EquivalencePolicy) -> Self {
        Self { policy }
    }

    /// The equivalence policy in use.
    #[must_use]
    pub fn policy(&self) -> &EquivalencePolicy {
        &self.policy
    }

    /// Resolves a batch against `adapter`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateInBatch`] if two statements share an id
    /// - [`StoreError::Conflict`] if a stored statement differs from a submitted one
    /// - any error from [`BackendAdapter::lookup_by_ids`]
    #[tracing::instrument(skip_all, fields(adapter = adapter.name(), batch = statements.len()))]
    pub async fn resolve(
        &self,
        adapter: &dyn BackendAdapter,
        statements: Vec<Statement>,
    ) -> StoreResult<Resolution> {
        let mut seen = HashSet::with_capacity(statements.len());
        let mut with_ids = Vec::with_capacity(statements.len());
        for mut statement in statements {
            let id = *statement.id.get_or_insert_with(StatementId::new_v4);
            if !seen.insert(id) {
                warn!(%id, "Duplicate statement id in batch");
                return Err(StoreError::duplicate_in_batch(id));
            }
            with_ids.push((id, statement));
        }
        if with_ids.is_empty() {
            return Ok(Resolution::default());
        }

        let ids: Vec<StatementId> = with_ids.iter().map(|(id, _)| *id).collect();
        let stored: HashMap<StatementId, Statement> = adapter
            .lookup_by_ids(&ids)
            .await?
            .into_iter()
            .filter_map(|statement| statement.id.map(|id| (id, statement)))
            .collect();

        let mut decisions = Vec::with_capacity(with_ids.len());
        for (id, statement) in with_ids {
            match stored.get(&id) {
                None => decisions.push(Decision::Insert(statement)),
                Some(existing) if self.policy.equivalent(&statement, existing)? => {
                    decisions.push(Decision::AlreadyStored(id));
                },
                Some(_) => {
                    warn!(%id, "Submitted statement conflicts with stored statement");
                    return Err(StoreError::conflict(id));
                },
            }
        }

        let resolution = Resolution { decisions };
        debug!(
            to_insert = resolution.insert_count(),
            already_stored = stored.len(),
            "Resolved statement identities"
        );
        Ok(resolution)
    }
}

/// Outcome of re-checking a chunk whose insert hit a stored id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Statements still missing from the store, in chunk order.
    pub remaining: Vec<Statement>,
    /// Ids stored meanwhile with equivalent content.
    pub already_stored: Vec<StatementId>,
}

/// Re-checks statements whose insert collided with a concurrent writer.
///
/// Comparisons use the statements as submitted, before the store stamped
/// `timestamp`, `stored` or `authority` on them.
#[derive(Debug, Clone)]
pub struct ConflictReconciler {
    resolver: IdentityResolver,
    submitted: Arc<HashMap<StatementId, Statement>>,
}

impl ConflictReconciler {
    /// Creates a reconciler for a batch of submitted statements.
    ///
    /// Statements without an id are ignored.
    #[must_use]
    pub fn new(resolver: IdentityResolver, submitted: impl IntoIterator<Item = Statement>) -> Self {
        let submitted = submitted
            .into_iter()
            .filter_map(|statement| statement.id.map(|id| (id, statement)))
            .collect();
        Self { resolver, submitted: Arc::new(submitted) }
    }

    /// Splits `chunk` into statements still to insert and ids already
    /// stored with equivalent content.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if a stored statement differs from the submitted one
    /// - any error from [`BackendAdapter::lookup_by_ids`]
    #[tracing::instrument(skip_all, fields(adapter = adapter.name(), chunk = chunk.len()))]
    pub async fn reconcile(
        &self,
        adapter: &dyn BackendAdapter,
        chunk: Vec<Statement>,
    ) -> StoreResult<Reconciliation> {
        let ids: Vec<StatementId> = chunk.iter().filter_map(|s| s.id).collect();
        let stored: HashMap<StatementId, Statement> = adapter
            .lookup_by_ids(&ids)
            .await?
            .into_iter()
            .filter_map(|statement| statement.id.map(|id| (id, statement)))
            .collect();

        let mut reconciliation = Reconciliation::default();
        for statement in chunk {
            let Some(existing) = statement.id.and_then(|id| stored.get(&id)) else {
                reconciliation.remaining.push(statement);
                continue;
            };
            let Some(id) = existing.id else {
                continue;
            };
            let submitted = self.submitted.get(&id).unwrap_or(&statement);
            if !self.resolver.policy.equivalent(submitted, existing)? {
                warn!(%id, "Concurrently stored statement conflicts with submitted one");
                return Err(StoreError::conflict(id));
            }
            reconciliation.already_stored.push(id);
        }
        debug!(
            remaining = reconciliation.remaining.len(),
            already_stored = reconciliation.already_stored.len(),
            "Reconciled chunk after insert conflict"
        );
        Ok(reconciliation)
    }
}
