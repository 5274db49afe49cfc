//! In-memory backend adapter.
//!
//! This module provides [`MemoryAdapter`], an in-memory implementation of
//! [`BackendAdapter`] suitable for tests, development and as the reference
//! against which other adapters are checked.
//!
//! # Features
//!
//! - **Thread-safe**: uses [`parking_lot::RwLock`] for concurrent access
//! - **Stored order**: statements are kept in a [`BTreeMap`] keyed by an
//!   insertion sequence, so `stored` ordering and cursors are stable
//! - **Atomic chunks**: `insert_page` checks every id before inserting any
//! - **Voiding-aware**: statements voided by a stored voiding statement are
//!   hidden from ordinary queries and only returned by `voided_statement_id`
//!
//! # Cursors
//!
//! A cursor is `m<seq>`, the sequence number of the last statement of the
//! previous page. Cursors stay valid while new statements are inserted.
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;
use fail::fail_point;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{
    adapter::BackendAdapter,
    error::{ConfigError, StoreError, StoreResult},
    health::{Health, HealthMetadata},
    query::{Cursor, Page, StatementQuery},
    statement::{Statement, StatementId},
};

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<u64, Statement>,
    index: HashMap<StatementId, u64>,
    voided: HashSet<StatementId>,
    next_seq: u64,
}

impl MemoryState {
    fn is_visible(&self, seq: u64, statement: &Statement, query: &StatementQuery) -> bool {
        let Some(id) = statement.id else {
            return false;
        };
        let voided = self.voided.contains(&id);
        if let Some(wanted) = query.voided_statement_id {
            return wanted == id && voided;
        }
        if voided {
            return false;
        }
        if let Some(wanted) = query.statement_id {
            return wanted == id;
        }
        if let Some(since) = query.since
            && statement.stored.is_none_or(|stored| stored <= since)
        {
            return false;
        }
        if let Some(until) = query.until
            && statement.stored.is_none_or(|stored| stored > until)
        {
            return false;
        }
        trace!(seq, %id, "Checking content filters");
        query.matches_content(statement)
    }
}

/// In-memory statement store.
///
/// # Cloning
///
/// `MemoryAdapter` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying statements.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryAdapter {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored statements, voided ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns `true` if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Returns the stored copy of a statement, voided or not.
    #[must_use]
    pub fn get(&self, id: &StatementId) -> Option<Statement> {
        let state = self.state.read();
        state.index.get(id).and_then(|seq| state.entries.get(seq)).cloned()
    }

    fn parse_cursor(cursor: &Cursor) -> StoreResult<u64> {
        cursor
            .as_str()
            .strip_prefix('m')
            .and_then(|seq| seq.parse().ok())
            .ok_or_else(|| StoreError::serialization(format!("invalid memory cursor `{cursor}`")))
    }
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_page(
        &self,
        query: &StatementQuery,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> StoreResult<Page> {
        ConfigError::require_positive("page_size", page_size)?;
        let after = cursor.map(Self::parse_cursor).transpose()?;

        let state = self.state.read();
        let range = match (after, query.ascending) {
            (None, _) => (Bound::Unbounded, Bound::Unbounded),
            (Some(seq), true) => (Bound::Excluded(seq), Bound::Unbounded),
            (Some(seq), false) => (Bound::Unbounded, Bound::Excluded(seq)),
        };
        let candidates = state.entries.range(range);
        let matching: Box<dyn Iterator<Item = (&u64, &Statement)>> = if query.ascending {
            Box::new(candidates)
        } else {
            Box::new(candidates.rev())
        };

        let mut statements = Vec::with_capacity(page_size.min(state.entries.len()));
        let mut last_seq = None;
        let mut more = None;
        for (seq, statement) in matching {
            if !state.is_visible(*seq, statement, query) {
                continue;
            }
            if statements.len() == page_size {
                more = last_seq.map(|last| Cursor::new(format!("m{last}")));
                break;
            }
            statements.push(query.format.apply(statement.clone()));
            last_seq = Some(*seq);
        }

        debug!(returned = statements.len(), has_more = more.is_some(), "Fetched memory page");
        Ok(Page { statements, more })
    }

    async fn insert_page(&self, statements: Vec<Statement>) -> StoreResult<usize> {
        fail_point!("memory-before-insert", |_| {
            Err(StoreError::backend_unavailable("injected failure before memory insert"))
        });

        let mut state = self.state.write();
        let mut ids = HashSet::with_capacity(statements.len());
        for statement in &statements {
            let Some(id) = statement.id else {
                return Err(StoreError::validation("statement inserted without an id"));
            };
            if state.index.contains_key(&id) || !ids.insert(id) {
                return Err(StoreError::conflict(id));
            }
        }

        let inserted = statements.len();
        for mut statement in statements {
            if statement.stored.is_none() {
                statement.stored = Some(Utc::now());
            }
            if let Some(target) = statement.voided_target()
                && state.index.contains_key(&target)
            {
                state.voided.insert(target);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            if let Some(id) = statement.id {
                state.index.insert(id, seq);
            }
            state.entries.insert(seq, statement);
        }
        debug!(inserted, total = state.entries.len(), "Inserted memory page");
        Ok(inserted)
    }

    async fn lookup_by_ids(&self, ids: &[StatementId]) -> StoreResult<Vec<Statement>> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.index.get(id))
            .filter_map(|seq| state.entries.get(seq))
            .cloned()
            .collect())
    }

    async fn health_probe(&self) -> StoreResult<Health> {
        let start = Instant::now();
        let state = self.state.read();
        let metadata = HealthMetadata::new(start.elapsed(), "memory")
            .with_detail("statement_count", state.entries.len().to_string())
            .with_detail("voided_count", state.voided.len().to_string());
        Ok(Health::healthy(metadata))
    }
}
