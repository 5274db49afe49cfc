//! Shared test utilities for adapter and store testing.
//!
//! This module provides statement fixtures, an [`InstrumentedAdapter`] that
//! counts calls and injects failures, and assertion macros for
//! [`StoreResult`] values. It is feature-gated behind `testutil` to prevent
//! leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! lrs-store = { path = "../store", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use lrs_store::testutil::{InstrumentedAdapter, make_statements};
//! ```

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Barrier;

use crate::{
    adapter::BackendAdapter,
    error::{StoreError, StoreResult},
    health::Health,
    memory::MemoryAdapter,
    query::{Cursor, Page, StatementQuery},
    statement::{Statement, StatementId},
};

/// Create a statement with a fresh id whose actor is derived from `idx`.
///
/// Produces actors like `mailto:learner000042@example.com` so statements can
/// be told apart in assertions.
#[must_use]
pub fn make_statement(idx: usize) -> Statement {
    Statement::new(
        json!({"objectType": "Agent", "mbox": format!("mailto:learner{idx:06}@example.com")}),
        json!({"id": "http://adlnet.gov/expapi/verbs/experienced"}),
        json!({"objectType": "Activity", "id": format!("http://example.com/activities/{idx}")}),
    )
    .with_id(StatementId::new_v4())
}

/// Create `count` statements with [`make_statement`].
#[must_use]
pub fn make_statements(count: usize) -> Vec<Statement> {
    (0..count).map(make_statement).collect()
}

/// Returns a copy of `statement` with a different actor, so it conflicts
/// with the original under any equivalence policy.
#[must_use]
pub fn with_other_actor(statement: &Statement) -> Statement {
    let mut other = statement.clone();
    other.actor = json!({"objectType": "Agent", "mbox": "mailto:impostor@example.com"});
    other
}

/// Ids of `statements` in order, panicking on a statement without one.
///
/// # Panics
///
/// Panics if a statement has no id.
#[must_use]
#[allow(clippy::expect_used)]
pub fn ids_of(statements: &[Statement]) -> Vec<StatementId> {
    statements.iter().map(|s| s.id.expect("fixture statement without id")).collect()
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`MemoryAdapter`] wrapper that records calls and injects failures.
///
/// - counts `fetch_page`, `insert_page` and `lookup_by_ids` calls
/// - tracks peak concurrent `insert_page` calls
/// - delays inserts or fetches, or holds lookups at a barrier, to widen
///   race windows
/// - fails selected fetch calls, inserts touching selected ids, or the
///   health probe
#[derive(Default)]
pub struct InstrumentedAdapter {
    inner: MemoryAdapter,
    fetch_calls: AtomicUsize,
    insert_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    inserts_in_flight: AtomicUsize,
    peak_inserts: AtomicUsize,
    page_sizes: Mutex<Vec<usize>>,
    insert_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
    failing_fetch_calls: Mutex<HashSet<usize>>,
    poisoned_ids: Mutex<HashSet<StatementId>>,
    lookup_gate: Mutex<Option<(Arc<Barrier>, usize)>>,
    unreachable: AtomicBool,
}

impl InstrumentedAdapter {
    /// Creates an adapter over an empty [`MemoryAdapter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped adapter, for seeding and inspection without instrumentation.
    #[must_use]
    pub fn inner(&self) -> &MemoryAdapter {
        &self.inner
    }

    /// Sleeps for `delay` inside every `insert_page` call.
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock() = delay;
    }

    /// Sleeps for `delay` inside every `fetch_page` call.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    /// Makes the `n`th (zero-based) `fetch_page` call fail once.
    pub fn fail_fetch_call(&self, n: usize) {
        self.failing_fetch_calls.lock().insert(n);
    }

    /// Makes every `insert_page` call containing `id` fail without inserting.
    pub fn fail_inserts_containing(&self, id: StatementId) {
        self.poisoned_ids.lock().insert(id);
    }

    /// Makes the next `calls` `lookup_by_ids` calls wait on `barrier` before
    /// reading, so that concurrent writers all pass the lookup first.
    pub fn gate_lookups(&self, barrier: Arc<Barrier>, calls: usize) {
        *self.lookup_gate.lock() = Some((barrier, calls));
    }

    /// Makes the health probe fail as if the engine could not be contacted.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `fetch_page` calls so far.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `insert_page` calls so far.
    #[must_use]
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of `lookup_by_ids` calls so far.
    #[must_use]
    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `insert_page` calls observed running at once.
    #[must_use]
    pub fn peak_concurrent_inserts(&self) -> usize {
        self.peak_inserts.load(Ordering::SeqCst)
    }

    /// Page sizes requested by each `fetch_page` call, in call order.
    #[must_use]
    pub fn requested_page_sizes(&self) -> Vec<usize> {
        self.page_sizes.lock().clone()
    }
}

#[async_trait]
impl BackendAdapter for InstrumentedAdapter {
    fn name(&self) -> &str {
        "instrumented"
    }

    async fn fetch_page(
        &self,
        query: &StatementQuery,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> StoreResult<Page> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.page_sizes.lock().push(page_size);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_fetch_calls.lock().remove(&call) {
            return Err(StoreError::backend_unavailable(format!("injected failure on fetch {call}")));
        }
        self.inner.fetch_page(query, cursor, page_size).await
    }

    async fn insert_page(&self, statements: Vec<Statement>) -> StoreResult<usize> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.inserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.inserts_in_flight);
        self.peak_inserts.fetch_max(current, Ordering::SeqCst);

        let delay = *self.insert_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let poisoned = {
            let poisoned = self.poisoned_ids.lock();
            statements.iter().filter_map(|s| s.id).find(|id| poisoned.contains(id))
        };
        if let Some(id) = poisoned {
            return Err(StoreError::backend_unavailable(format!("injected insert failure for {id}")));
        }
        self.inner.insert_page(statements).await
    }

    async fn lookup_by_ids(&self, ids: &[StatementId]) -> StoreResult<Vec<Statement>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let gate = match self.lookup_gate.lock().as_mut() {
            Some((barrier, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(Arc::clone(barrier))
            },
            _ => None,
        };
        if let Some(barrier) = gate {
            barrier.wait().await;
        }
        self.inner.lookup_by_ids(ids).await
    }

    async fn health_probe(&self) -> StoreResult<Health> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::backend_unavailable("injected unreachable engine"));
        }
        self.inner.health_probe().await
    }
}

/// Assert that a [`StoreResult`] is a [`StoreError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use lrs_store::{assert_conflict, StatementId, StoreError, StoreResult};
///
/// let result: StoreResult<()> = Err(StoreError::conflict(StatementId::new_v4()));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::StoreError::Conflict { .. })),
            "expected StoreError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::StoreError::Conflict { .. })),
            "{}: expected StoreError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StoreResult`] is a [`StoreError::Parameter`].
#[macro_export]
macro_rules! assert_parameter_error {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::StoreError::Parameter(_))),
            "expected StoreError::Parameter, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StoreResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
#[macro_export]
macro_rules! assert_store_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StoreError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StoreError: {e:?}", $msg),
        }
    };
}
