//! Conformance test suite for [`BackendAdapter`] implementations.
//!
//! This module provides async check functions that validate whether an
//! adapter satisfies the [`BackendAdapter`] contract. The memory adapter,
//! the remote LRS adapter and any third-party adapter run the same suite so
//! the reader, writer and identity resolver behave identically over them.
//!
//! Every check scopes its data to a freshly generated activity IRI or to
//! fresh statement ids, so checks can share one adapter instance.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each check with an adapter:
//!
//! ```no_run
//! use lrs_store::{MemoryAdapter, conformance};
//!
//! #[tokio::test]
//! async fn fetch_pages_cover_every_statement() {
//!     conformance::fetch_pages_cover_every_statement(&MemoryAdapter::new()).await;
//! }
//! ```
//!
//! # Check Categories
//!
//! | Category | Functions | Contract aspect |
//! |----------|-----------|-----------------|
//! | Fetch | 4 checks | Filtering, page size, cursor walk, ordering |
//! | Insert | 3 checks | Counts, id collisions, chunk atomicity |
//! | Lookup | 3 checks | Batched id lookup, voided statements |
//! | Health | 1 check | Probe reports the adapter |
//! | Concurrent | 1 check | Parallel inserts of distinct ids |

use std::{collections::HashSet, sync::Arc};

use serde_json::json;
use uuid::Uuid;

use crate::{
    adapter::BackendAdapter,
    error::StoreError,
    query::{Cursor, StatementQuery},
    statement::{Statement, StatementId, VOIDED_VERB},
    testutil::{ids_of, make_statement},
};

/// Statements whose object is a fresh activity, plus a query selecting exactly them.
fn scoped(count: usize) -> (StatementQuery, Vec<Statement>) {
    let activity = format!("http://example.com/conformance/{}", Uuid::new_v4());
    let statements = (0..count)
        .map(|idx| {
            let mut statement = make_statement(idx);
            statement.object = json!({"objectType": "Activity", "id": activity});
            statement
        })
        .collect();
    let query = StatementQuery { activity: Some(activity), ..StatementQuery::default() };
    (query, statements)
}

async fn walk<A: BackendAdapter + ?Sized>(
    adapter: &A,
    query: &StatementQuery,
    page_size: usize,
) -> Vec<Vec<StatementId>> {
    let mut pages = Vec::new();
    let mut cursor: Option<Cursor> = None;
    loop {
        let page =
            adapter.fetch_page(query, cursor.as_ref(), page_size).await.expect("fetch_page");
        assert!(
            page.statements.len() <= page_size,
            "page holds {} statements, more than the requested {page_size}",
            page.statements.len()
        );
        pages.push(ids_of(&page.statements));
        match page.more {
            Some(next) => cursor = Some(next),
            None => return pages,
        }
        assert!(pages.len() <= 1000, "cursor walk does not terminate");
    }
}

// ============================================================================
// Fetch: filtering, page size, cursor walk, ordering (4 checks)
// ============================================================================

/// A query matching nothing returns an empty final page.
pub async fn fetch_unmatched_query_is_empty_final_page<A: BackendAdapter + ?Sized>(adapter: &A) {
    let page = adapter
        .fetch_page(&StatementQuery::by_id(StatementId::new_v4()), None, 10)
        .await
        .expect("fetch_page should succeed");
    assert!(page.statements.is_empty());
    assert!(page.more.is_none(), "no continuation for an empty result");
}

/// An inserted statement can be fetched by id.
pub async fn fetch_by_id_returns_inserted<A: BackendAdapter + ?Sized>(adapter: &A) {
    let statement = make_statement(0);
    let id = statement.id.expect("fixture id");
    adapter.insert_page(vec![statement.clone()]).await.expect("insert_page");

    let page = adapter.fetch_page(&StatementQuery::by_id(id), None, 10).await.expect("fetch_page");
    assert_eq!(ids_of(&page.statements), vec![id]);
    assert_eq!(page.statements[0].actor, statement.actor);
}

/// Following cursors visits every matching statement exactly once.
pub async fn fetch_pages_cover_every_statement<A: BackendAdapter + ?Sized>(adapter: &A) {
    let (query, statements) = scoped(7);
    let expected: HashSet<_> = ids_of(&statements).into_iter().collect();
    adapter.insert_page(statements).await.expect("insert_page");

    let pages = walk(adapter, &query, 3).await;
    let seen: Vec<_> = pages.into_iter().flatten().collect();
    assert_eq!(seen.len(), expected.len(), "duplicate or missing statements: {seen:?}");
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
}

/// Ascending order is the reverse of the default (newest first) order.
pub async fn fetch_ascending_reverses_default_order<A: BackendAdapter + ?Sized>(adapter: &A) {
    let (query, statements) = scoped(4);
    for statement in statements {
        adapter.insert_page(vec![statement]).await.expect("insert_page");
    }

    let descending: Vec<_> = walk(adapter, &query, 10).await.into_iter().flatten().collect();
    let ascending_query = StatementQuery { ascending: true, ..query };
    let mut ascending: Vec<_> =
        walk(adapter, &ascending_query, 10).await.into_iter().flatten().collect();
    ascending.reverse();
    assert_eq!(ascending, descending);
}

// ============================================================================
// Insert: counts, id collisions, chunk atomicity (3 checks)
// ============================================================================

/// `insert_page` reports how many statements it inserted.
pub async fn insert_returns_count<A: BackendAdapter + ?Sized>(adapter: &A) {
    let (_, statements) = scoped(5);
    let inserted = adapter.insert_page(statements).await.expect("insert_page");
    assert_eq!(inserted, 5);
}

/// Inserting an id that is already stored fails with `Conflict`.
pub async fn insert_existing_id_conflicts<A: BackendAdapter + ?Sized>(adapter: &A) {
    let statement = make_statement(0);
    adapter.insert_page(vec![statement.clone()]).await.expect("first insert");
    let result = adapter.insert_page(vec![statement]).await;
    assert!(matches!(result, Err(StoreError::Conflict { .. })), "got {result:?}");
}

/// A chunk containing a stored id inserts none of its statements.
pub async fn insert_conflict_rejects_whole_chunk<A: BackendAdapter + ?Sized>(adapter: &A) {
    let existing = make_statement(0);
    adapter.insert_page(vec![existing.clone()]).await.expect("first insert");

    let fresh = make_statement(1);
    let fresh_id = fresh.id.expect("fixture id");
    let result = adapter.insert_page(vec![fresh, existing]).await;
    assert!(result.is_err(), "chunk with stored id should fail");
    let found = adapter.lookup_by_ids(&[fresh_id]).await.expect("lookup_by_ids");
    assert!(found.is_empty(), "no statement of a rejected chunk may be stored");
}

// ============================================================================
// Lookup: batched id lookup, voided statements (3 checks)
// ============================================================================

/// Looking up unknown ids returns nothing.
pub async fn lookup_unknown_ids_is_empty<A: BackendAdapter + ?Sized>(adapter: &A) {
    let found = adapter
        .lookup_by_ids(&[StatementId::new_v4(), StatementId::new_v4()])
        .await
        .expect("lookup_by_ids");
    assert!(found.is_empty());
}

/// Lookup returns exactly the stored subset of the requested ids.
pub async fn lookup_returns_stored_subset<A: BackendAdapter + ?Sized>(adapter: &A) {
    let (_, statements) = scoped(3);
    let ids = ids_of(&statements);
    adapter.insert_page(statements[..2].to_vec()).await.expect("insert_page");

    let found = adapter.lookup_by_ids(&ids).await.expect("lookup_by_ids");
    let found: HashSet<_> = ids_of(&found).into_iter().collect();
    assert_eq!(found, ids[..2].iter().copied().collect::<HashSet<_>>());
}

/// Voided statements stay visible to lookups.
pub async fn lookup_includes_voided<A: BackendAdapter + ?Sized>(adapter: &A) {
    let target = make_statement(0);
    let target_id = target.id.expect("fixture id");
    adapter.insert_page(vec![target]).await.expect("insert target");
    let voiding = Statement::new(
        json!({"objectType": "Agent", "mbox": "mailto:admin@example.com"}),
        json!({"id": VOIDED_VERB}),
        json!({"objectType": "StatementRef", "id": target_id.to_string()}),
    )
    .with_id(StatementId::new_v4());
    adapter.insert_page(vec![voiding]).await.expect("insert voiding statement");

    let found = adapter.lookup_by_ids(&[target_id]).await.expect("lookup_by_ids");
    assert_eq!(ids_of(&found), vec![target_id]);
}

// ============================================================================
// Health (1 check)
// ============================================================================

/// A reachable adapter reports itself healthy or degraded, never unreachable.
pub async fn health_probe_reports_adapter<A: BackendAdapter + ?Sized>(adapter: &A) {
    let health = adapter.health_probe().await.expect("health_probe");
    assert!(!health.is_unreachable(), "reachable adapter reported {health}");
    assert!(!health.metadata().backend.is_empty());
}

// ============================================================================
// Concurrent (1 check)
// ============================================================================

/// Parallel inserts of distinct ids are all stored.
pub async fn concurrent_inserts_of_distinct_ids<A: BackendAdapter + 'static>(adapter: Arc<A>) {
    let (query, statements) = scoped(40);
    let expected = ids_of(&statements).into_iter().collect::<HashSet<_>>();

    let mut tasks = tokio::task::JoinSet::new();
    for chunk in statements.chunks(5) {
        let adapter = Arc::clone(&adapter);
        let chunk = chunk.to_vec();
        tasks.spawn(async move { adapter.insert_page(chunk).await });
    }
    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.expect("insert task").expect("insert_page"), 5);
    }

    let seen: HashSet<_> = walk(adapter.as_ref(), &query, 100).await.into_iter().flatten().collect();
    assert_eq!(seen, expected);
}

/// Runs every conformance check against `adapter`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use lrs_store::{MemoryAdapter, conformance};
///
/// #[tokio::test]
/// async fn memory_adapter_conforms() {
///     conformance::run_all(Arc::new(MemoryAdapter::new())).await;
/// }
/// ```
pub async fn run_all<A: BackendAdapter + 'static>(adapter: Arc<A>) {
    // Fetch
    fetch_unmatched_query_is_empty_final_page(adapter.as_ref()).await;
    fetch_by_id_returns_inserted(adapter.as_ref()).await;
    fetch_pages_cover_every_statement(adapter.as_ref()).await;
    fetch_ascending_reverses_default_order(adapter.as_ref()).await;

    // Insert
    insert_returns_count(adapter.as_ref()).await;
    insert_existing_id_conflicts(adapter.as_ref()).await;
    insert_conflict_rejects_whole_chunk(adapter.as_ref()).await;

    // Lookup
    lookup_unknown_ids_is_empty(adapter.as_ref()).await;
    lookup_returns_stored_subset(adapter.as_ref()).await;
    lookup_includes_voided(adapter.as_ref()).await;

    // Health
    health_probe_reports_adapter(adapter.as_ref()).await;

    // Concurrent
    concurrent_inserts_of_distinct_ids(adapter).await;
}
