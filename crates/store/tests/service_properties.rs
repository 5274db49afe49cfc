//! End-to-end properties of the statement store.
//!
//! Exercises the façade over the memory adapter the way the statements
//! resource uses it: idempotent re-submission, conflict handling, batch
//! atomicity and complete pagination.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc};

use lrs_store::{
    ErrorKind, MemoryAdapter, ReadOptions, StatementQuery, StatementStore, StoreConfig,
    WriteContext, WriteOptions, assert_conflict,
    testutil::{ids_of, make_statement, make_statements, with_other_actor},
};

fn store_with(adapter: &MemoryAdapter, write: WriteOptions) -> StatementStore {
    let config = StoreConfig::builder().write(write).build().unwrap();
    StatementStore::new(Arc::new(adapter.clone()), config).unwrap()
}

fn store(adapter: &MemoryAdapter) -> StatementStore {
    store_with(adapter, WriteOptions::default())
}

// ---------------------------------------------------------------------------
// Idempotence and conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_resubmit_and_conflict_sequence() {
    let adapter = MemoryAdapter::new();
    let store = store_with(
        &adapter,
        WriteOptions::builder().chunk_size(1).concurrency(2).build().unwrap(),
    );
    let a = make_statement(0);
    let b = make_statement(1);
    let a_id = a.id.unwrap();

    let ids = store.write(vec![a.clone(), b.clone()], &WriteContext::new()).await.unwrap();
    assert_eq!(ids, vec![a_id, b.id.unwrap()]);

    let ids = store.write(vec![a.clone()], &WriteContext::new()).await.unwrap();
    assert!(ids.is_empty(), "re-submitting A is a no-op");

    let result = store.write(vec![with_other_actor(&a)], &WriteContext::new()).await;
    assert_conflict!(result);
    assert_eq!(result.unwrap_err().kind().http_status(), 409);

    let page = store.read(&StatementQuery::by_id(a_id), None, None).await.unwrap();
    assert_eq!(page.statements.len(), 1);
    assert_eq!(page.statements[0].actor, a.actor, "the original copy is kept");
    assert_eq!(adapter.len(), 2);
}

#[tokio::test]
async fn resubmitting_whole_batch_inserts_nothing() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let batch = make_statements(10);

    store.write(batch.clone(), &WriteContext::new()).await.unwrap();
    let ids = store.write(batch, &WriteContext::new()).await.unwrap();

    assert!(ids.is_empty());
    assert_eq!(adapter.len(), 10);
}

#[tokio::test]
async fn partially_stored_batch_inserts_only_new_statements() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let batch = make_statements(4);
    store.write(vec![batch[1].clone()], &WriteContext::new()).await.unwrap();

    let ids = store.write(batch.clone(), &WriteContext::new()).await.unwrap();

    let expected = ids_of(&batch);
    assert_eq!(ids, vec![expected[0], expected[2], expected[3]]);
}

#[tokio::test]
async fn put_reports_whether_it_inserted() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let statement = make_statement(0);
    let id = statement.id.unwrap();

    assert!(store.put(id, statement.clone(), &WriteContext::new()).await.unwrap());
    assert!(!store.put(id, statement.clone(), &WriteContext::new()).await.unwrap());
    let result = store.put(id, with_other_actor(&statement), &WriteContext::new()).await;
    assert_conflict!(result);
}

// ---------------------------------------------------------------------------
// Batch atomicity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_in_batch_writes_nothing() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let mut batch = make_statements(3);
    batch.push(batch[0].clone());

    let err = store.write(batch, &WriteContext::new()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DuplicateInBatch);
    assert!(adapter.is_empty());
}

#[tokio::test]
async fn conflict_anywhere_in_batch_writes_nothing() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let stored = make_statement(0);
    store.write(vec![stored.clone()], &WriteContext::new()).await.unwrap();

    let mut batch = make_statements(5);
    batch.insert(3, with_other_actor(&stored));
    let result = store.write(batch.clone(), &WriteContext::new()).await;
    assert_conflict!(result);

    for statement in &batch {
        if statement.id != stored.id {
            assert!(adapter.get(&statement.id.unwrap()).is_none());
        }
    }
    assert_eq!(adapter.len(), 1);
}

#[tokio::test]
async fn invalid_write_options_fail_before_any_adapter_call() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let options: WriteOptions =
        serde_json::from_value(serde_json::json!({"concurrency": 0})).unwrap();

    let err = store
        .write(make_statements(2), &WriteContext::new().with_options(options))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert!(adapter.is_empty());
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reader_yields_every_statement_once_at_any_prefetch_depth() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    let batch = make_statements(57);
    store.write(batch.clone(), &WriteContext::new()).await.unwrap();
    let expected: HashSet<_> = ids_of(&batch).into_iter().collect();

    for prefetch in [0, 1, 3, 8] {
        let options = ReadOptions::builder().page_size(10).prefetch(prefetch).build().unwrap();
        let read = store
            .reader(StatementQuery::default(), None, &options)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        let ids = ids_of(&read);
        assert_eq!(ids.len(), 57, "prefetch {prefetch} returned duplicates or gaps");
        assert_eq!(ids.into_iter().collect::<HashSet<_>>(), expected);
    }
}

#[tokio::test]
async fn read_follows_more_cursor_to_the_end() {
    let adapter = MemoryAdapter::new();
    let store = store(&adapter);
    store.write(make_statements(25), &WriteContext::new()).await.unwrap();

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page =
            store.read(&StatementQuery::default(), cursor.as_ref(), Some(10)).await.unwrap();
        assert!(page.statements.len() <= 10);
        seen.extend(ids_of(&page.statements));
        match page.more {
            Some(more) => cursor = Some(more),
            None => break,
        }
    }
    assert_eq!(seen.len(), 25);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 25);
}

#[tokio::test]
async fn read_limit_is_clamped_to_server_maximum() {
    let adapter = MemoryAdapter::new();
    let config = StoreConfig::builder().max_read_limit(5).build().unwrap();
    let store = StatementStore::new(Arc::new(adapter.clone()), config).unwrap();
    store.write(make_statements(8), &WriteContext::new()).await.unwrap();

    let page = store.read(&StatementQuery::default(), None, Some(50)).await.unwrap();
    assert_eq!(page.statements.len(), 5);
    assert!(page.more.is_some());

    let page = store.read(&StatementQuery::default(), None, Some(0)).await.unwrap();
    assert_eq!(page.statements.len(), 5);
}
