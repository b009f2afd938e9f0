//! Conformance test suite for [`TableService`] implementations.
//!
//! Every backend runs the same checks so the typed layer can rely on one
//! contract. Each function uses its own table, so the whole suite can run
//! against a single service instance.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call [`run_all`], or individual
//! functions for finer-grained tests:
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudtable_storage::{MemoryTableService, conformance};
//!
//! #[tokio::test]
//! async fn memory_service_conformance() {
//!     conformance::run_all(Arc::new(MemoryTableService::new())).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Table | create/delete idempotency |
//! | CRUD | insert/replace/upsert/delete/retrieve semantics and error kinds |
//! | Version | token freshness and conditional writes |
//! | Query | ordering, paging, filters, projections |
//! | Batch | atomic entity-group transactions |
//! | Concurrent | one winner for racing conditional writes |

use std::sync::Arc;

use crate::{
    assert_already_exists, assert_conflict, assert_not_found,
    error::{StorageError, StorageResult},
    query::{Filter, TableQuery},
    service::{
        BatchOperation, DynamicEntity, ETag, MAX_BATCH_SIZE, TableService, VersionCondition,
    },
};

/// Reads every page of `query`.
///
/// # Errors
///
/// Propagates the first segment failure.
pub async fn collect_all<S: TableService + ?Sized>(
    service: &S,
    table: &str,
    query: &TableQuery,
) -> StorageResult<Vec<DynamicEntity>> {
    let mut rows = Vec::new();
    let mut continuation = None;
    loop {
        let segment = service.query_segment(table, query, continuation.as_ref()).await?;
        rows.extend(segment.entities);
        match segment.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(rows),
        }
    }
}

async fn fresh_table<S: TableService + ?Sized>(service: &S, table: &str) {
    service.delete_table(table).await.expect("reset table");
    assert!(service.create_table_if_not_exists(table).await.expect("create table"));
}

fn row(pk: &str, rk: &str, n: i32) -> DynamicEntity {
    DynamicEntity::new(pk, rk).with_property("N", n).with_property("Label", format!("{pk}-{rk}"))
}

// ============================================================================
// Table
// ============================================================================

/// Creating an existing table reports `false` and keeps its rows.
pub async fn table_create_is_idempotent<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "conftablecreate").await;
    service.insert("conftablecreate", row("p", "r", 1)).await.expect("insert");
    assert!(!service.create_table_if_not_exists("conftablecreate").await.expect("recreate"));
    let kept = service.retrieve("conftablecreate", "p", "r").await.expect("retrieve");
    assert!(kept.is_some(), "recreating a table must not drop rows");
}

/// Deleting reports whether the table existed.
pub async fn table_delete_reports_existence<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "conftabledelete").await;
    assert!(service.delete_table("conftabledelete").await.expect("delete"));
    assert!(!service.delete_table("conftabledelete").await.expect("second delete"));
}

// ============================================================================
// CRUD
// ============================================================================

/// `insert` then `retrieve` returns the properties, a token and a timestamp.
pub async fn crud_insert_then_retrieve<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confinsert").await;
    let etag = service.insert("confinsert", row("p", "r", 7)).await.expect("insert");

    let stored = service.retrieve("confinsert", "p", "r").await.expect("retrieve").expect("row");
    assert_eq!(stored.etag.as_ref(), Some(&etag));
    assert!(stored.timestamp.is_some(), "service must stamp a timestamp");
    assert_eq!(stored.properties, row("p", "r", 7).properties);
}

/// `retrieve` of a missing row is `Ok(None)`.
pub async fn crud_retrieve_missing_returns_none<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confmissing").await;
    let result = service.retrieve("confmissing", "p", "ghost").await;
    assert!(matches!(result, Ok(None)), "missing row should be None, got: {result:?}");
}

/// `insert` of an existing row fails with `AlreadyExists`.
pub async fn crud_insert_existing_fails<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confdupe").await;
    service.insert("confdupe", row("p", "r", 1)).await.expect("insert");
    assert_already_exists!(service.insert("confdupe", row("p", "r", 2)).await);
}

/// `replace` and `delete` of a missing row fail with `NotFound`.
pub async fn crud_missing_row_writes_fail<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confnorow").await;
    assert_not_found!(
        service.replace("confnorow", row("p", "r", 1), VersionCondition::Any).await
    );
    assert_not_found!(service.delete("confnorow", "p", "r", VersionCondition::Any).await);
}

/// Operations on a table that does not exist fail with `NotFound`.
pub async fn crud_missing_table_fails<S: TableService + ?Sized>(service: &S) {
    service.delete_table("confnotable").await.expect("ensure absent");
    assert_not_found!(service.insert("confnotable", row("p", "r", 1)).await);
    assert_not_found!(service.retrieve("confnotable", "p", "r").await);
    assert_not_found!(service.query_segment("confnotable", &TableQuery::all(), None).await);
}

/// `insert_or_replace` creates and then overwrites.
pub async fn crud_insert_or_replace_upserts<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confupsert").await;
    service.insert_or_replace("confupsert", row("p", "r", 1)).await.expect("create");
    service.insert_or_replace("confupsert", row("p", "r", 2)).await.expect("overwrite");
    let stored = service.retrieve("confupsert", "p", "r").await.expect("retrieve").expect("row");
    assert_eq!(stored.properties.get("N"), Some(&2_i32.into()));
}

/// `delete` removes the row.
pub async fn crud_delete_removes_row<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confdelete").await;
    service.insert("confdelete", row("p", "r", 1)).await.expect("insert");
    service.delete("confdelete", "p", "r", VersionCondition::Any).await.expect("delete");
    assert_eq!(service.retrieve("confdelete", "p", "r").await.expect("retrieve"), None);
}

// ============================================================================
// Version tokens
// ============================================================================

/// Every write issues a different token.
pub async fn version_changes_on_every_write<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confversion").await;
    let first = service.insert("confversion", row("p", "r", 1)).await.expect("insert");
    let second = service
        .replace("confversion", row("p", "r", 2), VersionCondition::Matches(first.clone()))
        .await
        .expect("replace");
    let third = service.insert_or_replace("confversion", row("p", "r", 3)).await.expect("upsert");
    assert_ne!(first, second);
    assert_ne!(second, third);
}

/// A stale token makes `replace` and `delete` fail with `Conflict`.
pub async fn version_stale_token_conflicts<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confstale").await;
    let original = service.insert("confstale", row("p", "r", 1)).await.expect("insert");
    service
        .replace("confstale", row("p", "r", 2), VersionCondition::Matches(original.clone()))
        .await
        .expect("first replace");

    let stale = VersionCondition::Matches(original);
    assert_conflict!(service.replace("confstale", row("p", "r", 3), stale.clone()).await);
    assert_conflict!(service.delete("confstale", "p", "r", stale).await);

    let stored = service.retrieve("confstale", "p", "r").await.expect("retrieve").expect("row");
    assert_eq!(stored.properties.get("N"), Some(&2_i32.into()), "stale write must not apply");
}

/// The wildcard condition applies regardless of the stored version.
pub async fn version_wildcard_applies<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confwildcard").await;
    service.insert("confwildcard", row("p", "r", 1)).await.expect("insert");
    service
        .replace("confwildcard", row("p", "r", 2), VersionCondition::from_etag(ETag::wildcard()))
        .await
        .expect("wildcard replace");
    service.delete("confwildcard", "p", "r", VersionCondition::Any).await.expect("delete");
}

// ============================================================================
// Query
// ============================================================================

/// Rows come back ordered by partition key then row key.
pub async fn query_rows_are_ordered<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "conforder").await;
    for (pk, rk) in [("b", "1"), ("a", "2"), ("a", "1"), ("c", "0")] {
        service.insert("conforder", row(pk, rk, 0)).await.expect("insert");
    }
    let rows = collect_all(service, "conforder", &TableQuery::all()).await.expect("query");
    let keys: Vec<(&str, &str)> =
        rows.iter().map(|r| (r.partition_key.as_str(), r.row_key.as_str())).collect();
    assert_eq!(keys, vec![("a", "1"), ("a", "2"), ("b", "1"), ("c", "0")]);
}

/// Following continuations visits every row exactly once.
pub async fn query_pages_cover_all_rows<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confpages").await;
    for i in 0..25 {
        service.insert("confpages", row("p", &format!("{i:03}"), i)).await.expect("insert");
    }
    let query = TableQuery::builder().take(7).build();

    let mut pages = 0;
    let mut seen = Vec::new();
    let mut continuation = None;
    loop {
        let segment =
            service.query_segment("confpages", &query, continuation.as_ref()).await.expect("page");
        assert!(segment.entities.len() <= 7, "page exceeds take");
        pages += 1;
        seen.extend(segment.entities.into_iter().map(|r| r.row_key));
        match segment.continuation {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }
    assert!(pages >= 4, "25 rows at 7 per page need at least 4 pages, got {pages}");
    let expected: Vec<String> = (0..25).map(|i| format!("{i:03}")).collect();
    assert_eq!(seen, expected);
}

/// Filters select the matching rows only.
pub async fn query_filter_selects_rows<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "conffilter").await;
    for (pk, n) in [("x", 1), ("x", 5), ("y", 9)] {
        service.insert("conffilter", row(pk, &n.to_string(), n)).await.expect("insert");
    }
    let query = TableQuery::filtered(Filter::partition("x").and(Filter::gt("N", 2_i32)));
    let rows = collect_all(service, "conffilter", &query).await.expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_key, "5");
}

/// Projections drop unselected properties but keep keys and timestamp.
pub async fn query_projection_keeps_keys<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confselect").await;
    service.insert("confselect", row("p", "r", 3)).await.expect("insert");
    let query = TableQuery::builder().select(vec!["N".to_owned()]).build();
    let rows = collect_all(service, "confselect", &query).await.expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].partition_key, "p");
    assert_eq!(rows[0].row_key, "r");
    assert!(rows[0].timestamp.is_some());
    assert!(rows[0].properties.contains_key("N"));
    assert!(!rows[0].properties.contains_key("Label"));
}

// ============================================================================
// Batch
// ============================================================================

/// A valid batch applies every operation and returns one result each.
pub async fn batch_applies_all<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confbatch").await;
    service.insert("confbatch", row("p", "gone", 0)).await.expect("seed");
    let ops = vec![
        BatchOperation::Insert(row("p", "a", 1)),
        BatchOperation::InsertOrReplace(row("p", "b", 2)),
        BatchOperation::Delete { row_key: "gone".into(), condition: VersionCondition::Any },
    ];
    let results = service.execute_batch("confbatch", "p", ops).await.expect("batch");
    assert_eq!(results.len(), 3);
    assert!(results[0].is_some() && results[1].is_some());
    assert!(results[2].is_none());

    let rows = collect_all(service, "confbatch", &TableQuery::all()).await.expect("query");
    let keys: Vec<&str> = rows.iter().map(|r| r.row_key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);
}

/// A failing operation leaves the whole batch unapplied.
pub async fn batch_is_atomic<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "confatomic").await;
    service.insert("confatomic", row("p", "taken", 0)).await.expect("seed");
    let ops = vec![
        BatchOperation::Insert(row("p", "new", 1)),
        BatchOperation::Insert(row("p", "taken", 1)),
    ];
    assert_already_exists!(service.execute_batch("confatomic", "p", ops).await);
    assert_eq!(service.retrieve("confatomic", "p", "new").await.expect("retrieve"), None);
}

/// More than [`MAX_BATCH_SIZE`] operations are rejected up front.
pub async fn batch_over_limit_rejected<S: TableService + ?Sized>(service: &S) {
    fresh_table(service, "conflimit").await;
    let ops: Vec<BatchOperation> = (0..=MAX_BATCH_SIZE)
        .map(|i| BatchOperation::Insert(row("p", &format!("{i:03}"), 0)))
        .collect();
    let result = service.execute_batch("conflimit", "p", ops).await;
    assert!(
        matches!(result, Err(StorageError::Config(_))),
        "expected Config error, got {result:?}"
    );
    assert_eq!(service.retrieve("conflimit", "p", "000").await.expect("retrieve"), None);
}

// ============================================================================
// Concurrent
// ============================================================================

/// Racing conditional replaces on one token produce exactly one winner.
pub async fn concurrent_conditional_replace_one_winner<S: TableService + 'static>(
    service: Arc<S>,
) {
    fresh_table(service.as_ref(), "confrace").await;
    let etag = service.insert("confrace", row("p", "r", 0)).await.expect("insert");

    let mut handles = Vec::new();
    for i in 1..=10 {
        let service = Arc::clone(&service);
        let condition = VersionCondition::Matches(etag.clone());
        handles.push(tokio::spawn(async move {
            service.replace("confrace", row("p", "r", i), condition).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task join") {
            Ok(_) => successes += 1,
            Err(StorageError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one conditional writer should win");
    assert_eq!(conflicts, 9);
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Runs the full conformance suite against one service.
pub async fn run_all<S: TableService + 'static>(service: Arc<S>) {
    let s = service.as_ref();

    table_create_is_idempotent(s).await;
    table_delete_reports_existence(s).await;

    crud_insert_then_retrieve(s).await;
    crud_retrieve_missing_returns_none(s).await;
    crud_insert_existing_fails(s).await;
    crud_missing_row_writes_fail(s).await;
    crud_missing_table_fails(s).await;
    crud_insert_or_replace_upserts(s).await;
    crud_delete_removes_row(s).await;

    version_changes_on_every_write(s).await;
    version_stale_token_conflicts(s).await;
    version_wildcard_applies(s).await;

    query_rows_are_ordered(s).await;
    query_pages_cover_all_rows(s).await;
    query_filter_selects_rows(s).await;
    query_projection_keeps_keys(s).await;

    batch_applies_all(s).await;
    batch_is_atomic(s).await;
    batch_over_limit_rejected(s).await;

    concurrent_conditional_replace_one_winner(Arc::clone(&service)).await;
}
