//! Shared test utilities for stores and table services.
//!
//! This module provides in-memory contexts, a fault-injecting
//! [`TableService`] and [`BlobService`] wrappers, row generators and assertion macros for
//! [`StorageResult`] values. It is feature-gated behind `testutil` to
//! prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! cloudtable-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use cloudtable_storage::testutil::{FlakyTableService, make_row, memory_context};
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    account::{DEVELOPMENT_CONNECTION_STRING, StorageAccount},
    blob::{
        BlobContent, BlobMetadata, BlobProperties, BlobService, ContainerAccess, MemoryBlobService,
    },
    config::StorageConfig,
    connector::StorageConnector,
    context::StorageContext,
    error::{StorageError, StorageResult},
    memory::MemoryConnector,
    query::TableQuery,
    retry::RetryConfig,
    service::{
        BatchOperation, ContinuationToken, DynamicEntity, ETag, QuerySegment, TableService,
        VersionCondition,
    },
};

/// Retry policy used by test contexts: three retries, 10 ms apart.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::builder().max_retries(3).delay(Duration::from_millis(10)).build()
}

/// A context over `connector` using development storage and [`fast_retry`].
#[must_use]
pub fn context_with(connector: Arc<dyn StorageConnector>) -> Arc<StorageContext> {
    let config = StorageConfig::builder()
        .connection_string(DEVELOPMENT_CONNECTION_STRING)
        .retry(fast_retry())
        .build();
    Arc::new(StorageContext::new(config, connector))
}

/// A context over a fresh [`MemoryConnector`].
#[must_use]
pub fn memory_context() -> Arc<StorageContext> {
    context_with(Arc::new(MemoryConnector::new()))
}

/// Create a row with partition `pk`, row key `"r{idx:06}"` and an Int32
/// property `N = idx`.
///
/// The zero-padding makes row order match numeric order.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn make_row(pk: &str, idx: usize) -> DynamicEntity {
    DynamicEntity::new(pk, format!("r{idx:06}")).with_property("N", idx as i32)
}

/// Create `table` on `service` and fill partition `pk` with `count` rows
/// from [`make_row`].
///
/// # Panics
///
/// Panics if any write fails.
pub async fn populate_table<S>(service: &S, table: &str, pk: &str, count: usize)
where
    S: TableService + ?Sized,
{
    service.create_table_if_not_exists(table).await.expect("create table failed");
    for i in 0..count {
        service.insert(table, make_row(pk, i)).await.expect("populate insert failed");
    }
}

/// [`StorageConnector`] handing out the same services for every account.
#[derive(Debug, Clone)]
pub struct FixedConnector {
    tables: Arc<dyn TableService>,
    blobs: Arc<dyn BlobService>,
}

impl FixedConnector {
    /// Serves `tables` and a fresh [`MemoryBlobService`].
    #[must_use]
    pub fn new(tables: Arc<dyn TableService>) -> Self {
        Self { tables, blobs: Arc::new(MemoryBlobService::new()) }
    }

    /// Serves `blobs` as well.
    #[must_use]
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobService>) -> Self {
        self.blobs = blobs;
        self
    }
}

impl StorageConnector for FixedConnector {
    fn table_service(&self, _account: &StorageAccount) -> StorageResult<Arc<dyn TableService>> {
        Ok(Arc::clone(&self.tables))
    }

    fn blob_service(&self, _account: &StorageAccount) -> StorageResult<Arc<dyn BlobService>> {
        Ok(Arc::clone(&self.blobs))
    }
}

/// A [`TableService`] that fails its first `failures` calls with
/// [`StorageError::Unavailable`], then delegates.
#[derive(Debug)]
pub struct FlakyTableService {
    inner: Arc<dyn TableService>,
    remaining: AtomicU32,
    calls: AtomicUsize,
}

impl FlakyTableService {
    /// Wraps `inner`, failing the next `failures` calls.
    #[must_use]
    pub fn new(inner: Arc<dyn TableService>, failures: u32) -> Self {
        Self { inner, remaining: AtomicU32::new(failures), calls: AtomicUsize::new(0) }
    }

    /// Fails the next `failures` calls.
    pub fn fail_next(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    /// Calls received so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self, operation: &str) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::unavailable(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TableService for FlakyTableService {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        self.gate("create_table_if_not_exists")?;
        self.inner.create_table_if_not_exists(table).await
    }

    async fn delete_table(&self, table: &str) -> StorageResult<bool> {
        self.gate("delete_table")?;
        self.inner.delete_table(table).await
    }

    async fn insert(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        self.gate("insert")?;
        self.inner.insert(table, entity).await
    }

    async fn replace(
        &self,
        table: &str,
        entity: DynamicEntity,
        condition: VersionCondition,
    ) -> StorageResult<ETag> {
        self.gate("replace")?;
        self.inner.replace(table, entity, condition).await
    }

    async fn insert_or_replace(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        self.gate("insert_or_replace")?;
        self.inner.insert_or_replace(table, entity).await
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        condition: VersionCondition,
    ) -> StorageResult<()> {
        self.gate("delete")?;
        self.inner.delete(table, partition_key, row_key, condition).await
    }

    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<DynamicEntity>> {
        self.gate("retrieve")?;
        self.inner.retrieve(table, partition_key, row_key).await
    }

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QuerySegment> {
        self.gate("query_segment")?;
        self.inner.query_segment(table, query, continuation).await
    }

    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        self.gate("execute_batch")?;
        self.inner.execute_batch(table, partition_key, operations).await
    }
}

/// A [`BlobService`] that fails its first `failures` calls with
/// [`StorageError::Unavailable`], then delegates.
///
/// `container_uri` is never gated.
#[derive(Debug)]
pub struct FlakyBlobService {
    inner: Arc<dyn BlobService>,
    remaining: AtomicU32,
    calls: AtomicUsize,
}

impl FlakyBlobService {
    /// Wraps `inner`, failing the next `failures` calls.
    #[must_use]
    pub fn new(inner: Arc<dyn BlobService>, failures: u32) -> Self {
        Self { inner, remaining: AtomicU32::new(failures), calls: AtomicUsize::new(0) }
    }

    /// Fails the next `failures` calls.
    pub fn fail_next(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    /// Calls received so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self, operation: &str) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::unavailable(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobService for FlakyBlobService {
    fn container_uri(&self, container: &str) -> String {
        self.inner.container_uri(container)
    }

    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: ContainerAccess,
    ) -> StorageResult<bool> {
        self.gate("create_container_if_not_exists")?;
        self.inner.create_container_if_not_exists(container, access).await
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        properties: BlobProperties,
    ) -> StorageResult<String> {
        self.gate("upload")?;
        self.inner.upload(container, name, data, properties).await
    }

    async fn download(&self, container: &str, name: &str) -> StorageResult<Option<BlobContent>> {
        self.gate("download")?;
        self.inner.download(container, name).await
    }

    async fn delete_if_exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        self.gate("delete_if_exists")?;
        self.inner.delete_if_exists(container, name).await
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        self.gate("list")?;
        self.inner.list(container, prefix).await
    }

    async fn get_metadata(&self, container: &str, name: &str) -> StorageResult<BlobMetadata> {
        self.gate("get_metadata")?;
        self.inner.get_metadata(container, name).await
    }

    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: BlobMetadata,
    ) -> StorageResult<()> {
        self.gate("set_metadata")?;
        self.inner.set_metadata(container, name, metadata).await
    }

    async fn exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        self.gate("exists")?;
        self.inner.exists(container, name).await
    }

    async fn shared_access_signature(
        &self,
        container: &str,
        name: &str,
        expiry: DateTime<Utc>,
        write: bool,
    ) -> StorageResult<String> {
        self.gate("shared_access_signature")?;
        self.inner.shared_access_signature(container, name, expiry, write).await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use cloudtable_storage::assert_conflict;
/// use cloudtable_storage::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::conflict("t/p/r"));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        $crate::assert_conflict!($result, "assertion failed")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict { .. })),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use cloudtable_storage::assert_not_found;
/// use cloudtable_storage::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::not_found("missing"));
/// assert_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        $crate::assert_not_found!($result, "assertion failed")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::NotFound { .. })),
            "{}: expected StorageError::NotFound, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`] is a [`StorageError::AlreadyExists`].
#[macro_export]
macro_rules! assert_already_exists {
    ($result:expr) => {
        $crate::assert_already_exists!($result, "assertion failed")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::AlreadyExists { .. })),
            "{}: expected StorageError::AlreadyExists, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a result failed with a configuration error matching
/// `$pattern`.
///
/// Accepts both `Result<_, ConfigError>` and [`StorageResult`].
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use cloudtable_storage::{ConfigError, assert_config_error};
///
/// let result: Result<(), ConfigError> =
///     Err(ConfigError::BatchSizeExceeded { requested: 101, maximum: 100 });
/// assert_config_error!(result, ConfigError::BatchSizeExceeded { .. });
/// ```
#[macro_export]
macro_rules! assert_config_error {
    ($result:expr, $pattern:pat) => {{
        let result = $result.map_err($crate::error::StorageError::from);
        assert!(
            matches!(result, Err($crate::error::StorageError::Config($pattern))),
            "expected StorageError::Config({}), got: {:?}",
            stringify!($pattern),
            result,
        );
    }};
}

/// Assert that a [`StorageResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use cloudtable_storage::assert_storage_ok;
/// use cloudtable_storage::StorageResult;
///
/// let result: StorageResult<i32> = Ok(42);
/// let value = assert_storage_ok!(result);
/// assert_eq!(value, 42);
/// ```
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => panic!("expected Ok, got error: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => panic!("{}: expected Ok, got error: {e:?}", $msg),
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{error::ConfigError, memory::MemoryTableService};

    #[tokio::test]
    async fn test_flaky_service_recovers_after_failures() {
        let flaky = FlakyTableService::new(Arc::new(MemoryTableService::new()), 2);
        assert!(flaky.create_table_if_not_exists("t").await.unwrap_err().is_transient());
        assert!(flaky.create_table_if_not_exists("t").await.is_err());
        assert!(flaky.create_table_if_not_exists("t").await.unwrap());
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_populate_table_orders_rows() {
        let service = MemoryTableService::new();
        populate_table(&service, "t", "p", 12).await;
        assert_eq!(service.row_count("t"), Some(12));
        let first = service.retrieve("t", "p", "r000000").await.unwrap();
        assert!(first.is_some());
    }

    #[test]
    fn test_assertion_macros() {
        let conflict: StorageResult<()> = Err(StorageError::conflict("k"));
        assert_conflict!(conflict);
        let missing: StorageResult<()> = Err(StorageError::not_found("k"));
        assert_not_found!(missing, "lookup");
        let config: Result<(), ConfigError> =
            Err(ConfigError::MissingConnectionString { entity: "E" });
        assert_config_error!(config, ConfigError::MissingConnectionString { .. });
        assert_eq!(assert_storage_ok!(StorageResult::Ok(5)), 5);
    }
}
