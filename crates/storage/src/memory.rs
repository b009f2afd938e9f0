//! In-memory table service.
//!
//! [`MemoryTableService`] implements [`TableService`] in process. It is the
//! backend for tests and local development and the reference the
//! [`conformance`](crate::conformance) suite is written against.
//!
//! # Behaviour
//!
//! - Rows are kept ordered by `(partition key, row key)`.
//! - Every write issues a fresh version token and timestamp.
//! - A query segment examines at most `page_size` rows, so sparse filters
//!   can yield empty segments that still carry a continuation token.
//! - Batches are validated and applied under one write lock.
//!
//! # Cloning
//!
//! `MemoryTableService` is cheaply cloneable via [`Arc`]. All clones share
//! the same tables.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    account::StorageAccount,
    blob::{BlobService, MemoryBlobService},
    connector::StorageConnector,
    error::{ConfigError, StorageError, StorageResult},
    property::PropertyBag,
    query::TableQuery,
    service::{
        BatchOperation, ContinuationToken, DynamicEntity, ETag, MAX_BATCH_SIZE, QuerySegment,
        TableService, VersionCondition, row_path,
    },
};

/// Default rows examined per query segment.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredRow {
    etag: ETag,
    timestamp: DateTime<Utc>,
    properties: PropertyBag,
}

impl StoredRow {
    fn to_entity(&self, partition_key: &str, row_key: &str) -> DynamicEntity {
        DynamicEntity {
            partition_key: partition_key.to_owned(),
            row_key: row_key.to_owned(),
            timestamp: Some(self.timestamp),
            etag: Some(self.etag.clone()),
            properties: self.properties.clone(),
        }
    }
}

type RowKey = (String, String);
type Rows = BTreeMap<RowKey, StoredRow>;

/// In-memory [`TableService`].
#[derive(Clone)]
pub struct MemoryTableService {
    tables: Arc<RwLock<HashMap<String, Rows>>>,
    version: Arc<AtomicU64>,
    page_size: usize,
}

impl MemoryTableService {
    /// Creates an empty service with the default page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty service examining at most `page_size` rows per
    /// segment. A zero page size is treated as one.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            version: Arc::new(AtomicU64::new(0)),
            page_size: page_size.max(1),
        }
    }

    /// The configured page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Names of existing tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rows in `table`, or `None` if it does not exist.
    #[must_use]
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.read().get(table).map(BTreeMap::len)
    }

    fn stamp(&self, properties: PropertyBag) -> StoredRow {
        let n = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        StoredRow { etag: ETag::new(format!("W/\"{n}\"")), timestamp: Utc::now(), properties }
    }
}

impl Default for MemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryTableService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTableService")
            .field("tables", &self.tables.read().len())
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn check_condition(
    key: &str,
    stored: Option<&StoredRow>,
    condition: &VersionCondition,
) -> StorageResult<()> {
    match stored {
        None => Err(StorageError::not_found(key)),
        Some(row) if !condition.allows(&row.etag) => Err(StorageError::conflict(key)),
        Some(_) => Ok(()),
    }
}

fn missing_table(table: &str) -> StorageError {
    StorageError::not_found(table)
}

#[async_trait]
impl TableService for MemoryTableService {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_owned(), Rows::new());
        Ok(true)
    }

    async fn delete_table(&self, table: &str) -> StorageResult<bool> {
        Ok(self.tables.write().remove(table).is_some())
    }

    async fn insert(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let key = (entity.partition_key, entity.row_key);
        if rows.contains_key(&key) {
            return Err(StorageError::already_exists(row_path(table, &key.0, &key.1)));
        }
        let row = self.stamp(entity.properties);
        let etag = row.etag.clone();
        rows.insert(key, row);
        Ok(etag)
    }

    async fn replace(
        &self,
        table: &str,
        entity: DynamicEntity,
        condition: VersionCondition,
    ) -> StorageResult<ETag> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let key = (entity.partition_key, entity.row_key);
        check_condition(&row_path(table, &key.0, &key.1), rows.get(&key), &condition)?;
        let row = self.stamp(entity.properties);
        let etag = row.etag.clone();
        rows.insert(key, row);
        Ok(etag)
    }

    async fn insert_or_replace(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let row = self.stamp(entity.properties);
        let etag = row.etag.clone();
        rows.insert((entity.partition_key, entity.row_key), row);
        Ok(etag)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        condition: VersionCondition,
    ) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let key = (partition_key.to_owned(), row_key.to_owned());
        check_condition(&row_path(table, partition_key, row_key), rows.get(&key), &condition)?;
        rows.remove(&key);
        Ok(())
    }

    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<DynamicEntity>> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(rows
            .get(&(partition_key.to_owned(), row_key.to_owned()))
            .map(|row| row.to_entity(partition_key, row_key)))
    }

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QuerySegment> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| missing_table(table))?;

        let start: RowKey = continuation
            .map(|c| (c.next_partition_key.clone(), c.next_row_key.clone().unwrap_or_default()))
            .unwrap_or_default();
        let take = query.take.unwrap_or(usize::MAX).max(1);

        let mut segment = QuerySegment::default();
        let mut scanned = 0;
        for ((pk, rk), row) in rows.range(start..) {
            if scanned == self.page_size || segment.entities.len() == take {
                segment.continuation = Some(ContinuationToken {
                    next_partition_key: pk.clone(),
                    next_row_key: Some(rk.clone()),
                });
                break;
            }
            scanned += 1;

            let mut entity = row.to_entity(pk, rk);
            if query.filter.as_ref().is_none_or(|f| f.matches(&entity)) {
                query.project(&mut entity);
                segment.entities.push(entity);
            }
        }
        Ok(segment)
    }

    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        if operations.len() > MAX_BATCH_SIZE {
            return Err(ConfigError::BatchSizeExceeded {
                requested: operations.len(),
                maximum: MAX_BATCH_SIZE,
            }
            .into());
        }
        if operations.iter().filter_map(BatchOperation::partition_key).any(|pk| pk != partition_key)
        {
            return Err(StorageError::internal(format!(
                "batch on {table} mixes partitions; expected {partition_key}"
            )));
        }

        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        // Validate every operation against the staged view before touching
        // the table, so a failure leaves nothing applied.
        let mut staged: BTreeMap<String, Option<StoredRow>> = BTreeMap::new();
        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            let row_key = op.row_key().to_owned();
            if staged.contains_key(&row_key) {
                return Err(StorageError::internal(format!(
                    "batch on {table} touches {partition_key}/{row_key} more than once"
                )));
            }
            let path = row_path(table, partition_key, &row_key);
            let current = rows.get(&(partition_key.to_owned(), row_key.clone()));

            let next = match op {
                BatchOperation::Insert(entity) => {
                    if current.is_some() {
                        return Err(StorageError::already_exists(path));
                    }
                    Some(self.stamp(entity.properties))
                },
                BatchOperation::Replace(entity, condition) => {
                    check_condition(&path, current, &condition)?;
                    Some(self.stamp(entity.properties))
                },
                BatchOperation::InsertOrReplace(entity) => Some(self.stamp(entity.properties)),
                BatchOperation::Delete { condition, .. } => {
                    check_condition(&path, current, &condition)?;
                    None
                },
            };
            results.push(next.as_ref().map(|row| row.etag.clone()));
            staged.insert(row_key, next);
        }

        for (row_key, next) in staged {
            let key = (partition_key.to_owned(), row_key);
            match next {
                Some(row) => {
                    rows.insert(key, row);
                },
                None => {
                    rows.remove(&key);
                },
            }
        }
        Ok(results)
    }
}

/// Connector handing out one memory service pair per account name.
///
/// Stores built from the same connector and account share data.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    accounts: Arc<Mutex<HashMap<String, (MemoryTableService, MemoryBlobService)>>>,
    page_size: Option<usize>,
}

impl MemoryConnector {
    /// Creates a connector with default service settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector whose table services use `page_size`.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self { page_size: Some(page_size), ..Self::default() }
    }

    /// The services for `account`, created on first use and keyed by
    /// account name.
    #[must_use]
    pub fn services(&self, account: &StorageAccount) -> (MemoryTableService, MemoryBlobService) {
        let mut accounts = self.accounts.lock();
        accounts
            .entry(account.name().to_owned())
            .or_insert_with(|| {
                let tables = self
                    .page_size
                    .map_or_else(MemoryTableService::new, MemoryTableService::with_page_size);
                (tables, MemoryBlobService::with_endpoint(account.blob_endpoint()))
            })
            .clone()
    }
}

impl StorageConnector for MemoryConnector {
    fn table_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn TableService>> {
        Ok(Arc::new(self.services(account).0))
    }

    fn blob_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn BlobService>> {
        Ok(Arc::new(self.services(account).1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{conformance, query::Filter};

    async fn service_with(rows: &[(&str, &str)]) -> MemoryTableService {
        let service = MemoryTableService::with_page_size(2);
        service.create_table_if_not_exists("t").await.unwrap();
        for (pk, rk) in rows {
            service.insert("t", DynamicEntity::new(*pk, *rk)).await.unwrap();
        }
        service
    }

    #[tokio::test]
    async fn test_conformance() {
        conformance::run_all(Arc::new(MemoryTableService::new())).await;
    }

    #[tokio::test]
    async fn test_conformance_small_pages() {
        conformance::run_all(Arc::new(MemoryTableService::with_page_size(3))).await;
    }

    #[tokio::test]
    async fn test_sparse_filter_yields_empty_segment_with_continuation() {
        let service = service_with(&[("a", "1"), ("a", "2"), ("b", "1")]).await;
        let query = TableQuery::filtered(Filter::partition("b"));

        let first = service.query_segment("t", &query, None).await.unwrap();
        assert!(first.entities.is_empty());
        let token = first.continuation.expect("continuation");
        assert_eq!(token.next_partition_key, "b");

        let second = service.query_segment("t", &query, Some(&token)).await.unwrap();
        assert_eq!(second.entities.len(), 1);
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_take_limits_results() {
        let service = service_with(&[("a", "1"), ("a", "2")]).await;
        let query = TableQuery::builder().take(1).build();
        let segment = service.query_segment("t", &query, None).await.unwrap();
        assert_eq!(segment.entities.len(), 1);
        assert_eq!(segment.continuation.unwrap().next_row_key.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let service = service_with(&[("a", "1")]).await;
        let clone = service.clone();
        assert_eq!(clone.row_count("t"), Some(1));
        assert_eq!(clone.table_names(), vec!["t".to_owned()]);
    }

    #[tokio::test]
    async fn test_batch_rejects_mixed_partitions() {
        let service = service_with(&[]).await;
        let ops = vec![
            BatchOperation::Insert(DynamicEntity::new("a", "1")),
            BatchOperation::Insert(DynamicEntity::new("b", "1")),
        ];
        assert!(service.execute_batch("t", "a", ops).await.is_err());
        assert_eq!(service.row_count("t"), Some(0));
    }

    #[tokio::test]
    async fn test_connector_shares_services_per_account() {
        let connector = MemoryConnector::new();
        let account = StorageAccount::development();
        let one = connector.table_service(&account).unwrap();
        let two = connector.table_service(&account).unwrap();
        one.create_table_if_not_exists("shared").await.unwrap();
        assert!(!two.create_table_if_not_exists("shared").await.unwrap());
    }
}
