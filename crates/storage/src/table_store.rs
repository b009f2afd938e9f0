//! Typed table store.
//!
//! [`TableStore<T>`] is the repository over one table of entities `T`. It
//! resolves its table lazily through the [`ReferenceManager`], converts
//! entities with the [`EntityConverter`] and runs every service call under
//! the context's retry policy, retrying only transient failures.
//!
//! ```text
//! TableStore<T>
//!   ├── key selectors ──► normalize_key
//!   ├── EntityConverter<T> ──► DynamicEntity
//!   ├── OnceCell<Arc<TableReference>> ◄── ReferenceManager (create on first use)
//!   └── with_retry_if(is_transient) ──► dyn TableService
//! ```
//!
//! # Version tokens
//!
//! `replace` and `delete` send the token carried in the entity's metadata
//! slot. With `ignore_etag` they send the wildcard instead. Without either,
//! they fail with [`StorageError::VersionTokenRequired`]. A stale token
//! surfaces as [`StorageError::Conflict`] and is never retried.
//!
//! [`ReferenceManager`]: crate::ReferenceManager

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    context::StorageContext,
    converter::{ConversionMode, EntityConverter},
    entity::{KeyDesignation, TableEntity},
    error::{ConfigError, StorageError, StorageResult},
    keys::normalize_key,
    metrics::StoreMetrics,
    query::{Filter, TableQuery},
    reference::TableReference,
    retry::with_retry_if,
    service::{
        BatchOperation, ContinuationToken, DynamicEntity, ETag, MAX_BATCH_SIZE, VersionCondition,
    },
};

/// Extracts a raw key from an entity.
pub type KeySelector<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Repository over one table of `T`.
pub struct TableStore<T: TableEntity> {
    context: Arc<StorageContext>,
    table_name: String,
    partition_key: KeySelector<T>,
    row_key: KeySelector<T>,
    converter: EntityConverter<T>,
    connection_string: Option<String>,
    maximum_batch_size: usize,
    table: OnceCell<Arc<TableReference>>,
    metrics: StoreMetrics,
}

impl<T: TableEntity> fmt::Debug for TableStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableStore")
            .field("entity", &T::entity_name())
            .field("table_name", &self.table_name)
            .field("maximum_batch_size", &self.maximum_batch_size)
            .field("initialized", &self.table.initialized())
            .finish_non_exhaustive()
    }
}

/// Builder for [`TableStore`].
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use cloudtable_storage::{StorageContext, TableStore, table_entity};
/// #[derive(Debug, Default)]
/// struct Visit { site: String, id: String, pages: i32 }
///
/// table_entity! {
///     impl TableEntity for Visit { site, id, pages }
/// }
///
/// # fn build(context: Arc<StorageContext>) -> Result<(), cloudtable_storage::ConfigError> {
/// let store = TableStore::<Visit>::builder(context, "Visits")
///     .partition_key(|v: &Visit| v.site.clone())
///     .row_key(|v: &Visit| v.id.clone())
///     .maximum_batch_size(50)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TableStoreBuilder<T: TableEntity> {
    context: Arc<StorageContext>,
    table_name: String,
    partition_key: Option<KeySelector<T>>,
    row_key: Option<KeySelector<T>>,
    connection_string: Option<String>,
    maximum_batch_size: usize,
    conversion_mode: ConversionMode,
    reference: Option<Arc<TableReference>>,
}

impl<T: TableEntity> TableStoreBuilder<T> {
    /// Supplies the partition key selector instead of the key markers.
    #[must_use]
    pub fn partition_key(
        mut self,
        selector: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        self.partition_key = Some(Arc::new(selector));
        self
    }

    /// Supplies the row key selector instead of the key markers.
    #[must_use]
    pub fn row_key(mut self, selector: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.row_key = Some(Arc::new(selector));
        self
    }

    /// Uses this connection string instead of the context default.
    #[must_use]
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Largest entity-group transaction `insert_or_replace_batch` submits.
    #[must_use]
    pub fn maximum_batch_size(mut self, size: usize) -> Self {
        self.maximum_batch_size = size;
        self
    }

    /// How reads treat malformed properties.
    #[must_use]
    pub fn conversion_mode(mut self, mode: ConversionMode) -> Self {
        self.conversion_mode = mode;
        self
    }

    /// Builds the store. No service call is made.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BatchSizeExceeded`] for a batch size above
    /// [`MAX_BATCH_SIZE`], and the schema or key-marker error of `T` when a
    /// selector was not supplied and cannot be derived.
    pub fn build(self) -> Result<TableStore<T>, ConfigError> {
        check_batch_size(self.maximum_batch_size)?;
        let converter = EntityConverter::new(self.conversion_mode)?;

        let (partition_key, row_key) = match (self.partition_key, self.row_key) {
            (Some(pk), Some(rk)) => (pk, rk),
            (pk, rk) => {
                let (derived_pk, derived_rk) = derived_selectors(&converter)?;
                (pk.unwrap_or(derived_pk), rk.unwrap_or(derived_rk))
            },
        };

        Ok(TableStore {
            context: self.context,
            table_name: self.table_name,
            partition_key: normalized(partition_key),
            row_key: normalized(row_key),
            converter,
            connection_string: self.connection_string,
            maximum_batch_size: self.maximum_batch_size,
            table: OnceCell::new_with(self.reference),
            metrics: StoreMetrics::new(),
        })
    }
}

fn check_batch_size(size: usize) -> Result<(), ConfigError> {
    if size > MAX_BATCH_SIZE {
        return Err(ConfigError::BatchSizeExceeded { requested: size, maximum: MAX_BATCH_SIZE });
    }
    Ok(())
}

fn normalized<T: 'static>(selector: KeySelector<T>) -> KeySelector<T> {
    Arc::new(move |entity: &T| normalize_key(&selector(entity)))
}

fn derived_selectors<T: TableEntity>(
    converter: &EntityConverter<T>,
) -> Result<(KeySelector<T>, KeySelector<T>), ConfigError> {
    Ok(match converter.schema().key_designation()? {
        KeyDesignation::Metadata => (
            Arc::new(|e: &T| e.metadata().map(|m| m.partition_key.clone()).unwrap_or_default()),
            Arc::new(|e: &T| e.metadata().map(|m| m.row_key.clone()).unwrap_or_default()),
        ),
        KeyDesignation::Fields { partition_key, row_key } => (
            Arc::new(move |e: &T| (partition_key.read)(e)),
            Arc::new(move |e: &T| (row_key.read)(e)),
        ),
    })
}

impl<T: TableEntity> TableStore<T> {
    /// Starts a builder for the logical table `table_name`.
    #[must_use]
    pub fn builder(
        context: Arc<StorageContext>,
        table_name: impl Into<String>,
    ) -> TableStoreBuilder<T> {
        TableStoreBuilder {
            context,
            table_name: table_name.into(),
            partition_key: None,
            row_key: None,
            connection_string: None,
            maximum_batch_size: MAX_BATCH_SIZE,
            conversion_mode: ConversionMode::default(),
            reference: None,
        }
    }

    /// A store whose keys come from the markers or metadata slot of `T`.
    ///
    /// # Errors
    ///
    /// As [`TableStoreBuilder::build`].
    pub fn new(
        context: Arc<StorageContext>,
        table_name: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::builder(context, table_name).build()
    }

    /// A store over an already resolved table. No creation call is made.
    ///
    /// # Errors
    ///
    /// As [`TableStoreBuilder::build`].
    pub fn from_reference(
        context: Arc<StorageContext>,
        reference: Arc<TableReference>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::builder(context, reference.name());
        builder.reference = Some(reference);
        builder.build()
    }

    /// The logical table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Operation counters for this store.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Largest entity-group transaction submitted by
    /// [`insert_or_replace_batch`](Self::insert_or_replace_batch).
    #[must_use]
    pub fn maximum_batch_size(&self) -> usize {
        self.maximum_batch_size
    }

    /// Changes the batch size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BatchSizeExceeded`] above [`MAX_BATCH_SIZE`];
    /// the previous value is kept.
    pub fn set_maximum_batch_size(&mut self, size: usize) -> Result<(), ConfigError> {
        check_batch_size(size)?;
        self.maximum_batch_size = size;
        Ok(())
    }

    /// The normalizer applied to every key.
    #[must_use]
    pub fn generate_key(&self, raw: &str) -> String {
        normalize_key(raw)
    }

    /// The normalized partition key of `entity`.
    #[must_use]
    pub fn partition_key_of(&self, entity: &T) -> String {
        (self.partition_key)(entity)
    }

    /// The normalized row key of `entity`.
    #[must_use]
    pub fn row_key_of(&self, entity: &T) -> String {
        (self.row_key)(entity)
    }

    /// The table handle, resolved once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingConnectionString`] when neither the
    /// store nor the context has a connection string, or the reference
    /// manager's failure.
    pub async fn table(&self) -> StorageResult<&Arc<TableReference>> {
        self.table
            .get_or_try_init(|| async {
                let connection_string = self.context.resolve_connection_string(
                    self.connection_string.as_deref(),
                    T::entity_name(),
                )?;
                self.context
                    .references()
                    .table_reference(&connection_string, &self.table_name)
                    .await
            })
            .await
    }

    async fn retrying<R, F, Fut>(
        &self,
        operation: &'static str,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> StorageResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<R>>,
    {
        let mut attempts: u32 = 0;
        let policy = self.context.retry();
        let result = with_retry_if(policy, operation, cancel, StorageError::is_transient, || {
            attempts += 1;
            call()
        })
        .await;
        self.metrics.record_retries(u64::from(attempts.saturating_sub(1)));

        result.map_err(|err| {
            let err = StorageError::from(err);
            if err.is_conflict() {
                self.metrics.record_conflict();
            }
            err
        })
    }

    fn to_row(&self, entity: &T) -> StorageResult<DynamicEntity> {
        let partition_key = (self.partition_key)(entity);
        let row_key = (self.row_key)(entity);
        Ok(self.converter.to_dynamic(entity, partition_key, row_key)?)
    }

    fn decode(&self, row: &DynamicEntity) -> StorageResult<T> {
        let converted = self.converter.from_dynamic(row)?;
        self.metrics.record_malformed(converted.issues.len() as u64);
        Ok(converted.entity)
    }

    fn condition(
        etag: Option<&ETag>,
        ignore_etag: bool,
        operation: &'static str,
    ) -> StorageResult<VersionCondition> {
        if ignore_etag {
            return Ok(VersionCondition::Any);
        }
        etag.cloned()
            .map(VersionCondition::from_etag)
            .ok_or(StorageError::VersionTokenRequired { operation })
    }

    fn remember(entity: &mut T, etag: ETag) {
        if let Some(metadata) = entity.metadata_mut() {
            metadata.etag = Some(etag);
        }
    }

    /// Every entity in the table.
    ///
    /// # Errors
    ///
    /// As [`query`](Self::query).
    pub async fn get_all(&self) -> StorageResult<Vec<T>> {
        self.query(TableQuery::all()).await
    }

    /// Inserts `entity`, failing if the row exists. The new version token
    /// is stored in the metadata slot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`], a conversion error, or the
    /// last transient failure once retries are exhausted.
    #[tracing::instrument(skip(self, entity), fields(table = %self.table_name))]
    pub async fn insert(&self, entity: &mut T) -> StorageResult<()> {
        let row = self.to_row(entity)?;
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());

        let etag = self.retrying("insert", None, || service.insert(table, row.clone())).await?;
        self.metrics.record_writes(1);
        Self::remember(entity, etag);
        Ok(())
    }

    /// Replaces the stored row of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::VersionTokenRequired`] without a token and
    /// without `ignore_etag`, [`StorageError::Conflict`] for a stale token,
    /// or [`StorageError::NotFound`].
    #[tracing::instrument(skip(self, entity), fields(table = %self.table_name))]
    pub async fn replace(&self, entity: &mut T, ignore_etag: bool) -> StorageResult<()> {
        let row = self.to_row(entity)?;
        let condition = Self::condition(row.etag.as_ref(), ignore_etag, "replace")?;
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());

        let etag = self
            .retrying("replace", None, || service.replace(table, row.clone(), condition.clone()))
            .await?;
        self.metrics.record_writes(1);
        Self::remember(entity, etag);
        Ok(())
    }

    /// Inserts or unconditionally replaces the row of `entity`.
    ///
    /// # Errors
    ///
    /// A conversion error, or the last transient failure.
    #[tracing::instrument(skip(self, entity), fields(table = %self.table_name))]
    pub async fn insert_or_replace(&self, entity: &mut T) -> StorageResult<()> {
        let row = self.to_row(entity)?;
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());

        let etag = self
            .retrying("insert_or_replace", None, || service.insert_or_replace(table, row.clone()))
            .await?;
        self.metrics.record_writes(1);
        Self::remember(entity, etag);
        Ok(())
    }

    /// Deletes the row of `entity`.
    ///
    /// # Errors
    ///
    /// As [`replace`](Self::replace).
    #[tracing::instrument(skip(self, entity), fields(table = %self.table_name))]
    pub async fn delete(&self, entity: &T, ignore_etag: bool) -> StorageResult<()> {
        let partition_key = (self.partition_key)(entity);
        let row_key = (self.row_key)(entity);
        let etag = entity.metadata().and_then(|m| m.etag.as_ref());
        let condition = Self::condition(etag, ignore_etag, "delete")?;
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());

        self.retrying("delete", None, || {
            service.delete(table, &partition_key, &row_key, condition.clone())
        })
        .await?;
        self.metrics.record_delete();
        Ok(())
    }

    /// Deletes the row of `entity`, treating a missing row as success.
    /// Any other failure is logged and reported as `false`.
    pub async fn try_delete(&self, entity: &T, ignore_etag: bool) -> bool {
        match self.delete(entity, ignore_etag).await {
            Ok(()) => true,
            Err(err) if err.is_not_found() => true,
            Err(err) => {
                tracing::error!(
                    entity = T::entity_name(),
                    table = %self.table_name,
                    error = %err,
                    "could not delete entity"
                );
                false
            },
        }
    }

    /// Reads one entity. Keys are normalized first.
    ///
    /// # Errors
    ///
    /// A strict-mode conversion error, or the last transient failure.
    #[tracing::instrument(skip(self), fields(table = %self.table_name))]
    pub async fn get(&self, partition_key: &str, row_key: &str) -> StorageResult<Option<T>> {
        let (partition_key, row_key) = (normalize_key(partition_key), normalize_key(row_key));
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());

        let row = self
            .retrying("retrieve", None, || service.retrieve(table, &partition_key, &row_key))
            .await?;
        self.metrics.record_read();
        row.as_ref().map(|row| self.decode(row)).transpose()
    }

    /// Every entity matching `query`, following continuation tokens to the
    /// end.
    ///
    /// # Errors
    ///
    /// A strict-mode conversion error, or the last transient failure of any
    /// page.
    pub async fn query(&self, query: TableQuery) -> StorageResult<Vec<T>> {
        self.collect(&query, None).await
    }

    /// As [`query`](Self::query), checking `cancel` between pages and during
    /// retry backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Cancelled`] once `cancel` fires.
    pub async fn query_with_cancellation(
        &self,
        query: TableQuery,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<T>> {
        self.collect(&query, Some(cancel)).await
    }

    #[tracing::instrument(skip(self, query, cancel), fields(table = %self.table_name))]
    async fn collect(
        &self,
        query: &TableQuery,
        cancel: Option<&CancellationToken>,
    ) -> StorageResult<Vec<T>> {
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());
        self.metrics.record_query();

        let mut results = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(StorageError::Cancelled);
            }
            let token = continuation.as_ref();
            let segment = self
                .retrying("query", cancel, || service.query_segment(table, query, token))
                .await?;
            self.metrics.record_page();

            for row in &segment.entities {
                results.push(self.decode(row)?);
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(results),
            }
        }
    }

    /// Returns `true` if any row matches `filter`.
    ///
    /// Fetches at most one key column per segment and follows continuation
    /// tokens only while segments come back empty.
    ///
    /// # Errors
    ///
    /// The last transient failure.
    #[tracing::instrument(skip(self, filter), fields(table = %self.table_name))]
    pub async fn exists_matching(&self, filter: Filter) -> StorageResult<bool> {
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());
        let query = TableQuery::builder()
            .filter(filter)
            .select(vec!["PartitionKey".to_owned()])
            .take(1)
            .build();
        self.metrics.record_query();

        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let token = continuation.as_ref();
            let segment = self
                .retrying("exists", None, || service.query_segment(table, &query, token))
                .await?;
            self.metrics.record_page();

            if !segment.entities.is_empty() {
                return Ok(true);
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(false),
            }
        }
    }

    /// Deletes every row, one at a time, ignoring rows that disappear
    /// concurrently. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// The last transient failure of a page or delete.
    pub async fn clear_all(&self) -> StorageResult<usize> {
        self.clear(None).await
    }

    /// As [`clear_all`](Self::clear_all), checking `cancel` between pages
    /// and during retry backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Cancelled`] once `cancel` fires.
    pub async fn clear_all_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> StorageResult<usize> {
        self.clear(Some(cancel)).await
    }

    #[tracing::instrument(skip(self, cancel), fields(table = %self.table_name))]
    async fn clear(&self, cancel: Option<&CancellationToken>) -> StorageResult<usize> {
        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());
        let key_columns = vec!["PartitionKey".to_owned(), "RowKey".to_owned()];
        let query = TableQuery::builder().select(key_columns).build();
        self.metrics.record_query();

        let mut deleted = 0;
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(StorageError::Cancelled);
            }
            let token = continuation.as_ref();
            let segment = self
                .retrying("clear", cancel, || service.query_segment(table, &query, token))
                .await?;
            self.metrics.record_page();

            for row in &segment.entities {
                let outcome = self
                    .retrying("delete", cancel, || {
                        let (partition_key, row_key) = (&row.partition_key, &row.row_key);
                        service.delete(table, partition_key, row_key, VersionCondition::Any)
                    })
                    .await;
                match outcome {
                    Ok(()) => {
                        deleted += 1;
                        self.metrics.record_delete();
                    },
                    Err(err) if err.is_not_found() => {},
                    Err(err) => return Err(err),
                }
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        tracing::debug!(deleted, "cleared table");
        Ok(deleted)
    }

    /// Inserts or replaces many entities as entity-group transactions.
    ///
    /// Entities are grouped by normalized partition key and submitted in
    /// chunks of at most [`maximum_batch_size`](Self::maximum_batch_size).
    /// Each chunk is atomic; chunks are independent.
    ///
    /// # Errors
    ///
    /// A conversion error before anything is sent, or the failure of the
    /// first chunk that could not be applied.
    #[tracing::instrument(
        skip(self, entities),
        fields(table = %self.table_name, count = entities.len())
    )]
    pub async fn insert_or_replace_batch(&self, entities: &mut [T]) -> StorageResult<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut partitions: BTreeMap<String, Vec<(usize, DynamicEntity)>> = BTreeMap::new();
        for (index, entity) in entities.iter().enumerate() {
            let row = self.to_row(entity)?;
            partitions.entry(row.partition_key.clone()).or_default().push((index, row));
        }

        let reference = self.table().await?;
        let (service, table) = (reference.service(), reference.name());
        let chunk_size = self.maximum_batch_size.max(1);

        for (partition_key, rows) in &partitions {
            for chunk in rows.chunks(chunk_size) {
                let etags = self
                    .retrying("insert_or_replace_batch", None, || {
                        let operations = chunk
                            .iter()
                            .map(|(_, row)| BatchOperation::InsertOrReplace(row.clone()))
                            .collect();
                        service.execute_batch(table, partition_key, operations)
                    })
                    .await?;
                self.metrics.record_writes(chunk.len() as u64);

                for ((index, _), etag) in chunk.iter().zip(etags) {
                    if let Some(etag) = etag {
                        Self::remember(&mut entities[*index], etag);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        config::StorageConfig,
        entity::EntityMetadata,
        memory::{MemoryConnector, MemoryTableService},
        testutil::{self, FixedConnector, FlakyTableService},
    };

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Reading {
        sensor: String,
        at: i64,
        value: f64,
    }

    crate::table_entity! {
        impl TableEntity for Reading {
            #[partition_key] sensor,
            #[row_key] at,
            value,
        }
    }

    #[derive(Debug, Default)]
    struct Unmarked {
        a: String,
    }

    crate::table_entity! {
        impl TableEntity for Unmarked { a }
    }

    #[derive(Debug, Default)]
    struct Tracked {
        meta: EntityMetadata,
        label: String,
    }

    crate::table_entity! {
        impl TableEntity for Tracked where metadata = meta { label }
    }

    fn context() -> Arc<StorageContext> {
        let config =
            StorageConfig::builder().connection_string("UseDevelopmentStorage=true").build();
        Arc::new(StorageContext::new(config, Arc::new(MemoryConnector::new())))
    }

    #[test]
    fn test_marked_fields_drive_normalized_keys() {
        let store = TableStore::<Reading>::new(context(), "Readings").unwrap();
        let reading = Reading { sensor: "Boiler Room #2".into(), at: 1700, value: 1.5 };
        assert_eq!(store.partition_key_of(&reading), "boilerroom2");
        assert_eq!(store.row_key_of(&reading), "1700");
    }

    #[test]
    fn test_explicit_selectors_are_normalized() {
        let store = TableStore::<Unmarked>::builder(context(), "Unmarked")
            .partition_key(|_| "Fixed Partition".to_owned())
            .row_key(|u: &Unmarked| u.a.clone())
            .build()
            .unwrap();
        let entity = Unmarked { a: "Row/1".into() };
        assert_eq!(store.partition_key_of(&entity), "fixedpartition");
        assert_eq!(store.row_key_of(&entity), "row1");
    }

    #[test]
    fn test_metadata_slot_supplies_keys() {
        let store = TableStore::<Tracked>::new(context(), "Tracked").unwrap();
        let mut entity = Tracked::default();
        entity.meta.partition_key = "P".into();
        entity.meta.row_key = "R".into();
        assert_eq!(store.partition_key_of(&entity), "p");
        assert_eq!(store.row_key_of(&entity), "r");
    }

    #[test]
    fn test_missing_markers_fail_construction() {
        let err = TableStore::<Unmarked>::new(context(), "Unmarked").unwrap_err();
        assert!(err.to_string().contains("missing partition_key marker on Unmarked"), "{err}");
    }

    #[test]
    fn test_batch_size_cap() {
        let mut store = TableStore::<Reading>::new(context(), "Readings").unwrap();
        assert_eq!(store.maximum_batch_size(), MAX_BATCH_SIZE);
        assert!(matches!(
            store.set_maximum_batch_size(101),
            Err(ConfigError::BatchSizeExceeded { requested: 101, maximum: 100 })
        ));
        assert_eq!(store.maximum_batch_size(), MAX_BATCH_SIZE);
        store.set_maximum_batch_size(10).unwrap();
        assert_eq!(store.maximum_batch_size(), 10);
        let oversized = TableStore::<Reading>::builder(context(), "R").maximum_batch_size(101);
        assert!(oversized.build().is_err());
    }

    #[tokio::test]
    async fn test_replace_without_token_requires_ignore_etag() {
        let store = TableStore::<Reading>::new(context(), "Readings").unwrap();
        let mut reading = Reading { sensor: "s".into(), at: 1, value: 0.0 };
        store.insert(&mut reading).await.unwrap();

        let err = store.replace(&mut reading, false).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTokenRequired { operation: "replace" }));
        store.replace(&mut reading, true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_and_counted() {
        let flaky = Arc::new(FlakyTableService::new(Arc::new(MemoryTableService::new()), 0));
        let context = testutil::context_with(Arc::new(FixedConnector::new(flaky.clone())));
        let store = TableStore::<Reading>::new(context, "Readings").unwrap();
        store.table().await.unwrap();

        flaky.fail_next(2);
        let mut reading = Reading { sensor: "s".into(), at: 1, value: 2.5 };
        store.insert(&mut reading).await.unwrap();
        assert_eq!(store.metrics().snapshot().retries, 2);

        flaky.fail_next(4);
        let err = store.get("s", "1").await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert_eq!(store.metrics().snapshot().retries, 5);
        assert_eq!(store.metrics().snapshot().reads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let flaky = Arc::new(FlakyTableService::new(Arc::new(MemoryTableService::new()), 0));
        let context = testutil::context_with(Arc::new(FixedConnector::new(flaky.clone())));
        let store = TableStore::<Reading>::new(context, "Readings").unwrap();
        store.table().await.unwrap();
        flaky.fail_next(u32::MAX);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            trigger.cancel();
        });

        let err = store.query_with_cancellation(TableQuery::all(), &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled), "{err:?}");
        assert!(flaky.calls() >= 2);
    }

    #[tokio::test]
    async fn test_from_reference_skips_creation() {
        let context = testutil::memory_context();
        let reference = context
            .references()
            .table_reference("UseDevelopmentStorage=true", "Shared")
            .await
            .unwrap();
        let store = TableStore::<Reading>::from_reference(Arc::clone(&context), reference).unwrap();
        assert_eq!(store.table_name(), "shared");

        let mut reading = Reading { sensor: "s".into(), at: 7, value: 1.0 };
        store.insert_or_replace(&mut reading).await.unwrap();
        let expected = Reading { sensor: "s".into(), at: 7, value: 1.0 };
        assert_eq!(store.get_all().await.unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_missing_connection_string_fails_on_first_use() {
        let connector = Arc::new(MemoryConnector::new());
        let context = Arc::new(StorageContext::new(StorageConfig::default(), connector));
        let store = TableStore::<Reading>::new(context, "Readings").unwrap();
        let err = store.get_all().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Config(ConfigError::MissingConnectionString { entity: "Reading" })
        ));
    }
}
