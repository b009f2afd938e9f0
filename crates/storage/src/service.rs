//! The table service abstraction.
//!
//! [`TableService`] is the seam between the typed layer and a concrete
//! store. It speaks in [`DynamicEntity`] rows and is object safe, so stores
//! hold an `Arc<dyn TableService>` chosen at runtime by a
//! [`StorageConnector`](crate::StorageConnector).
//!
//! Implementations must map their failures onto
//! [`StorageError`](crate::StorageError) consistently:
//!
//! | Situation | Error |
//! |-----------|-------|
//! | table or row missing | `NotFound` |
//! | insert of an existing row | `AlreadyExists` |
//! | version token mismatch | `Conflict` |
//! | network, throttling, timeouts | `Connection` / `Unavailable` / `Timeout` |

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StorageResult, property::PropertyBag, query::TableQuery};

/// Maximum number of operations in one entity-group transaction.
pub const MAX_BATCH_SIZE: usize = 100;

/// An opaque version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// The wildcard token, matching any stored version.
    pub const WILDCARD: &'static str = "*";

    /// Wraps a token returned by the service.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wildcard token.
    #[must_use]
    pub fn wildcard() -> Self {
        Self(Self::WILDCARD.to_owned())
    }

    /// Returns `true` for the wildcard token.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition for replace and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCondition {
    /// Apply regardless of the stored version.
    Any,
    /// Apply only if the stored version matches.
    Matches(ETag),
}

impl VersionCondition {
    /// Builds a condition from a token, treating `*` as [`VersionCondition::Any`].
    #[must_use]
    pub fn from_etag(etag: ETag) -> Self {
        if etag.is_wildcard() { Self::Any } else { Self::Matches(etag) }
    }

    /// The header value to send.
    #[must_use]
    pub fn header_value(&self) -> &str {
        match self {
            Self::Any => ETag::WILDCARD,
            Self::Matches(etag) => etag.as_str(),
        }
    }

    /// Returns `true` when `stored` satisfies the condition.
    #[must_use]
    pub fn allows(&self, stored: &ETag) -> bool {
        match self {
            Self::Any => true,
            Self::Matches(expected) => expected == stored,
        }
    }
}

/// A row as the service sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicEntity {
    /// Normalized partition key.
    pub partition_key: String,
    /// Normalized row key.
    pub row_key: String,
    /// Last-modified time, set by the service.
    pub timestamp: Option<DateTime<Utc>>,
    /// Version token, set by the service.
    pub etag: Option<ETag>,
    /// The remaining properties.
    pub properties: PropertyBag,
}

impl DynamicEntity {
    /// An empty row with the given keys.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self { partition_key: partition_key.into(), row_key: row_key.into(), ..Self::default() }
    }

    /// Adds a property, builder style.
    #[must_use]
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::property::EntityProperty>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// `table/pk/rk`, used in error keys and logs.
    #[must_use]
    pub fn describe(&self, table: &str) -> String {
        row_path(table, &self.partition_key, &self.row_key)
    }
}

/// `table/pk/rk`.
#[must_use]
pub fn row_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!("{table}/{partition_key}/{row_key}")
}

/// Where the next page of a query starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    /// First partition key of the next page.
    pub next_partition_key: String,
    /// First row key of the next page, if the page starts mid-partition.
    pub next_row_key: Option<String>,
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySegment {
    /// Rows in key order.
    pub entities: Vec<DynamicEntity>,
    /// Present when more rows may follow.
    pub continuation: Option<ContinuationToken>,
}

/// One operation inside an entity-group transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Insert, failing if the row exists.
    Insert(DynamicEntity),
    /// Replace under a version condition.
    Replace(DynamicEntity, VersionCondition),
    /// Insert or replace unconditionally.
    InsertOrReplace(DynamicEntity),
    /// Delete under a version condition.
    Delete {
        /// Row key to delete.
        row_key: String,
        /// Version precondition.
        condition: VersionCondition,
    },
}

impl BatchOperation {
    /// The row key this operation targets.
    #[must_use]
    pub fn row_key(&self) -> &str {
        match self {
            Self::Insert(entity) | Self::Replace(entity, _) | Self::InsertOrReplace(entity) => {
                &entity.row_key
            },
            Self::Delete { row_key, .. } => row_key,
        }
    }

    /// The partition key, if the operation carries an entity.
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        match self {
            Self::Insert(entity) | Self::Replace(entity, _) | Self::InsertOrReplace(entity) => {
                Some(&entity.partition_key)
            },
            Self::Delete { .. } => None,
        }
    }
}

/// A partitioned key-row table store.
///
/// All methods are suspension points; implementations must not hold locks
/// across network calls.
#[async_trait]
pub trait TableService: Send + Sync + fmt::Debug {
    /// Creates the table if it does not exist. Returns `true` when created.
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool>;

    /// Deletes the table. Returns `false` when it did not exist.
    async fn delete_table(&self, table: &str) -> StorageResult<bool>;

    /// Inserts a new row and returns its version token.
    async fn insert(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag>;

    /// Replaces an existing row under `condition`.
    async fn replace(
        &self,
        table: &str,
        entity: DynamicEntity,
        condition: VersionCondition,
    ) -> StorageResult<ETag>;

    /// Inserts or replaces a row unconditionally.
    async fn insert_or_replace(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag>;

    /// Deletes a row under `condition`.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        condition: VersionCondition,
    ) -> StorageResult<()>;

    /// Reads one row.
    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<DynamicEntity>>;

    /// Fetches one page of a query, starting at `continuation`.
    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QuerySegment>;

    /// Applies up to [`MAX_BATCH_SIZE`] operations on one partition
    /// atomically. Returns one version token per operation, empty for
    /// deletes.
    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StorageResult<Vec<Option<ETag>>>;
}
