//! Typed entity persistence over a partitioned key-row cloud table store.
//!
//! This crate lets application record types be stored, queried and paged
//! through a schemaless table service without implementing any
//! storage-specific contract beyond a one-line [`table_entity!`]
//! declaration. Transient service failures are retried under a bounded
//! policy; version-token conflicts are surfaced to the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application code                        │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        TableStore<T>         │          BlobStore           │
//! │  (keys, retry, pagination,   │  (relative URIs, streams)    │
//! │   batches, version tokens)   │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  EntityConverter<T>  │  StorageContext + ReferenceManager   │
//! │  (entity ⇄ bag)      │  (connection strings, name prefix,   │
//! │                      │   create-once table/container cache) │
//! ├──────────────────────┴──────────────────────────────────────┤
//! │            TableService / BlobService traits                │
//! ├───────────────────────────┬─────────────────────────────────┤
//! │ MemoryTableService        │ HttpTableService                │
//! │ MemoryBlobService         │ (in `cloudtable-storage-rest`)  │
//! └───────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use cloudtable_storage::{
//!     MemoryConnector, StorageConfig, StorageContext, TableStore, table_entity,
//! };
//!
//! #[derive(Debug, Default)]
//! struct Order {
//!     customer: String,
//!     number: String,
//!     total: i64,
//! }
//!
//! table_entity! {
//!     impl TableEntity for Order {
//!         #[partition_key] customer,
//!         #[row_key] number,
//!         total,
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::builder()
//!         .connection_string("UseDevelopmentStorage=true")
//!         .build();
//!     let context = Arc::new(StorageContext::new(config, Arc::new(MemoryConnector::new())));
//!
//!     let store = TableStore::<Order>::new(context, "Orders")?;
//!     let mut order = Order { customer: "Sales".into(), number: "Widget-1".into(), total: 12 };
//!     store.insert(&mut order).await?;
//!
//!     let loaded = store.get("sales", "widget-1").await?;
//!     assert_eq!(loaded.map(|o| o.total), Some(12));
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement [`TableService`] (and [`BlobService`] if the backend has one)
//! 2. Map backend-specific errors to [`StorageError`], marking throttling and
//!    network failures as transient
//! 3. Implement [`StorageConnector`] to build services from a
//!    [`StorageAccount`]
//!
//! The `conformance` module holds the checks every [`TableService`] must
//! pass. See the [`memory`] module source for a reference implementation.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (memory contexts, fault injection, assertion
//!   macros) and the `conformance` suite. Enable this in `[dev-dependencies]` for integration
//!   tests.

#![deny(unsafe_code)]

pub mod account;
pub mod blob;
pub mod blob_store;
pub mod codec;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub mod conformance;
pub mod connector;
pub mod context;
pub mod converter;
pub mod entity;
pub mod error;
pub mod keys;
pub mod memory;
pub mod metrics;
pub mod property;
pub mod query;
pub mod reference;
pub mod retry;
pub mod service;
pub mod table_store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use account::{Credentials, StorageAccount};
pub use blob::{
    BlobContent, BlobMetadata, BlobProperties, BlobService, ContainerAccess, MemoryBlobService,
};
pub use blob_store::{BlobStore, WriteOptions};
pub use config::StorageConfig;
pub use connector::StorageConnector;
pub use context::StorageContext;
pub use converter::{ConversionMode, Converted, EntityConverter, PropertyIssue};
pub use entity::{EntityMetadata, TableEntity};
pub use error::{BoxError, ConfigError, ConversionError, StorageError, StorageResult};
pub use keys::normalize_key;
pub use memory::{MemoryConnector, MemoryTableService};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use property::{EntityProperty, PropertyBag, PropertyKind, PropertyValue};
pub use query::{Filter, TableQuery};
pub use reference::{ContainerReference, ReferenceManager, TableReference};
pub use retry::{RetryConfig, RetryError, with_retry, with_retry_if};
pub use service::{
    BatchOperation, ContinuationToken, DynamicEntity, ETag, MAX_BATCH_SIZE, QuerySegment,
    TableService, VersionCondition,
};
pub use table_store::{KeySelector, TableStore, TableStoreBuilder};
pub use zeroize::Zeroizing;
