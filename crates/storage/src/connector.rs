//! Connectors turn a parsed account into service handles.

use std::{fmt, sync::Arc};

use crate::{
    account::StorageAccount, blob::BlobService, error::StorageResult, service::TableService,
};

/// Builds service handles for an account.
///
/// Called once per account by the [`ReferenceManager`](crate::ReferenceManager);
/// the handles are shared by every table and container of that account.
pub trait StorageConnector: Send + Sync + fmt::Debug {
    /// The table service for `account`.
    ///
    /// # Errors
    ///
    /// Returns an error when the connector cannot serve the account, for
    /// example because its credentials are unusable.
    fn table_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn TableService>>;

    /// The blob service for `account`.
    ///
    /// # Errors
    ///
    /// As [`table_service`](Self::table_service), or when the connector has
    /// no blob support.
    fn blob_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn BlobService>>;
}
