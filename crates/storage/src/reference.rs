//! Memoized account, table and container handles.
//!
//! [`ReferenceManager`] resolves a connection string and a logical name to
//! a shared handle, creating the table or container on first use. Handles
//! are keyed by `connection identity/normalized name` and live as long as
//! the manager.
//!
//! # Single-winner creation
//!
//! Lookups go through [`moka::future::Cache::try_get_with`]: concurrent
//! first callers for one key share a single initialization future, so the
//! create call is issued once and every caller receives the same handle.
//! A failed initialization is not cached; the next caller tries again.
//!
//! ```text
//! connection string ──► StorageAccount ──► StorageConnector ──► Arc<dyn TableService>
//!                                                                      │
//! logical name ──► prefix + normalize ──► create_table_if_not_exists (retried)
//!                                                                      │
//!                                                       Arc<TableReference> (cached)
//! ```

use std::{fmt, sync::Arc};

use moka::future::Cache;
use uuid::Uuid;

use crate::{
    account::StorageAccount,
    blob::{BlobService, ContainerAccess},
    config::{StorageConfig, expand_prefix, machine_name},
    connector::StorageConnector,
    error::{ConfigError, StorageError, StorageResult},
    keys,
    retry::{RetryConfig, with_retry},
    service::TableService,
};

/// Length of the per-manager session id.
pub const SESSION_ID_LEN: usize = 6;

/// A resolved table: its normalized name, its account and the service
/// that serves it.
#[derive(Debug, Clone)]
pub struct TableReference {
    name: String,
    account: Arc<StorageAccount>,
    service: Arc<dyn TableService>,
}

impl TableReference {
    /// Wraps an existing table. No creation call is made.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        account: Arc<StorageAccount>,
        service: Arc<dyn TableService>,
    ) -> Self {
        Self { name: name.into(), account, service }
    }

    /// The normalized table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning account.
    #[must_use]
    pub fn account(&self) -> &Arc<StorageAccount> {
        &self.account
    }

    /// The service handle.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn TableService> {
        &self.service
    }
}

/// A resolved blob container.
#[derive(Debug, Clone)]
pub struct ContainerReference {
    name: String,
    access: ContainerAccess,
    account: Arc<StorageAccount>,
    service: Arc<dyn BlobService>,
}

impl ContainerReference {
    /// Wraps an existing container. No creation call is made.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        access: ContainerAccess,
        account: Arc<StorageAccount>,
        service: Arc<dyn BlobService>,
    ) -> Self {
        Self { name: name.into(), access, account, service }
    }

    /// The normalized container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The access level requested at creation.
    #[must_use]
    pub fn access(&self) -> ContainerAccess {
        self.access
    }

    /// The owning account.
    #[must_use]
    pub fn account(&self) -> &Arc<StorageAccount> {
        &self.account
    }

    /// The service handle.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn BlobService> {
        &self.service
    }

    /// Absolute URI of the container.
    #[must_use]
    pub fn uri(&self) -> String {
        self.service.container_uri(&self.name)
    }
}

/// Process-lifetime cache of storage handles.
pub struct ReferenceManager {
    connector: Arc<dyn StorageConnector>,
    retry: RetryConfig,
    prefix: String,
    session_id: String,
    accounts: Cache<String, Arc<StorageAccount>>,
    table_services: Cache<String, Arc<dyn TableService>>,
    blob_services: Cache<String, Arc<dyn BlobService>>,
    tables: Cache<String, Arc<TableReference>>,
    containers: Cache<String, Arc<ContainerReference>>,
}

impl fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("connector", &self.connector)
            .field("prefix", &self.prefix)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Recovers a `StorageError` shared by moka between waiting callers.
fn unshare(err: Arc<StorageError>) -> StorageError {
    match Arc::try_unwrap(err) {
        Ok(err) => err,
        Err(shared) => match shared.as_ref() {
            StorageError::Config(config) => StorageError::Config(config.clone()),
            other => StorageError::internal_with_shared(other.to_string(), shared),
        },
    }
}

impl ReferenceManager {
    /// Creates an empty manager. Placeholders in the configured prefix are
    /// expanded now, with a fresh session id.
    #[must_use]
    pub fn new(connector: Arc<dyn StorageConnector>, config: &StorageConfig) -> Self {
        let session_id: String =
            Uuid::new_v4().simple().to_string().chars().take(SESSION_ID_LEN).collect();
        let prefix = expand_prefix(&config.name_prefix, &machine_name(), &session_id);
        Self {
            connector,
            retry: config.retry,
            prefix,
            session_id,
            accounts: Cache::builder().build(),
            table_services: Cache::builder().build(),
            blob_services: Cache::builder().build(),
            tables: Cache::builder().build(),
            containers: Cache::builder().build(),
        }
    }

    /// The session id substituted for `{session-id}`.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The expanded name prefix.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.prefix
    }

    /// The physical table name for a logical one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidName`] when nothing survives
    /// normalization.
    pub fn table_name(&self, name: &str) -> Result<String, ConfigError> {
        keys::table_name(&format!("{}{name}", self.prefix))
    }

    /// The physical container name for a logical one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidName`] when nothing survives
    /// normalization.
    pub fn container_name(&self, name: &str) -> Result<String, ConfigError> {
        keys::container_name(&format!("{}-{name}", self.prefix))
    }

    /// The parsed account for a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the string does not parse.
    pub async fn account(&self, connection_string: &str) -> StorageResult<Arc<StorageAccount>> {
        self.accounts
            .try_get_with(connection_string.to_owned(), async {
                StorageAccount::parse(connection_string).map(Arc::new).map_err(StorageError::from)
            })
            .await
            .map_err(unshare)
    }

    async fn table_service(
        &self,
        account: &Arc<StorageAccount>,
    ) -> StorageResult<Arc<dyn TableService>> {
        self.table_services
            .try_get_with(account.connection_identity().to_owned(), async {
                self.connector.table_service(account)
            })
            .await
            .map_err(unshare)
    }

    async fn blob_service(
        &self,
        account: &Arc<StorageAccount>,
    ) -> StorageResult<Arc<dyn BlobService>> {
        self.blob_services
            .try_get_with(account.connection_identity().to_owned(), async {
                self.connector.blob_service(account)
            })
            .await
            .map_err(unshare)
    }

    /// The handle for table `name`, creating the table on first use.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a bad connection string or name,
    /// or [`StorageError::Internal`] wrapping the last failure when the
    /// table could not be created within the retry budget.
    #[tracing::instrument(skip(self, connection_string))]
    pub async fn table_reference(
        &self,
        connection_string: &str,
        name: &str,
    ) -> StorageResult<Arc<TableReference>> {
        let table = self.table_name(name)?;
        let account = self.account(connection_string).await?;
        let key = format!("{}/{table}", account.connection_identity());

        self.tables
            .try_get_with(key, async {
                let service = self.table_service(&account).await?;
                let created = with_retry(&self.retry, "create_table", None, || {
                    service.create_table_if_not_exists(&table)
                })
                .await
                .map_err(|e| {
                    StorageError::internal_with_source(format!("could not create table {table}"), e)
                })?;
                if created {
                    tracing::info!(table = %table, "created table");
                }
                let reference = TableReference::new(table.clone(), account.clone(), service);
                Ok::<_, StorageError>(Arc::new(reference))
            })
            .await
            .map_err(unshare)
    }

    /// The handle for container `name`, creating it with `access` on first
    /// use.
    ///
    /// # Errors
    ///
    /// As [`table_reference`](Self::table_reference).
    #[tracing::instrument(skip(self, connection_string))]
    pub async fn container_reference(
        &self,
        connection_string: &str,
        name: &str,
        access: ContainerAccess,
    ) -> StorageResult<Arc<ContainerReference>> {
        let container = self.container_name(name)?;
        let account = self.account(connection_string).await?;
        let key = format!("{}/{container}", account.connection_identity());

        self.containers
            .try_get_with(key, async {
                let service = self.blob_service(&account).await?;
                let created = with_retry(&self.retry, "create_container", None, || {
                    service.create_container_if_not_exists(&container, access)
                })
                .await
                .map_err(|e| {
                    StorageError::internal_with_source(
                        format!("could not create blob container {container}"),
                        e,
                    )
                })?;
                if created {
                    tracing::info!(container = %container, ?access, "created blob container");
                }
                Ok::<_, StorageError>(Arc::new(ContainerReference::new(
                    container.clone(),
                    access,
                    account.clone(),
                    service,
                )))
            })
            .await
            .map_err(unshare)
    }

    /// Number of cached table handles.
    pub async fn table_count(&self) -> u64 {
        self.tables.run_pending_tasks().await;
        self.tables.entry_count()
    }

    /// Number of cached container handles.
    pub async fn container_count(&self) -> u64 {
        self.containers.run_pending_tasks().await;
        self.containers.entry_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryConnector;

    fn manager(prefix: &str) -> (MemoryConnector, ReferenceManager) {
        let connector = MemoryConnector::new();
        let config = StorageConfig::builder()
            .name_prefix(prefix)
            .retry(RetryConfig::builder().delay(Duration::from_millis(1)).build())
            .build();
        (connector.clone(), ReferenceManager::new(Arc::new(connector), &config))
    }

    #[test]
    fn test_session_id_and_prefix_expansion() {
        let (_, manager) = manager("t{session-id}");
        assert_eq!(manager.session_id().len(), SESSION_ID_LEN);
        assert_eq!(manager.name_prefix(), format!("t{}", manager.session_id()));
        assert_eq!(
            manager.table_name("Orders_2024").unwrap(),
            format!("t{}orders2024", manager.session_id())
        );
    }

    #[test]
    fn test_container_name_trims_leading_hyphen_without_prefix() {
        let (_, manager) = manager("");
        assert_eq!(manager.container_name("Invoices").unwrap(), "invoices");
        assert!(manager.table_name("__").is_err());
    }

    #[tokio::test]
    async fn test_table_reference_is_cached_and_creates_once() {
        let (connector, manager) = manager("");
        let first = manager.table_reference("UseDevelopmentStorage=true", "Orders").await.unwrap();
        let second = manager.table_reference("UseDevelopmentStorage=true", "orders").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "orders");
        assert_eq!(manager.table_count().await, 1);

        let (tables, _) = connector.services(&StorageAccount::development());
        assert_eq!(tables.table_names(), vec!["orders".to_owned()]);
    }

    #[tokio::test]
    async fn test_bad_connection_string_is_config_error_and_not_cached() {
        let (_, manager) = manager("");
        let err = manager.table_reference("garbage", "orders").await.unwrap_err();
        assert!(matches!(err, StorageError::Config(ConfigError::InvalidConnectionString { .. })));
        assert_eq!(manager.table_count().await, 0);
    }

    #[tokio::test]
    async fn test_container_reference_uri() {
        let (_, manager) = manager("app");
        let container = manager
            .container_reference("UseDevelopmentStorage=true", "Docs", ContainerAccess::Blob)
            .await
            .unwrap();
        assert_eq!(container.name(), "app-docs");
        assert_eq!(container.uri(), "http://127.0.0.1:10000/devstoreaccount1/app-docs");
        assert_eq!(manager.container_count().await, 1);
    }
}
