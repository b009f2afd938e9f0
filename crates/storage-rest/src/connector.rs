//! [`StorageConnector`] for the REST backend.

use std::sync::Arc;

use cloudtable_storage::{
    BlobService, StorageAccount, StorageConnector, StorageError, StorageResult, TableService,
};

use crate::{client::HttpTableService, config::RestClientConfig};

/// Builds [`HttpTableService`]s for parsed accounts.
///
/// All services built by one connector share a single HTTP client and its
/// connection pool. Blob storage is not served by this backend.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cloudtable_storage::{StorageConfig, StorageContext};
/// use cloudtable_storage_rest::{RestClientConfig, RestConnector};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = RestConnector::new(RestClientConfig::default())?;
/// let config = StorageConfig::builder()
///     .connection_string("AccountName=acct;AccountKey=c2VjcmV0")
///     .build();
/// let context = Arc::new(StorageContext::new(config, Arc::new(connector)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RestConnector {
    client: reqwest::Client,
    config: RestClientConfig,
}

impl RestConnector {
    /// Creates a connector with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: RestClientConfig) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    /// Creates a connector around an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: RestClientConfig) -> Self {
        Self { client, config }
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }
}

impl StorageConnector for RestConnector {
    fn table_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn TableService>> {
        let service =
            HttpTableService::with_client(account, self.client.clone(), self.config.clone())?;
        tracing::debug!(endpoint = service.endpoint(), "Built table service");
        Ok(Arc::new(service))
    }

    fn blob_service(&self, account: &StorageAccount) -> StorageResult<Arc<dyn BlobService>> {
        Err(StorageError::internal(format!(
            "blob storage for {} is not supported by the REST connector",
            account.name()
        )))
    }
}
