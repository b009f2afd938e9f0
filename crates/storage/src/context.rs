//! Shared storage context.
//!
//! A [`StorageContext`] holds the configuration, a runtime override for the
//! default connection string and the [`ReferenceManager`]. Stores receive it
//! as an `Arc`, so tests can build isolated contexts instead of mutating
//! process-wide state.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    config::StorageConfig, connector::StorageConnector, error::ConfigError,
    reference::ReferenceManager, retry::RetryConfig,
};

/// Configuration and reference cache shared by stores.
#[derive(Debug)]
pub struct StorageContext {
    config: StorageConfig,
    connection_override: RwLock<Option<String>>,
    references: ReferenceManager,
}

impl StorageContext {
    /// Creates a context serving accounts through `connector`.
    #[must_use]
    pub fn new(config: StorageConfig, connector: Arc<dyn StorageConnector>) -> Self {
        let references = ReferenceManager::new(connector, &config);
        Self { config, connection_override: RwLock::new(None), references }
    }

    /// Creates a context from [`StorageConfig::from_env`].
    #[must_use]
    pub fn from_env(connector: Arc<dyn StorageConnector>) -> Self {
        Self::new(StorageConfig::from_env(), connector)
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.config.retry
    }

    /// The reference cache.
    #[must_use]
    pub fn references(&self) -> &ReferenceManager {
        &self.references
    }

    /// Overrides the default connection string. Empty input is ignored.
    pub fn set_connection_string(&self, connection_string: impl Into<String>) {
        let connection_string = connection_string.into();
        if !connection_string.is_empty() {
            *self.connection_override.write() = Some(connection_string);
        }
    }

    /// Drops the override, restoring the configured default.
    pub fn reset_connection_string(&self) {
        *self.connection_override.write() = None;
    }

    /// The default connection string: the override if set, else the
    /// configured one.
    #[must_use]
    pub fn connection_string(&self) -> Option<String> {
        self.connection_override
            .read()
            .clone()
            .or_else(|| self.config.connection_string.clone())
            .filter(|s| !s.is_empty())
    }

    /// Picks the instance connection string if non-empty, else the default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingConnectionString`] naming `entity` when
    /// neither is available.
    pub fn resolve_connection_string(
        &self,
        instance: Option<&str>,
        entity: &'static str,
    ) -> Result<String, ConfigError> {
        instance
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .or_else(|| self.connection_string())
            .ok_or(ConfigError::MissingConnectionString { entity })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;

    fn context(default: Option<&str>) -> StorageContext {
        let config = StorageConfig {
            connection_string: default.map(str::to_owned),
            ..StorageConfig::default()
        };
        StorageContext::new(config, Arc::new(MemoryConnector::new()))
    }

    #[test]
    fn test_override_and_reset() {
        let ctx = context(Some("UseDevelopmentStorage=true"));
        ctx.set_connection_string("AccountName=a;AccountKey=b");
        assert_eq!(ctx.connection_string().as_deref(), Some("AccountName=a;AccountKey=b"));

        ctx.set_connection_string("");
        assert_eq!(ctx.connection_string().as_deref(), Some("AccountName=a;AccountKey=b"));

        ctx.reset_connection_string();
        assert_eq!(ctx.connection_string().as_deref(), Some("UseDevelopmentStorage=true"));
    }

    #[test]
    fn test_instance_connection_string_wins() {
        let ctx = context(Some("UseDevelopmentStorage=true"));
        assert_eq!(ctx.resolve_connection_string(Some("x"), "E").unwrap(), "x");
        assert_eq!(
            ctx.resolve_connection_string(Some(""), "E").unwrap(),
            "UseDevelopmentStorage=true"
        );
    }

    #[test]
    fn test_missing_connection_string_names_entity() {
        let ctx = context(None);
        let err = ctx.resolve_connection_string(None, "Order").unwrap_err();
        assert_eq!(err, ConfigError::MissingConnectionString { entity: "Order" });
        assert!(err.to_string().contains("Order"));
    }
}
