//! Storage configuration.
//!
//! [`StorageConfig`] carries the default connection string, the name prefix
//! applied to every table and container, and the retry policy used for
//! reference creation and store operations. It deserializes with serde and
//! can be read from the process environment with [`StorageConfig::from_env`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{account::StorageAccount, error::ConfigError, retry::RetryConfig};

/// Environment variable holding the default connection string.
pub const CONNECTION_STRING_ENV: &str = "STORAGE_CONNECTION_STRING";

/// Environment variable holding the name prefix.
pub const NAME_PREFIX_ENV: &str = "STORAGE_NAME_PREFIX";

/// Prefix placeholder replaced by the host name.
pub const MACHINE_NAME_PLACEHOLDER: &str = "{machine-name}";

/// Prefix placeholder replaced by the per-manager session id.
pub const SESSION_ID_PLACEHOLDER: &str = "{session-id}";

/// Storage configuration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cloudtable_storage::{RetryConfig, StorageConfig};
///
/// let config = StorageConfig::builder()
///     .connection_string("UseDevelopmentStorage=true")
///     .name_prefix("test{session-id}")
///     .retry(RetryConfig::builder().delay(Duration::from_millis(10)).build())
///     .build();
/// assert_eq!(config.retry.max_retries, 3);
/// ```
#[derive(Clone, Default, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Default connection string, used when a store has none of its own.
    #[serde(default)]
    #[builder(into)]
    pub connection_string: Option<String>,

    /// Prefix for table and container names. Supports
    /// `{machine-name}` and `{session-id}`.
    #[serde(default)]
    #[builder(into, default)]
    pub name_prefix: String,

    /// Retry policy for reference creation and store operations.
    #[serde(default)]
    #[builder(default)]
    pub retry: RetryConfig,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("connection_string", &self.connection_string.as_ref().map(|_| "<redacted>"))
            .field("name_prefix", &self.name_prefix)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StorageConfig {
    /// Reads [`CONNECTION_STRING_ENV`] and [`NAME_PREFIX_ENV`]. Unset or
    /// empty variables leave the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// As [`from_env`](Self::from_env), reading variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            connection_string: non_empty(CONNECTION_STRING_ENV),
            name_prefix: non_empty(NAME_PREFIX_ENV).unwrap_or_default(),
            retry: RetryConfig::default(),
        }
    }

    /// Checks that the default connection string, if any, parses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConnectionString`] when it does not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(connection_string) = &self.connection_string {
            StorageAccount::parse(connection_string)?;
        }
        Ok(())
    }
}

/// Substitutes the prefix placeholders.
#[must_use]
pub fn expand_prefix(prefix: &str, machine_name: &str, session_id: &str) -> String {
    prefix
        .replace(MACHINE_NAME_PLACEHOLDER, machine_name)
        .replace(SESSION_ID_PLACEHOLDER, session_id)
}

/// The host name, from `HOSTNAME` or `COMPUTERNAME`, else `localhost`.
#[must_use]
pub fn machine_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::*;

    #[test]
    fn test_from_lookup_reads_variables() {
        let vars = HashMap::from([
            (CONNECTION_STRING_ENV, "UseDevelopmentStorage=true".to_owned()),
            (NAME_PREFIX_ENV, "ci{session-id}".to_owned()),
        ]);
        let config = StorageConfig::from_lookup(|name| vars.get(name).cloned());
        assert_eq!(config.connection_string.as_deref(), Some("UseDevelopmentStorage=true"));
        assert_eq!(config.name_prefix, "ci{session-id}");
        config.validate().unwrap();
    }

    #[test]
    fn test_from_lookup_ignores_empty() {
        let config = StorageConfig::from_lookup(|_| Some("  ".to_owned()));
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_deserialize_with_humantime_retry() {
        let json = r#"{"name_prefix": "app", "retry": {"max_retries": 5, "delay": "250ms"}}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.connection_string, None);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.delay, Duration::from_millis(250));
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        assert!(serde_json::from_str::<StorageConfig>(r#"{"prefix": "x"}"#).is_err());
    }

    #[test]
    fn test_debug_redacts_connection_string() {
        let config = StorageConfig::builder().connection_string("AccountKey=secret").build();
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_validate_rejects_bad_connection_string() {
        let config = StorageConfig::builder().connection_string("nonsense").build();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConnectionString { .. })));
    }

    #[test]
    fn test_expand_prefix() {
        assert_eq!(expand_prefix("{machine-name}-{session-id}x", "box", "abc123"), "box-abc123x");
        assert_eq!(expand_prefix("plain", "box", "abc123"), "plain");
    }
}
