//! Configuration for the REST table-service backend.
//!
//! This module provides [`RestClientConfig`], which controls the HTTP client
//! shared by every table of one account.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default request timeout (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Service API version sent in `x-ms-version`.
pub const DEFAULT_API_VERSION: &str = "2019-02-02";

/// Configuration for [`HttpTableService`](crate::HttpTableService).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cloudtable_storage_rest::RestClientConfig;
///
/// let config = RestClientConfig::builder()
///     .timeout(Duration::from_secs(10))
///     .user_agent("orders-service/1.4")
///     .build();
/// assert_eq!(config.api_version(), "2019-02-02");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RestClientConfig {
    /// Whole-request timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    #[builder(default = DEFAULT_TIMEOUT)]
    pub(crate) timeout: Duration,

    /// Connection establishment timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub(crate) connect_timeout: Duration,

    /// Value of the `x-ms-version` header.
    #[serde(default = "default_api_version")]
    #[builder(into, default = default_api_version())]
    pub(crate) api_version: String,

    /// Value of the `User-Agent` header.
    #[serde(default = "default_user_agent")]
    #[builder(into, default = default_user_agent())]
    pub(crate) user_agent: String,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_owned()
}

fn default_user_agent() -> String {
    concat!("cloudtable-storage/", env!("CARGO_PKG_VERSION")).to_owned()
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RestClientConfig {
    /// Returns the request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the API version header value.
    #[must_use]
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Returns the user agent.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}
