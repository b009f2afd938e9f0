//! Storage error types and result alias.
//!
//! Every backend maps its internal failures onto [`StorageError`]. The split
//! between variants matters to callers:
//!
//! - [`StorageError::NotFound`] - the addressed row, table or blob does not exist
//! - [`StorageError::AlreadyExists`] - an insert hit an existing row
//! - [`StorageError::Conflict`] - a version token no longer matches the stored row
//! - [`StorageError::Connection`], [`StorageError::Unavailable`], [`StorageError::Timeout`] -
//!   transient failures, the only ones retried automatically
//! - [`StorageError::Config`] - construction or initialization problems, never retried
//! - [`StorageError::Conversion`] - an entity could not be mapped to or from a property bag
//!
//! # Example
//!
//! ```
//! use cloudtable_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! assert!(!lookup("sales/widget-1").unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::property::PropertyKind;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested row, table or blob was not found.
    #[error("Not found: {key}")]
    NotFound {
        /// Identifies what was not found, usually `table/pk/rk`.
        key: String,
    },

    /// An insert targeted a row that already exists.
    #[error("Already exists: {key}")]
    AlreadyExists {
        /// The row that already exists.
        key: String,
    },

    /// The version token sent with a write no longer matches the stored row.
    ///
    /// Conflicts are never retried by the store. Callers decide whether to
    /// re-read and try again.
    #[error("Version conflict: {key}")]
    Conflict {
        /// The row whose version changed.
        key: String,
    },

    /// A conditional operation was issued for an entity that carries no
    /// version token and the caller did not ask to ignore it.
    #[error("{operation} requires a version token or ignore_etag")]
    VersionTokenRequired {
        /// The operation that needed the token.
        operation: &'static str,
    },

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The service is throttling or temporarily unable to serve the request.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Description returned by the service.
        message: String,
    },

    /// Serialization or deserialization error on the wire.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// An entity could not be converted to or from its property bag.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Invalid configuration detected at construction or initialization.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,

    /// Operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `AlreadyExists` error for the given key.
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Creates a new `Conflict` error for the given key.
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Unavailable` error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error wrapping an already shared source.
    #[must_use]
    pub fn internal_with_shared(message: impl Into<String>, source: BoxError) -> Self {
        Self::Internal { message: message.into(), source: Some(source) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for failures worth retrying: connection problems,
    /// throttling and timeouts.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Unavailable { .. } | Self::Timeout)
    }

    /// Returns `true` if this is a [`StorageError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a [`StorageError::Conflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Which key marker a configuration error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMarker {
    /// `#[partition_key]`
    PartitionKey,
    /// `#[row_key]`
    RowKey,
}

impl std::fmt::Display for KeyMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartitionKey => f.write_str("partition_key"),
            Self::RowKey => f.write_str("row_key"),
        }
    }
}

/// Configuration errors. Raised at construction or initialization and
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The entity type exposes no metadata slots and no field carries the marker.
    #[error("missing {marker} marker on {entity}")]
    MissingKeyMarker {
        /// The missing marker.
        marker: KeyMarker,
        /// The entity type name.
        entity: &'static str,
    },

    /// More than one field carries the same key marker.
    #[error("more than one field of {entity} is marked {marker}")]
    AmbiguousKeyMarker {
        /// The duplicated marker.
        marker: KeyMarker,
        /// The entity type name.
        entity: &'static str,
    },

    /// Two fields map to the same storage property name.
    #[error("storage name {name:?} is used by more than one field of {entity}")]
    DuplicateStorageName {
        /// The duplicated storage name.
        name: &'static str,
        /// The entity type name.
        entity: &'static str,
    },

    /// The requested batch size exceeds the service limit.
    #[error("cannot set a maximum batch size of {requested}, the limit is {maximum}")]
    BatchSizeExceeded {
        /// The requested size.
        requested: usize,
        /// The service limit.
        maximum: usize,
    },

    /// Neither the store nor the context provides a connection string.
    #[error(
        "initialisation failed for the table store of {entity}: no instance connection string \
         and no default connection string configured"
    )]
    MissingConnectionString {
        /// The entity type name.
        entity: &'static str,
    },

    /// The connection string could not be parsed.
    #[error("invalid connection string: {reason}")]
    InvalidConnectionString {
        /// Why parsing failed.
        reason: String,
    },

    /// A table or container name is empty after normalization.
    #[error("invalid {kind} name {name:?}")]
    InvalidName {
        /// `"table"` or `"container"`.
        kind: &'static str,
        /// The name as supplied.
        name: String,
    },
}

/// Errors raised while converting a single property value.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ConversionError {
    /// The stored property kind cannot be coerced into the field type.
    #[error("expected a {expected} property, found {found}")]
    TypeMismatch {
        /// The kind the field accepts.
        expected: PropertyKind,
        /// The kind found in the bag.
        found: PropertyKind,
    },

    /// The value has the right kind but could not be interpreted.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// Description of the problem.
        message: String,
    },

    /// Structured-text encoding or decoding failed.
    #[error("structured text error for {type_name}: {source}")]
    Structured {
        /// The declared Rust type.
        type_name: &'static str,
        /// The JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A conversion failure annotated with the field it happened on.
    #[error("could not convert property {entity}.{property}: {source}")]
    Property {
        /// The entity type name.
        entity: &'static str,
        /// The field name.
        property: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<ConversionError>,
    },
}

impl ConversionError {
    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue { message: message.into() }
    }

    /// Wraps this error with the entity and field it occurred on.
    #[must_use]
    pub fn in_property(self, entity: &'static str, property: &'static str) -> Self {
        Self::Property { entity, property, source: Box::new(self) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::connection("reset").is_transient());
        assert!(StorageError::unavailable("server busy").is_transient());
        assert!(StorageError::timeout().is_transient());

        assert!(!StorageError::conflict("t/pk/rk").is_transient());
        assert!(!StorageError::not_found("t/pk/rk").is_transient());
        assert!(!StorageError::already_exists("t/pk/rk").is_transient());
        assert!(!StorageError::Cancelled.is_transient());
        assert!(!StorageError::from(ConfigError::BatchSizeExceeded { requested: 101, maximum: 100 })
            .is_transient());
    }

    #[test]
    fn test_missing_marker_message_names_marker_and_entity() {
        let err = ConfigError::MissingKeyMarker { marker: KeyMarker::RowKey, entity: "Product" };
        assert_eq!(err.to_string(), "missing row_key marker on Product");
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = StorageError::connection_with_source("request failed", io);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("request failed"));
    }

    #[test]
    fn test_property_context_wraps_source() {
        let err = ConversionError::invalid_value("bad").in_property("Order", "total");
        assert_eq!(err.to_string(), "could not convert property Order.total: invalid value: bad");
        assert!(err.source().is_some());
    }
}
