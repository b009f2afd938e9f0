//! Error types for the REST backend.
//!
//! This module maps HTTP statuses and the service's error codes onto the
//! generic [`StorageError`](cloudtable_storage::StorageError) type.

use cloudtable_storage::StorageError;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias for REST backend operations.
pub type Result<T> = std::result::Result<T, RestError>;

/// Error code returned when the addressed table does not exist.
pub const TABLE_NOT_FOUND: &str = "TableNotFound";

/// Error code returned when a table with the same name already exists.
pub const TABLE_ALREADY_EXISTS: &str = "TableAlreadyExists";

/// Error code returned while a deleted table is still being removed.
pub const TABLE_BEING_DELETED: &str = "TableBeingDeleted";

/// Errors specific to the REST backend.
#[derive(Debug, Error)]
pub enum RestError {
    /// The request never produced a response.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a failure status.
    #[error("{status} {code} for {key}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Service error code, empty when none was returned.
        code: String,
        /// Service error message.
        message: String,
        /// What the request addressed, usually `table/pk/rk`.
        key: String,
    },

    /// A response could not be understood.
    #[error("Invalid response: {0}")]
    Protocol(String),

    /// A request could not be signed.
    #[error("Request signing failed: {0}")]
    Signing(String),
}

impl RestError {
    /// Builds a status error from a response's status, error-code header and
    /// body.
    #[must_use]
    pub fn from_response(status: u16, header_code: Option<&str>, body: &str, key: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
        let code = header_code
            .map(str::to_owned)
            .or_else(|| parsed.as_ref().map(|d| d.code.clone()))
            .unwrap_or_default();
        let message = parsed
            .and_then(|d| d.message)
            .map(|m| m.value)
            .unwrap_or_else(|| body.chars().take(200).collect());
        Self::Status { status, code, message, key: key.to_owned() }
    }

    /// The HTTP status, when the service answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The service error code, when one was returned.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Status { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "odata.error")]
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: Option<ErrorMessage>,
}

#[derive(Deserialize)]
struct ErrorMessage {
    value: String,
}

impl From<RestError> for StorageError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Transport(source) => transport_error_to_storage_error(source),
            RestError::Status { status, code, message, key } => {
                status_to_storage_error(status, &code, message, key)
            },
            RestError::Protocol(message) => StorageError::serialization(message),
            RestError::Signing(message) => StorageError::internal(format!("Signing: {message}")),
        }
    }
}

fn transport_error_to_storage_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() {
        tracing::warn!(error = %err, "Table service request timed out");
        return StorageError::timeout();
    }
    if err.is_decode() {
        return StorageError::serialization_with_source("could not decode response body", err);
    }
    StorageError::connection_with_source("table service request failed", err)
}

fn status_to_storage_error(status: u16, code: &str, message: String, key: String) -> StorageError {
    match status {
        404 => StorageError::not_found(key),
        409 if code == TABLE_BEING_DELETED => {
            StorageError::unavailable(format!("{key}: {code}: {message}"))
        },
        409 => StorageError::already_exists(key),
        412 => StorageError::conflict(key),
        408 | 500 | 502 | 504 => StorageError::connection(format!("{status} {code}: {message}")),
        429 | 503 => StorageError::unavailable(format!("{status} {code}: {message}")),
        400 => StorageError::serialization(format!("{key} rejected: {code}: {message}")),
        401 | 403 => {
            tracing::error!(status, code, "Table service rejected credentials");
            StorageError::internal(format!("Auth error {status} {code}: {message}"))
        },
        _ => StorageError::internal(format!("HTTP {status} {code} for {key}: {message}")),
    }
}
