//! Entity-group transactions as `multipart/mixed` changesets.
//!
//! A batch request wraps one changeset; each operation is an embedded HTTP
//! request. The response mirrors the layout with one embedded response per
//! operation, or a single failing response when the changeset is rejected.

use std::fmt::Write as _;

use cloudtable_storage::{BatchOperation, ETag};
use uuid::Uuid;

use crate::{
    error::{RestError, Result},
    wire,
};

const CRLF: &str = "\r\n";

/// A rendered batch body and its content type.
#[derive(Debug)]
pub struct BatchRequest {
    /// Value for the `Content-Type` header.
    pub content_type: String,
    /// Request body.
    pub body: String,
}

/// Renders `operations` against `table_url` (the table's absolute URL) and
/// `entity_url` (the absolute URL of one row).
pub fn render(
    table_url: &str,
    entity_url: impl Fn(&str) -> String,
    partition_key: &str,
    operations: &[BatchOperation],
) -> BatchRequest {
    let batch = format!("batch_{}", Uuid::new_v4());
    let changeset = format!("changeset_{}", Uuid::new_v4());

    let mut body = String::new();
    let _ = write!(body, "--{batch}{CRLF}");
    let _ = write!(body, "Content-Type: multipart/mixed; boundary={changeset}{CRLF}{CRLF}");

    for operation in operations {
        let _ = write!(body, "--{changeset}{CRLF}");
        let _ = write!(body, "Content-Type: application/http{CRLF}");
        let _ = write!(body, "Content-Transfer-Encoding: binary{CRLF}{CRLF}");

        let (method, url, condition, payload) = match operation {
            BatchOperation::Insert(entity) => {
                ("POST", table_url.to_owned(), None, Some(wire::encode_entity(entity)))
            },
            BatchOperation::Replace(entity, condition) => (
                "PUT",
                entity_url(&entity.row_key),
                Some(condition.header_value().to_owned()),
                Some(wire::encode_entity(entity)),
            ),
            BatchOperation::InsertOrReplace(entity) => {
                ("PUT", entity_url(&entity.row_key), None, Some(wire::encode_entity(entity)))
            },
            BatchOperation::Delete { row_key, condition } => {
                ("DELETE", entity_url(row_key), Some(condition.header_value().to_owned()), None)
            },
        };

        let _ = write!(body, "{method} {url} HTTP/1.1{CRLF}");
        let _ = write!(body, "Accept: application/json;odata=minimalmetadata{CRLF}");
        let _ = write!(body, "DataServiceVersion: 3.0{CRLF}");
        if let Some(condition) = condition {
            let _ = write!(body, "If-Match: {condition}{CRLF}");
        }
        match payload {
            Some(payload) => {
                let _ = write!(body, "Content-Type: application/json{CRLF}");
                let _ = write!(body, "Prefer: return-no-content{CRLF}{CRLF}");
                let _ = write!(body, "{payload}{CRLF}");
            },
            None => body.push_str(CRLF),
        }
    }

    let _ = write!(body, "--{changeset}--{CRLF}{CRLF}--{batch}--{CRLF}");
    tracing::trace!(partition_key, operations = operations.len(), "Rendered batch");

    BatchRequest { content_type: format!("multipart/mixed; boundary={batch}"), body }
}

/// One embedded response.
#[derive(Debug, Default, PartialEq)]
pub struct PartResponse {
    /// HTTP status of the embedded response.
    pub status: u16,
    /// `ETag` header, if present.
    pub etag: Option<String>,
    /// Body text, empty for `204`.
    pub body: String,
}

/// Splits a batch response body into its embedded responses.
///
/// # Errors
///
/// Returns [`RestError::Protocol`] when a status line is malformed.
pub fn parse_response(body: &str) -> Result<Vec<PartResponse>> {
    let mut parts = Vec::new();
    let mut current: Option<PartResponse> = None;
    let mut in_body = false;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
            if let Some(done) = current.take() {
                parts.push(done);
            }
            let status = rest
                .split_whitespace()
                .next()
                .and_then(|code| code.parse().ok())
                .ok_or_else(|| RestError::Protocol(format!("bad status line: {line}")))?;
            current = Some(PartResponse { status, ..PartResponse::default() });
            in_body = false;
            continue;
        }
        let Some(part) = current.as_mut() else {
            continue;
        };
        if line.starts_with("--") {
            in_body = false;
            continue;
        }
        if in_body {
            part.body.push_str(line);
        } else if line.is_empty() {
            in_body = true;
        } else if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("etag")
        {
            part.etag = Some(value.trim().to_owned());
        }
    }
    if let Some(done) = current {
        parts.push(done);
    }
    Ok(parts)
}

/// Maps parsed responses back to one version token per operation, or the
/// first failure.
///
/// # Errors
///
/// Returns a [`RestError::Status`] for the failing operation, or
/// [`RestError::Protocol`] when the response count does not match.
pub fn collect_etags(
    parts: Vec<PartResponse>,
    operations: &[BatchOperation],
    key: &str,
) -> Result<Vec<Option<ETag>>> {
    if let Some(failed) = parts.iter().find(|p| p.status >= 300) {
        return Err(RestError::from_response(failed.status, None, &failed.body, key));
    }
    if parts.len() != operations.len() {
        return Err(RestError::Protocol(format!(
            "batch returned {} responses for {} operations",
            parts.len(),
            operations.len()
        )));
    }
    Ok(parts
        .into_iter()
        .zip(operations)
        .map(|(part, operation)| match operation {
            BatchOperation::Delete { .. } => None,
            _ => part.etag.map(ETag::new),
        })
        .collect())
}
