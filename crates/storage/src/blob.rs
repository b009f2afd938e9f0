//! Blob service abstraction and the in-memory implementation.
//!
//! Blobs are addressed by container and name. Every handle can render the
//! absolute URI of a container so that callers may hand out absolute blob
//! URIs and pass them back later.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// User metadata attached to a blob.
pub type BlobMetadata = BTreeMap<String, String>;

/// Public access level of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAccess {
    /// No anonymous access.
    #[default]
    Private,
    /// Anonymous read access to blobs.
    Blob,
    /// Anonymous read and list access.
    Container,
}

/// Properties stored alongside blob content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    /// `Content-Type`.
    pub content_type: Option<String>,
    /// `Content-Encoding`.
    pub content_encoding: Option<String>,
    /// `Content-Disposition`.
    pub content_disposition: Option<String>,
    /// User metadata.
    pub metadata: BlobMetadata,
}

/// Downloaded blob content and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContent {
    /// The bytes.
    pub data: Bytes,
    /// Properties and metadata.
    pub properties: BlobProperties,
}

/// A blob object store.
#[async_trait]
pub trait BlobService: Send + Sync + fmt::Debug {
    /// Absolute URI of a container, without a trailing slash.
    fn container_uri(&self, container: &str) -> String;

    /// Creates the container if missing. Returns `true` when created.
    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: ContainerAccess,
    ) -> StorageResult<bool>;

    /// Writes a blob, replacing any existing one. Returns its absolute URI.
    async fn upload(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        properties: BlobProperties,
    ) -> StorageResult<String>;

    /// Reads a blob.
    async fn download(&self, container: &str, name: &str) -> StorageResult<Option<BlobContent>>;

    /// Deletes a blob. Returns `false` when it did not exist.
    async fn delete_if_exists(&self, container: &str, name: &str) -> StorageResult<bool>;

    /// Absolute URIs of blobs whose names start with `prefix`, in name order.
    async fn list(&self, container: &str, prefix: Option<&str>) -> StorageResult<Vec<String>>;

    /// Metadata of an existing blob.
    async fn get_metadata(&self, container: &str, name: &str) -> StorageResult<BlobMetadata>;

    /// Replaces the metadata of an existing blob.
    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: BlobMetadata,
    ) -> StorageResult<()>;

    /// Returns `true` when the blob exists.
    async fn exists(&self, container: &str, name: &str) -> StorageResult<bool>;

    /// Blob URI with a read (or write) shared access signature appended.
    async fn shared_access_signature(
        &self,
        container: &str,
        name: &str,
        expiry: DateTime<Utc>,
        write: bool,
    ) -> StorageResult<String>;
}

#[derive(Debug, Default)]
struct Container {
    access: ContainerAccess,
    blobs: BTreeMap<String, BlobContent>,
}

/// Default endpoint of a [`MemoryBlobService`].
pub const MEMORY_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/memory";

/// In-memory [`BlobService`]. Clones share data.
#[derive(Clone)]
pub struct MemoryBlobService {
    endpoint: String,
    containers: Arc<RwLock<HashMap<String, Container>>>,
}

impl MemoryBlobService {
    /// Creates an empty service at [`MEMORY_BLOB_ENDPOINT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoint(MEMORY_BLOB_ENDPOINT)
    }

    /// Creates an empty service whose URIs start with `endpoint`.
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let mut endpoint = endpoint.into();
        while endpoint.ends_with('/') {
            endpoint.pop();
        }
        Self { endpoint, containers: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Access level of a container, if it exists.
    #[must_use]
    pub fn container_access(&self, container: &str) -> Option<ContainerAccess> {
        self.containers.read().get(container).map(|c| c.access)
    }

    fn blob_uri(&self, container: &str, name: &str) -> String {
        format!("{}/{name}", self.container_uri(container))
    }

    fn with_blob<R>(
        &self,
        container: &str,
        name: &str,
        f: impl FnOnce(&mut BlobContent) -> R,
    ) -> StorageResult<R> {
        let mut containers = self.containers.write();
        let blobs = &mut containers
            .get_mut(container)
            .ok_or_else(|| StorageError::not_found(container))?
            .blobs;
        let blob = blobs
            .get_mut(name)
            .ok_or_else(|| StorageError::not_found(format!("{container}/{name}")))?;
        Ok(f(blob))
    }
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBlobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobService")
            .field("endpoint", &self.endpoint)
            .field("containers", &self.containers.read().len())
            .finish()
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    fn container_uri(&self, container: &str) -> String {
        format!("{}/{container}", self.endpoint)
    }

    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: ContainerAccess,
    ) -> StorageResult<bool> {
        let mut containers = self.containers.write();
        if containers.contains_key(container) {
            return Ok(false);
        }
        containers.insert(container.to_owned(), Container { access, blobs: BTreeMap::new() });
        Ok(true)
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        properties: BlobProperties,
    ) -> StorageResult<String> {
        self.containers
            .write()
            .get_mut(container)
            .ok_or_else(|| StorageError::not_found(container))?
            .blobs
            .insert(name.to_owned(), BlobContent { data, properties });
        Ok(self.blob_uri(container, name))
    }

    async fn download(&self, container: &str, name: &str) -> StorageResult<Option<BlobContent>> {
        let containers = self.containers.read();
        let blobs =
            &containers.get(container).ok_or_else(|| StorageError::not_found(container))?.blobs;
        Ok(blobs.get(name).cloned())
    }

    async fn delete_if_exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        let mut containers = self.containers.write();
        let blobs = &mut containers
            .get_mut(container)
            .ok_or_else(|| StorageError::not_found(container))?
            .blobs;
        Ok(blobs.remove(name).is_some())
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let containers = self.containers.read();
        let blobs =
            &containers.get(container).ok_or_else(|| StorageError::not_found(container))?.blobs;
        Ok(blobs
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|name| self.blob_uri(container, name))
            .collect())
    }

    async fn get_metadata(&self, container: &str, name: &str) -> StorageResult<BlobMetadata> {
        self.with_blob(container, name, |blob| blob.properties.metadata.clone())
    }

    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: BlobMetadata,
    ) -> StorageResult<()> {
        self.with_blob(container, name, |blob| blob.properties.metadata = metadata)
    }

    async fn exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        Ok(self
            .containers
            .read()
            .get(container)
            .is_some_and(|c| c.blobs.contains_key(name)))
    }

    async fn shared_access_signature(
        &self,
        container: &str,
        name: &str,
        expiry: DateTime<Utc>,
        write: bool,
    ) -> StorageResult<String> {
        let permissions = if write { "w" } else { "r" };
        Ok(format!(
            "{}?se={}&sp={permissions}&sr=b&sig=memory",
            self.blob_uri(container, name),
            urlencode_colons(&expiry.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ))
    }
}

fn urlencode_colons(value: &str) -> String {
    value.replace(':', "%3A")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn test_upload_download_list_delete() {
        let service = MemoryBlobService::with_endpoint("http://blobs.test/acct/");
        let created = service.create_container_if_not_exists("docs", ContainerAccess::Blob);
        assert!(created.await.unwrap());
        let again = service.create_container_if_not_exists("docs", ContainerAccess::Private);
        assert!(!again.await.unwrap());
        assert_eq!(service.container_access("docs"), Some(ContainerAccess::Blob));

        let uri = service
            .upload("docs", "a/1.txt", Bytes::from_static(b"one"), BlobProperties::default())
            .await
            .unwrap();
        assert_eq!(uri, "http://blobs.test/acct/docs/a/1.txt");
        service
            .upload("docs", "b.txt", Bytes::from_static(b"two"), BlobProperties::default())
            .await
            .unwrap();

        assert_eq!(service.list("docs", Some("a/")).await.unwrap(), vec![uri.clone()]);
        assert_eq!(service.list("docs", None).await.unwrap().len(), 2);

        let content = service.download("docs", "a/1.txt").await.unwrap().unwrap();
        assert_eq!(content.data, Bytes::from_static(b"one"));

        assert!(service.delete_if_exists("docs", "a/1.txt").await.unwrap());
        assert!(!service.delete_if_exists("docs", "a/1.txt").await.unwrap());
        assert!(!service.exists("docs", "a/1.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_requires_existing_blob() {
        let service = MemoryBlobService::new();
        service.create_container_if_not_exists("c", ContainerAccess::Private).await.unwrap();
        assert!(service.get_metadata("c", "missing").await.unwrap_err().is_not_found());

        service.upload("c", "x", Bytes::new(), BlobProperties::default()).await.unwrap();
        let metadata = BlobMetadata::from([("k".to_owned(), "v".to_owned())]);
        service.set_metadata("c", "x", metadata.clone()).await.unwrap();
        assert_eq!(service.get_metadata("c", "x").await.unwrap(), metadata);
    }

    #[tokio::test]
    async fn test_shared_access_signature_format() {
        let service = MemoryBlobService::with_endpoint("http://b");
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let sas = service.shared_access_signature("c", "n", expiry, true).await.unwrap();
        assert_eq!(sas, "http://b/c/n?se=2030-01-01T00%3A00%3A00Z&sp=w&sr=b&sig=memory");
    }
}
