//! Blob store facade.
//!
//! [`BlobStore`] addresses blobs of one container by relative name or by
//! the absolute URI the service handed out earlier. The container is
//! resolved, and created if needed, on first use.

use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::OnceCell,
};
use uuid::Uuid;

use crate::{
    blob::{BlobMetadata, BlobProperties, ContainerAccess},
    context::StorageContext,
    error::{StorageError, StorageResult},
    reference::ContainerReference,
    retry::with_retry_if,
};

/// Options for [`BlobStore::write`].
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct WriteOptions {
    /// Blob name. A random UUID when absent.
    #[builder(into)]
    pub name: Option<String>,
    /// Download file name, stored as `attachment; filename=...`.
    #[builder(into)]
    pub friendly_name: Option<String>,
    /// `Content-Type`.
    #[builder(into)]
    pub content_type: Option<String>,
    /// `Content-Encoding`.
    #[builder(into)]
    pub content_encoding: Option<String>,
    /// User metadata.
    #[builder(default)]
    pub metadata: BlobMetadata,
}

impl WriteOptions {
    fn properties(&self) -> BlobProperties {
        BlobProperties {
            content_type: non_empty(self.content_type.as_deref()),
            content_encoding: non_empty(self.content_encoding.as_deref()),
            content_disposition: non_empty(self.friendly_name.as_deref())
                .map(|name| format!("attachment; filename={name}")),
            metadata: self.metadata.clone(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_owned)
}

/// Path component of an absolute URI, without query or fragment.
fn uri_path(uri: &str) -> &str {
    let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path = after_scheme.find('/').map_or("", |i| &after_scheme[i..]);
    path.split(['?', '#']).next().unwrap_or_default()
}

/// Blob name for `uri` inside the container at `container_uri`.
///
/// Relative names pass through. Absolute URIs (anything starting with
/// `http`) lose their container path.
pub fn relative_blob_name(uri: &str, container_uri: &str) -> StorageResult<String> {
    if !uri.starts_with("http") {
        return Ok(uri.to_owned());
    }
    let container_path = format!("{}/", uri_path(container_uri).trim_end_matches('/'));
    uri_path(uri)
        .strip_prefix(&container_path)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            StorageError::internal(format!("blob {uri} is not in container {container_uri}"))
        })
}

/// Facade over one blob container.
#[derive(Debug)]
pub struct BlobStore {
    context: Arc<StorageContext>,
    container_name: String,
    access: ContainerAccess,
    connection_string: Option<String>,
    container: OnceCell<Arc<ContainerReference>>,
}

impl BlobStore {
    /// A private container named `container_name` (before prefixing).
    #[must_use]
    pub fn new(context: Arc<StorageContext>, container_name: impl Into<String>) -> Self {
        Self {
            context,
            container_name: container_name.into(),
            access: ContainerAccess::Private,
            connection_string: None,
            container: OnceCell::new(),
        }
    }

    /// A store over an already resolved container.
    #[must_use]
    pub fn from_reference(
        context: Arc<StorageContext>,
        reference: Arc<ContainerReference>,
    ) -> Self {
        Self {
            context,
            container_name: reference.name().to_owned(),
            access: reference.access(),
            connection_string: None,
            container: OnceCell::new_with(Some(reference)),
        }
    }

    /// Sets the access level used if the container is created.
    #[must_use]
    pub fn with_access(mut self, access: ContainerAccess) -> Self {
        self.access = access;
        self
    }

    /// Uses this connection string instead of the context default.
    #[must_use]
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// The logical container name.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// The container handle, resolved once.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no connection string is
    /// available, or the reference manager's failure.
    pub async fn container(&self) -> StorageResult<&Arc<ContainerReference>> {
        self.container
            .get_or_try_init(|| async {
                let connection_string = self
                    .context
                    .resolve_connection_string(self.connection_string.as_deref(), "BlobStore")
                    .inspect_err(|e| {
                        tracing::error!(
                            container = %self.container_name,
                            error = %e,
                            "cannot resolve blob container"
                        );
                    })?;
                self.context
                    .references()
                    .container_reference(&connection_string, &self.container_name, self.access)
                    .await
            })
            .await
    }

    async fn retrying<F, Fut, R>(&self, operation: &'static str, call: F) -> StorageResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<R>>,
    {
        let policy = self.context.retry();
        Ok(with_retry_if(policy, operation, None, StorageError::is_transient, call).await?)
    }

    async fn resolve(&self, uri: &str) -> StorageResult<(&Arc<ContainerReference>, String)> {
        let container = self.container().await?;
        let name = relative_blob_name(uri, &container.uri())?;
        Ok((container, name))
    }

    /// Uploads everything `reader` yields. Returns the blob's absolute URI.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Internal`] if reading fails, or the last
    /// transient failure of the upload.
    #[tracing::instrument(skip(self, reader, options), fields(container = %self.container_name))]
    pub async fn write<R>(&self, mut reader: R, options: WriteOptions) -> StorageResult<String>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| StorageError::internal_with_source("could not read blob content", e))?;
        let data = Bytes::from(buffer);

        let container = self.container().await?;
        let name = options.name.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let properties = options.properties();

        let uri = self.retrying("upload", || {
            container.service().upload(container.name(), &name, data.clone(), properties.clone())
        })
        .await?;
        tracing::debug!(blob = %name, bytes = data.len(), "uploaded blob");
        Ok(uri)
    }

    /// Streams the blob into `writer` and returns its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for a missing blob, or
    /// [`StorageError::Internal`] if writing fails.
    pub async fn download_to<W>(&self, uri: &str, mut writer: W) -> StorageResult<BlobMetadata>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (container, name) = self.resolve(uri).await?;
        let content = self
            .retrying("download", || container.service().download(container.name(), &name))
            .await?
            .ok_or_else(|| StorageError::not_found(uri))?;

        writer
            .write_all(&content.data)
            .await
            .map_err(|e| StorageError::internal_with_source("could not write blob content", e))?;
        writer
            .flush()
            .await
            .map_err(|e| StorageError::internal_with_source("could not write blob content", e))?;
        Ok(content.properties.metadata)
    }

    /// Metadata of an existing blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for a missing blob.
    pub async fn get_metadata(&self, uri: &str) -> StorageResult<BlobMetadata> {
        let (container, name) = self.resolve(uri).await?;
        self.retrying("get_metadata", || container.service().get_metadata(container.name(), &name))
            .await
    }

    /// Merges `metadata` into the blob's existing metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for a missing blob.
    pub async fn update_metadata(&self, uri: &str, metadata: BlobMetadata) -> StorageResult<()> {
        let (container, name) = self.resolve(uri).await?;
        let service = container.service();
        let mut merged =
            self.retrying("get_metadata", || service.get_metadata(container.name(), &name)).await?;
        merged.extend(metadata);

        self.retrying("set_metadata", || {
            service.set_metadata(container.name(), &name, merged.clone())
        })
        .await
    }

    /// Deletes the blob if it exists. Returns `true` when it did.
    ///
    /// # Errors
    ///
    /// The last transient failure.
    pub async fn delete(&self, uri: &str) -> StorageResult<bool> {
        let (container, name) = self.resolve(uri).await?;
        self.retrying("delete_blob", || {
            container.service().delete_if_exists(container.name(), &name)
        })
        .await
    }

    /// Absolute URIs of blobs whose names start with `prefix`.
    ///
    /// # Errors
    ///
    /// The last transient failure.
    pub async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let container = self.container().await?;
        self.retrying("list_blobs", || container.service().list(container.name(), prefix)).await
    }

    /// Returns `true` when the blob exists.
    ///
    /// # Errors
    ///
    /// The last transient failure.
    pub async fn exists(&self, uri: &str) -> StorageResult<bool> {
        let (container, name) = self.resolve(uri).await?;
        self.retrying("blob_exists", || container.service().exists(container.name(), &name)).await
    }

    /// Blob URI carrying a signature valid for `valid_for`, granting write
    /// access when `write` is set and read access otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Internal`] when `valid_for` is out of range.
    pub async fn shared_access_signature(
        &self,
        uri: &str,
        valid_for: Duration,
        write: bool,
    ) -> StorageResult<String> {
        let (container, name) = self.resolve(uri).await?;
        let valid_for = chrono::Duration::from_std(valid_for)
            .map_err(|e| StorageError::internal_with_source("signature lifetime out of range", e))?;
        let expiry = Utc::now()
            .checked_add_signed(valid_for)
            .ok_or_else(|| StorageError::internal("signature lifetime out of range"))?;
        container.service().shared_access_signature(container.name(), &name, expiry, write).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        blob::{BlobService, MemoryBlobService},
        memory::MemoryTableService,
        testutil::{FixedConnector, FlakyBlobService},
    };

    const CONTAINER: &str = "http://127.0.0.1:10000/devstoreaccount1/invoices";

    #[test]
    fn test_relative_names_pass_through() {
        assert_eq!(relative_blob_name("2024/a.pdf", CONTAINER).unwrap(), "2024/a.pdf");
    }

    #[test]
    fn test_absolute_uri_loses_container_path() {
        let uri = format!("{CONTAINER}/2024/a.pdf?se=2030&sig=x");
        assert_eq!(relative_blob_name(&uri, CONTAINER).unwrap(), "2024/a.pdf");
    }

    #[test]
    fn test_foreign_container_rejected() {
        let err = relative_blob_name("http://127.0.0.1:10000/devstoreaccount1/other/a", CONTAINER);
        assert!(err.is_err());
    }

    #[test]
    fn test_friendly_name_becomes_disposition() {
        let options = WriteOptions::builder().friendly_name("report.pdf").content_type("").build();
        let properties = options.properties();
        assert_eq!(
            properties.content_disposition.as_deref(),
            Some("attachment; filename=report.pdf")
        );
        assert_eq!(properties.content_type, None);
    }

    #[tokio::test]
    async fn test_signature_lifetime_overflow_is_an_error() {
        let store = BlobStore::new(crate::testutil::memory_context(), "invoices");
        let far_future = Duration::from_secs(10_000_000_000_000);
        let err = store.shared_access_signature("a.pdf", far_future, false).await.unwrap_err();
        assert!(matches!(err, StorageError::Internal { .. }), "{err:?}");

        let uri = store.shared_access_signature("a.pdf", Duration::from_secs(60), false).await;
        assert!(uri.is_ok());
    }

    #[tokio::test]
    async fn test_update_metadata_retries_the_read() {
        let blobs = Arc::new(FlakyBlobService::new(Arc::new(MemoryBlobService::new()), 0));
        let connector = FixedConnector::new(Arc::new(MemoryTableService::new()))
            .with_blobs(Arc::clone(&blobs) as Arc<dyn BlobService>);
        let store = BlobStore::new(crate::testutil::context_with(Arc::new(connector)), "invoices");

        let options = WriteOptions::builder()
            .name("a.pdf")
            .metadata(BlobMetadata::from([("owner".to_owned(), "ann".to_owned())]))
            .build();
        let uri = store.write(&b"%PDF"[..], options).await.unwrap();

        blobs.fail_next(2);
        let update = BlobMetadata::from([("state".to_owned(), "paid".to_owned())]);
        store.update_metadata(&uri, update).await.unwrap();

        let metadata = store.get_metadata(&uri).await.unwrap();
        assert_eq!(metadata.get("owner").map(String::as_str), Some("ann"));
        assert_eq!(metadata.get("state").map(String::as_str), Some("paid"));
    }
}
