//! HTTP implementation of [`TableService`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cloudtable_storage::{
    BatchOperation, ConfigError, ContinuationToken, DynamicEntity, ETag, MAX_BATCH_SIZE,
    QuerySegment, StorageAccount, StorageError, StorageResult, TableQuery, TableService,
    VersionCondition, service::row_path,
};
use reqwest::{Method, RequestBuilder, Response, Url, header};
use serde_json::{Value, json};

use crate::{
    auth::{RequestSigner, http_date},
    batch,
    config::RestClientConfig,
    error::{RestError, Result, TABLE_ALREADY_EXISTS, TABLE_NOT_FOUND},
    wire,
};

const ACCEPT_JSON: &str = "application/json;odata=minimalmetadata";
const DATA_SERVICE_VERSION: &str = "3.0";
const MAX_DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const RETURN_NO_CONTENT: &str = "return-no-content";
const ERROR_CODE_HEADER: &str = "x-ms-error-code";
const NEXT_PARTITION_KEY_HEADER: &str = "x-ms-continuation-NextPartitionKey";
const NEXT_ROW_KEY_HEADER: &str = "x-ms-continuation-NextRowKey";

/// Escapes a key for use inside a quoted entity address.
#[must_use]
pub fn escape_key(key: &str) -> String {
    urlencoding::encode(&key.replace('\'', "''")).into_owned()
}

/// A [`TableService`] speaking the table REST protocol over HTTPS.
///
/// One instance serves every table of one account and is shared through an
/// `Arc` by the reference cache. The inner [`reqwest::Client`] pools
/// connections.
#[derive(Clone)]
pub struct HttpTableService {
    client: reqwest::Client,
    endpoint: Arc<str>,
    signer: RequestSigner,
    config: RestClientConfig,
}

impl std::fmt::Debug for HttpTableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTableService")
            .field("endpoint", &self.endpoint)
            .field("signer", &self.signer)
            .field("api_version", &self.config.api_version)
            .finish_non_exhaustive()
    }
}

impl HttpTableService {
    /// Creates a service for `account` with a fresh HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the account key is not valid base64 or the HTTP
    /// client cannot be built.
    pub fn new(account: &StorageAccount, config: RestClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Self::with_client(account, client, config)
    }

    /// Creates a service sharing an existing HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the account key is not valid base64.
    pub fn with_client(
        account: &StorageAccount,
        client: reqwest::Client,
        config: RestClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: Arc::from(account.table_endpoint().trim_end_matches('/')),
            signer: RequestSigner::for_account(account)?,
            config,
        })
    }

    /// Base URI requests are sent to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.absolute(path))
            .map_err(|e| RestError::Protocol(format!("invalid request URL for {path}: {e}")))?;
        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&encoded));
        }
        Ok(url)
    }

    fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
        format!(
            "{table}(PartitionKey='{}',RowKey='{}')",
            escape_key(partition_key),
            escape_key(row_key)
        )
    }

    /// Starts a signed request with the protocol headers every call carries.
    fn request(&self, method: Method, mut url: Url) -> Result<RequestBuilder> {
        self.signer.decorate(&mut url);
        let date = http_date(Utc::now());
        let authorization = self.signer.authorization(&date, &url)?;

        let mut builder = self
            .client
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", self.config.api_version.as_str())
            .header(header::ACCEPT, ACCEPT_JSON)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", MAX_DATA_SERVICE_VERSION);
        if let Some(authorization) = authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        Ok(builder)
    }

    /// Sends a request and turns failure statuses into [`RestError::Status`].
    async fn execute(&self, builder: RequestBuilder, key: &str) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            status = status.as_u16(),
            code = ?code,
            key,
            "Table service request failed"
        );
        Err(RestError::from_response(status.as_u16(), code.as_deref(), &body, key))
    }

    fn json_body(builder: RequestBuilder, body: &Value) -> RequestBuilder {
        builder.header(header::CONTENT_TYPE, "application/json").body(body.to_string())
    }

    fn conditional(
        builder: RequestBuilder,
        condition: Option<&VersionCondition>,
    ) -> RequestBuilder {
        match condition {
            Some(condition) => builder.header(header::IF_MATCH, condition.header_value()),
            None => builder,
        }
    }

    fn response_etag(response: &Response) -> Result<ETag> {
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ETag::new)
            .ok_or_else(|| RestError::Protocol("write response has no ETag".to_owned()))
    }

    async fn write_entity(
        &self,
        method: Method,
        table: &str,
        entity: &DynamicEntity,
        condition: Option<&VersionCondition>,
    ) -> Result<ETag> {
        let key = entity.describe(table);
        let path = Self::entity_path(table, &entity.partition_key, &entity.row_key);
        let builder = self.request(method, self.url(&path, &[])?)?;
        let builder = Self::json_body(builder, &wire::encode_entity(entity));
        let builder = Self::conditional(builder, condition);
        let response = self.execute(builder, &key).await?;
        Self::response_etag(&response)
    }

    fn continuation(response: &Response) -> Option<ContinuationToken> {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        header(NEXT_PARTITION_KEY_HEADER).map(|next_partition_key| ContinuationToken {
            next_partition_key,
            next_row_key: header(NEXT_ROW_KEY_HEADER),
        })
    }
}

#[async_trait]
impl TableService for HttpTableService {
    #[tracing::instrument(skip(self))]
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        let builder = self
            .request(Method::POST, self.url("Tables", &[])?)?
            .header("Prefer", RETURN_NO_CONTENT);
        let builder = Self::json_body(builder, &json!({ "TableName": table }));
        match self.execute(builder, table).await {
            Ok(_) => Ok(true),
            Err(err) if err.code() == Some(TABLE_ALREADY_EXISTS) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete_table(&self, table: &str) -> StorageResult<bool> {
        let path = format!("Tables('{}')", escape_key(table));
        let builder = self.request(Method::DELETE, self.url(&path, &[])?)?;
        match self.execute(builder, table).await {
            Ok(_) => Ok(true),
            Err(err) if err.status() == Some(404) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn insert(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        let builder = self
            .request(Method::POST, self.url(table, &[])?)?
            .header("Prefer", RETURN_NO_CONTENT);
        let builder = Self::json_body(builder, &wire::encode_entity(&entity));
        let response = self.execute(builder, &entity.describe(table)).await?;
        Ok(Self::response_etag(&response)?)
    }

    async fn replace(
        &self,
        table: &str,
        entity: DynamicEntity,
        condition: VersionCondition,
    ) -> StorageResult<ETag> {
        Ok(self.write_entity(Method::PUT, table, &entity, Some(&condition)).await?)
    }

    async fn insert_or_replace(&self, table: &str, entity: DynamicEntity) -> StorageResult<ETag> {
        Ok(self.write_entity(Method::PUT, table, &entity, None).await?)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        condition: VersionCondition,
    ) -> StorageResult<()> {
        let path = Self::entity_path(table, partition_key, row_key);
        let builder = self.request(Method::DELETE, self.url(&path, &[])?)?;
        let builder = Self::conditional(builder, Some(&condition));
        self.execute(builder, &row_path(table, partition_key, row_key)).await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<DynamicEntity>> {
        let path = Self::entity_path(table, partition_key, row_key);
        let builder = self.request(Method::GET, self.url(&path, &[])?)?;
        let response = match self.execute(builder, &row_path(table, partition_key, row_key)).await {
            Ok(response) => response,
            Err(err) if err.status() == Some(404) && err.code() != Some(TABLE_NOT_FOUND) => {
                return Ok(None);
            },
            Err(err) => return Err(err.into()),
        };

        let header_etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body: Value = response.json().await.map_err(RestError::from)?;
        Ok(Some(wire::decode_entity(&body, header_etag.as_deref())?))
    }

    #[tracing::instrument(skip(self, query, continuation), fields(take = ?query.take))]
    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QuerySegment> {
        let filter = query.filter.as_ref().map(|f| f.to_odata());
        let select = query.select.as_ref().map(|columns| {
            let mut all = vec!["PartitionKey", "RowKey", "Timestamp"];
            all.extend(columns.iter().map(String::as_str));
            all.join(",")
        });
        let top = query.take.map(|t| t.max(1).to_string());

        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(filter) = &filter {
            params.push(("$filter", filter));
        }
        if let Some(select) = &select {
            params.push(("$select", select));
        }
        if let Some(top) = &top {
            params.push(("$top", top));
        }
        if let Some(token) = continuation {
            params.push(("NextPartitionKey", &token.next_partition_key));
            if let Some(row_key) = &token.next_row_key {
                params.push(("NextRowKey", row_key));
            }
        }

        let builder = self.request(Method::GET, self.url(&format!("{table}()"), &params)?)?;
        let response = self.execute(builder, table).await?;
        let continuation = Self::continuation(&response);
        let body: Value = response.json().await.map_err(RestError::from)?;
        let mut entities = wire::decode_entities(&body)?;
        for entity in &mut entities {
            query.project(entity);
        }
        Ok(QuerySegment { entities, continuation })
    }

    #[tracing::instrument(skip(self, operations), fields(operations = operations.len()))]
    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        if operations.len() > MAX_BATCH_SIZE {
            return Err(ConfigError::BatchSizeExceeded {
                requested: operations.len(),
                maximum: MAX_BATCH_SIZE,
            }
            .into());
        }
        if operations.iter().filter_map(BatchOperation::partition_key).any(|pk| pk != partition_key)
        {
            return Err(StorageError::internal(format!(
                "batch on {table} mixes partitions; expected {partition_key}"
            )));
        }
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let table_url = self.absolute(table);
        let rendered = batch::render(
            &table_url,
            |row_key| self.absolute(&Self::entity_path(table, partition_key, row_key)),
            partition_key,
            &operations,
        );
        let builder = self
            .request(Method::POST, self.url("$batch", &[])?)?
            .header(header::CONTENT_TYPE, rendered.content_type)
            .body(rendered.body);

        let key = format!("{table}/{partition_key}");
        let response = self.execute(builder, &key).await?;
        let text = response.text().await.map_err(RestError::from)?;
        let parts = batch::parse_response(&text)?;
        Ok(batch::collect_etags(parts, &operations, &key)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("widget-1"), "widget-1");
        assert_eq!(escape_key("o'brien"), "o%27%27brien");
        assert_eq!(escape_key("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_entity_path() {
        assert_eq!(
            HttpTableService::entity_path("orders", "sales", "widget-1"),
            "orders(PartitionKey='sales',RowKey='widget-1')"
        );
    }

    #[test]
    fn test_url_keeps_endpoint_path_and_encodes_query() {
        let account = StorageAccount::development();
        let service = HttpTableService::new(&account, RestClientConfig::default()).unwrap();
        let url = service.url("orders()", &[("$filter", "Count gt 2"), ("$top", "5")]).unwrap();
        assert_eq!(url.path(), "/devstoreaccount1/orders()");
        assert_eq!(url.query(), Some("$filter=Count%20gt%202&$top=5"));
    }

    #[test]
    fn test_debug_hides_credentials() {
        let account = StorageAccount::development();
        let service = HttpTableService::new(&account, RestClientConfig::default()).unwrap();
        let rendered = format!("{service:?}");
        assert!(rendered.contains("127.0.0.1:10002"));
        assert!(!rendered.contains("Eby8"));
    }
}
