//! Wire-level tests of `HttpTableService` against a mock table endpoint.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use base64::{Engine as _, engine::general_purpose::STANDARD};
use cloudtable_storage::{
    BatchOperation, ContinuationToken, DynamicEntity, ETag, EntityProperty, Filter, StorageAccount,
    StorageError, TableQuery, TableService, VersionCondition, assert_already_exists,
    assert_conflict, assert_not_found,
};
use cloudtable_storage_rest::{HttpTableService, RestClientConfig};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{
        body_json, body_partial_json, header, header_exists, method, path, query_param,
        query_param_is_missing,
    },
};

const KEY: &str = "c2VjcmV0LWtleQ==";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn account(server: &MockServer) -> StorageAccount {
    StorageAccount::parse(&format!(
        "AccountName=testacct;AccountKey={KEY};TableEndpoint={}",
        server.uri()
    ))
    .unwrap()
}

fn service(server: &MockServer) -> HttpTableService {
    HttpTableService::new(&account(server), RestClientConfig::default()).unwrap()
}

fn error_body(code: &str) -> serde_json::Value {
    json!({ "odata.error": { "code": code, "message": { "lang": "en-US", "value": code } } })
}

fn widget() -> DynamicEntity {
    DynamicEntity::new("sales", "widget-1")
        .with_property("Name", "Widget")
        .with_property("Total", 12_i64)
}

const WIDGET_PATH: &str = "/orders(PartitionKey='sales',RowKey='widget-1')";

// ---------------------------------------------------------------------------
// Tables and signing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_table_sends_signed_protocol_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Tables"))
        .and(header("x-ms-version", "2019-02-02"))
        .and(header("accept", "application/json;odata=minimalmetadata"))
        .and(header("dataserviceversion", "3.0"))
        .and(header("prefer", "return-no-content"))
        .and(header_exists("x-ms-date"))
        .and(header_exists("authorization"))
        .and(body_json(json!({ "TableName": "orders" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    assert!(service(&server).create_table_if_not_exists("orders").await.unwrap());

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let date = request.headers.get("x-ms-date").unwrap().to_str().unwrap();
    let authorization = request.headers.get("authorization").unwrap().to_str().unwrap();

    let mut mac = Hmac::<Sha256>::new_from_slice(&STANDARD.decode(KEY).unwrap()).unwrap();
    mac.update(format!("{date}\n/testacct/Tables").as_bytes());
    let expected = STANDARD.encode(mac.finalize().into_bytes());
    assert_eq!(authorization, format!("SharedKeyLite testacct:{expected}"));
}

#[tokio::test]
async fn existing_table_is_not_created_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Tables"))
        .respond_with(ResponseTemplate::new(409).set_body_json(error_body("TableAlreadyExists")))
        .mount(&server)
        .await;

    assert!(!service(&server).create_table_if_not_exists("orders").await.unwrap());
}

#[tokio::test]
async fn delete_table_reports_existence() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/Tables('orders')"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/Tables('gone')"))
        .respond_with(ResponseTemplate::new(404).set_body_json(error_body("ResourceNotFound")))
        .mount(&server)
        .await;

    let service = service(&server);
    assert!(service.delete_table("orders").await.unwrap());
    assert!(!service.delete_table("gone").await.unwrap());
}

#[tokio::test]
async fn shared_access_signature_goes_in_the_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Tables"))
        .and(query_param("sig", "abc"))
        .and(query_param("sv", "2019-02-02"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let account = StorageAccount::parse(&format!(
        "AccountName=testacct;SharedAccessSignature=?sv=2019-02-02&sig=abc;TableEndpoint={}",
        server.uri()
    ))
    .unwrap();
    let service = HttpTableService::new(&account, RestClientConfig::default()).unwrap();
    assert!(service.create_table_if_not_exists("orders").await.unwrap());

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_encodes_types_and_returns_etag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("prefer", "return-no-content"))
        .and(body_partial_json(json!({
            "PartitionKey": "sales",
            "RowKey": "widget-1",
            "Name": "Widget",
            "Total": "12",
            "Total@odata.type": "Edm.Int64",
        })))
        .respond_with(ResponseTemplate::new(204).insert_header("ETag", "W/\"1\""))
        .expect(1)
        .mount(&server)
        .await;

    let etag = service(&server).insert("orders", widget()).await.unwrap();
    assert_eq!(etag, ETag::new("W/\"1\""));
}

#[tokio::test]
async fn insert_of_existing_row_is_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(409).set_body_json(error_body("EntityAlreadyExists")))
        .mount(&server)
        .await;

    assert_already_exists!(service(&server).insert("orders", widget()).await);
}

#[tokio::test]
async fn replace_sends_if_match_and_maps_precondition_failure() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(WIDGET_PATH))
        .and(header("if-match", "W/\"1\""))
        .respond_with(ResponseTemplate::new(204).insert_header("ETag", "W/\"2\""))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(WIDGET_PATH))
        .and(header("if-match", "W/\"stale\""))
        .respond_with(
            ResponseTemplate::new(412).set_body_json(error_body("UpdateConditionNotSatisfied")),
        )
        .mount(&server)
        .await;

    let service = service(&server);
    let fresh = VersionCondition::Matches(ETag::new("W/\"1\""));
    assert_eq!(service.replace("orders", widget(), fresh).await.unwrap(), ETag::new("W/\"2\""));

    let stale = VersionCondition::Matches(ETag::new("W/\"stale\""));
    assert_conflict!(service.replace("orders", widget(), stale).await);
}

#[tokio::test]
async fn insert_or_replace_is_unconditional() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(WIDGET_PATH))
        .respond_with(ResponseTemplate::new(204).insert_header("ETag", "W/\"5\""))
        .expect(1)
        .mount(&server)
        .await;

    service(&server).insert_or_replace("orders", widget()).await.unwrap();
    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("if-match").is_none());
}

#[tokio::test]
async fn delete_uses_wildcard_for_any() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(WIDGET_PATH))
        .and(header("if-match", "*"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    service(&server).delete("orders", "sales", "widget-1", VersionCondition::Any).await.unwrap();
}

#[tokio::test]
async fn keys_with_quotes_are_escaped() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/orders(PartitionKey='o%27%27brien',RowKey='r')"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    service(&server).delete("orders", "o'brien", "r", VersionCondition::Any).await.unwrap();
}

#[tokio::test]
async fn retrieve_decodes_row() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WIDGET_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "odata.etag": "W/\"7\"",
            "PartitionKey": "sales",
            "RowKey": "widget-1",
            "Timestamp": "2024-01-02T03:04:05.1234567Z",
            "Name": "Widget",
            "Total": "12",
            "Total@odata.type": "Edm.Int64",
            "Count": 3,
        })))
        .mount(&server)
        .await;

    let row = service(&server).retrieve("orders", "sales", "widget-1").await.unwrap().unwrap();
    assert_eq!(row.etag, Some(ETag::new("W/\"7\"")));
    assert!(row.timestamp.is_some());
    assert_eq!(row.properties["Total"], EntityProperty::Int64(Some(12)));
    assert_eq!(row.properties["Count"], EntityProperty::Int32(Some(3)));
}

#[tokio::test]
async fn retrieve_distinguishes_missing_row_from_missing_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WIDGET_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(error_body("ResourceNotFound")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lost(PartitionKey='sales',RowKey='widget-1')"))
        .respond_with(ResponseTemplate::new(404).set_body_json(error_body("TableNotFound")))
        .mount(&server)
        .await;

    let service = service(&server);
    assert_eq!(service.retrieve("orders", "sales", "widget-1").await.unwrap(), None);
    assert_not_found!(service.retrieve("lost", "sales", "widget-1").await);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_follows_continuation_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders()"))
        .and(query_param("$filter", "PartitionKey eq 'sales'"))
        .and(query_param("$top", "2"))
        .and(query_param_is_missing("NextPartitionKey"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-continuation-NextPartitionKey", "sales")
                .insert_header("x-ms-continuation-NextRowKey", "c")
                .set_body_json(json!({ "value": [
                    { "PartitionKey": "sales", "RowKey": "a" },
                    { "PartitionKey": "sales", "RowKey": "b" },
                ]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders()"))
        .and(query_param("NextPartitionKey", "sales"))
        .and(query_param("NextRowKey", "c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "PartitionKey": "sales", "RowKey": "c" },
        ]})))
        .mount(&server)
        .await;

    let service = service(&server);
    let query = TableQuery::builder().filter(Filter::partition("sales")).take(2).build();

    let first = service.query_segment("orders", &query, None).await.unwrap();
    assert_eq!(first.entities.len(), 2);
    let token = first.continuation.unwrap();
    assert_eq!(
        token,
        ContinuationToken { next_partition_key: "sales".into(), next_row_key: Some("c".into()) }
    );

    let second = service.query_segment("orders", &query, Some(&token)).await.unwrap();
    assert_eq!(second.entities[0].row_key, "c");
    assert_eq!(second.continuation, None);
}

#[tokio::test]
async fn projection_always_selects_keys() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders()"))
        .and(query_param("$select", "PartitionKey,RowKey,Timestamp,Name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "PartitionKey": "sales", "RowKey": "a", "Name": "A" },
        ]})))
        .expect(1)
        .mount(&server)
        .await;

    let query = TableQuery::builder().select(vec!["Name".to_owned()]).build();
    let segment = service(&server).query_segment("orders", &query, None).await.unwrap();
    assert_eq!(segment.entities[0].properties.len(), 1);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn throttling_and_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy()"))
        .respond_with(ResponseTemplate::new(503).set_body_json(error_body("ServerBusy")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken()"))
        .respond_with(ResponseTemplate::new(500).set_body_json(error_body("InternalError")))
        .mount(&server)
        .await;

    let service = service(&server);
    let busy = service.query_segment("busy", &TableQuery::all(), None).await.unwrap_err();
    assert!(matches!(busy, StorageError::Unavailable { .. }), "{busy:?}");
    assert!(busy.is_transient());

    let broken = service.query_segment("broken", &TableQuery::all(), None).await.unwrap_err();
    assert!(matches!(broken, StorageError::Connection { .. }), "{broken:?}");
    assert!(broken.is_transient());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let account = StorageAccount::parse(&format!(
        "AccountName=testacct;AccountKey={KEY};TableEndpoint=http://127.0.0.1:1"
    ))
    .unwrap();
    let config =
        RestClientConfig::builder().connect_timeout(std::time::Duration::from_millis(500)).build();

    let service = HttpTableService::new(&account, config).unwrap();
    let err = service.create_table_if_not_exists("orders").await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

const BATCH_RESPONSE: &str = "--batchresponse_1\r\n\
Content-Type: multipart/mixed; boundary=changesetresponse_1\r\n\
\r\n\
--changesetresponse_1\r\n\
Content-Type: application/http\r\n\
Content-Transfer-Encoding: binary\r\n\
\r\n\
HTTP/1.1 204 No Content\r\n\
ETag: W/\"10\"\r\n\
\r\n\
--changesetresponse_1\r\n\
Content-Type: application/http\r\n\
Content-Transfer-Encoding: binary\r\n\
\r\n\
HTTP/1.1 204 No Content\r\n\
\r\n\
--changesetresponse_1--\r\n\
--batchresponse_1--\r\n";

#[tokio::test]
async fn batch_posts_changeset_and_maps_etags() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/$batch"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Content-Type", "multipart/mixed; boundary=batchresponse_1")
                .set_body_string(BATCH_RESPONSE),
        )
        .expect(1)
        .mount(&server)
        .await;

    let operations = vec![
        BatchOperation::InsertOrReplace(widget()),
        BatchOperation::Delete { row_key: "widget-2".into(), condition: VersionCondition::Any },
    ];
    let etags = service(&server).execute_batch("orders", "sales", operations).await.unwrap();
    assert_eq!(etags, vec![Some(ETag::new("W/\"10\"")), None]);

    let requests = server.received_requests().await.unwrap();
    let content_type = requests[0].headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/mixed; boundary=batch_"), "{content_type}");
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.contains(&format!("PUT {}{WIDGET_PATH} HTTP/1.1", server.uri())));
    assert!(body.contains("DELETE"));
}

#[tokio::test]
async fn batch_over_limit_never_reaches_the_wire() {
    let server = MockServer::start().await;
    let operations = (0..=100)
        .map(|i| BatchOperation::InsertOrReplace(DynamicEntity::new("p", format!("{i:03}"))))
        .collect();

    let result = service(&server).execute_batch("orders", "p", operations).await;
    assert!(matches!(result, Err(StorageError::Config(_))), "{result:?}");
    assert!(server.received_requests().await.unwrap().is_empty());
}
