//! The typed store stack running over `RestConnector` against a mock
//! endpoint: table creation, key normalization, retries and paging.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use cloudtable_storage::{
    Filter, StorageConfig, StorageContext, StorageError, TableQuery, TableStore, table_entity,
    testutil::fast_retry,
};
use cloudtable_storage_rest::{RestClientConfig, RestConnector};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path, query_param, query_param_is_missing},
};

#[derive(Debug, Default, Clone, PartialEq)]
struct Order {
    customer: String,
    number: String,
    total: i64,
    note: String,
}

table_entity! {
    impl TableEntity for Order {
        #[partition_key] customer,
        #[row_key] number,
        total,
        note,
    }
}

fn context(server: &MockServer) -> Arc<StorageContext> {
    let config = StorageConfig::builder()
        .connection_string(format!(
            "AccountName=testacct;AccountKey=c2VjcmV0LWtleQ==;TableEndpoint={}",
            server.uri()
        ))
        .retry(fast_retry())
        .build();
    let connector = RestConnector::new(RestClientConfig::default()).unwrap();
    Arc::new(StorageContext::new(config, Arc::new(connector)))
}

async fn mount_table(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/Tables"))
        .and(body_partial_json(json!({ "TableName": "orders" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(server)
        .await;
}

fn order_row(number: &str, total: i64) -> serde_json::Value {
    json!({
        "odata.etag": format!("W/\"{number}\""),
        "PartitionKey": "sales",
        "RowKey": number,
        "Timestamp": "2024-01-02T03:04:05.0000000Z",
        "total": total.to_string(),
        "total@odata.type": "Edm.Int64",
        "note": "rush",
    })
}

#[tokio::test]
async fn insert_then_get_through_the_wire() {
    let server = MockServer::start().await;
    mount_table(&server).await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_partial_json(json!({
            "PartitionKey": "sales",
            "RowKey": "widget-1",
            "total": "12",
            "total@odata.type": "Edm.Int64",
        })))
        .respond_with(ResponseTemplate::new(204).insert_header("ETag", "W/\"1\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders(PartitionKey='sales',RowKey='widget-1')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_row("widget-1", 12)))
        .mount(&server)
        .await;

    let store = TableStore::<Order>::new(context(&server), "Orders").unwrap();
    let mut order = Order {
        customer: "Sales".into(),
        number: "Widget-1".into(),
        total: 12,
        note: "rush".into(),
    };
    store.insert(&mut order).await.unwrap();

    let loaded = store.get("Sales", "Widget-1").await.unwrap().unwrap();
    assert_eq!(loaded.customer, "sales");
    assert_eq!(loaded.number, "widget-1");
    assert_eq!(loaded.total, 12);
    assert_eq!(loaded.note, "rush");
}

#[tokio::test]
async fn throttled_reads_are_retried() {
    let server = MockServer::start().await;
    mount_table(&server).await;
    Mock::given(method("GET"))
        .and(path("/orders(PartitionKey='sales',RowKey='widget-1')"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders(PartitionKey='sales',RowKey='widget-1')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_row("widget-1", 7)))
        .mount(&server)
        .await;

    let store = TableStore::<Order>::new(context(&server), "orders").unwrap();
    let loaded = store.get("sales", "widget-1").await.unwrap().unwrap();
    assert_eq!(loaded.total, 7);
    assert_eq!(store.metrics().snapshot().retries, 2);
}

#[tokio::test]
async fn stale_replace_is_not_retried() {
    let server = MockServer::start().await;
    mount_table(&server).await;
    Mock::given(method("PUT"))
        .and(path("/orders(PartitionKey='sales',RowKey='widget-1')"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "odata.error": {
                "code": "UpdateConditionNotSatisfied",
                "message": { "value": "stale" }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = TableStore::<Order>::new(context(&server), "orders").unwrap();
    let mut order =
        Order { customer: "sales".into(), number: "widget-1".into(), ..Order::default() };
    let err = store.replace(&mut order, true).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict { .. }), "{err:?}");
    assert_eq!(store.metrics().snapshot().conflicts, 1);
}

#[tokio::test]
async fn query_collects_every_page() {
    let server = MockServer::start().await;
    mount_table(&server).await;
    Mock::given(method("GET"))
        .and(path("/orders()"))
        .and(query_param("$filter", "PartitionKey eq 'sales'"))
        .and(query_param_is_missing("NextPartitionKey"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-continuation-NextPartitionKey", "sales")
                .insert_header("x-ms-continuation-NextRowKey", "b")
                .set_body_json(json!({ "value": [order_row("a", 1)] })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders()"))
        .and(query_param("NextRowKey", "b"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "value": [order_row("b", 2), order_row("c", 3)] })),
        )
        .mount(&server)
        .await;

    let store = TableStore::<Order>::new(context(&server), "orders").unwrap();
    let orders = store.query(TableQuery::filtered(Filter::partition("sales"))).await.unwrap();
    assert_eq!(orders.iter().map(|o| o.total).collect::<Vec<_>>(), [1, 2, 3]);
}

#[tokio::test]
async fn blob_stores_are_unsupported() {
    let server = MockServer::start().await;
    let store = cloudtable_storage::BlobStore::new(context(&server), "docs");
    let err = store.list(None).await.unwrap_err();
    assert!(err.to_string().contains("not supported"), "{err}");
}
