//! End-to-end request flows through the primary and read-only HTTP routers.
//!
//! Both routers share one in-memory metadata store. Brokers are the in-crate
//! `MockBrokerClient`; sync pushes are recorded, not delivered, so the
//! read-only side exercises its cache-miss fallback.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::future::join_all;
use http_body_util::BodyExt;
use object_store::memory::InMemory;
use serde_json::{Value, json};
use tower::ServiceExt;

use connectify::client::mock::{MockBrokerClient, RecordingReplicaSync};
use connectify::manager::primary_http::{self, PrimaryState};
use connectify::manager::{DataManager, PendingRequestQueue, ReadonlyManager, readonly_http};
use connectify::metadata::InMemoryMetadataStore;

const TOKEN: &str = "rnn1234";

struct Cluster {
    primary: Router,
    readonly: Router,
    readonly_manager: Arc<ReadonlyManager>,
    brokers: Arc<MockBrokerClient>,
    sync: Arc<RecordingReplicaSync>,
}

fn cluster(replication_factor: usize) -> Cluster {
    let store = Arc::new(InMemoryMetadataStore::new());
    let brokers = Arc::new(MockBrokerClient::new());
    let sync = Arc::new(RecordingReplicaSync::new());
    let manager = Arc::new(DataManager::new(
        store.clone(),
        brokers.clone(),
        sync.clone(),
        Arc::new(PendingRequestQueue::new(Arc::new(InMemory::new()))),
        replication_factor,
        2,
    ));
    let readonly_manager = Arc::new(ReadonlyManager::new(store, brokers.clone()));
    Cluster {
        primary: primary_http::router(Arc::new(PrimaryState::new(manager, TOKEN))),
        readonly: readonly_http::router(readonly_manager.clone()),
        readonly_manager,
        brokers,
        sync,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn add_brokers(c: &Cluster, names: &[&str]) {
    for name in names {
        let (status, body) = call(
            &c.primary,
            "POST",
            "/admin/broker/add",
            Some(json!({"broker_host": name, "token": TOKEN})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }
}

async fn create_topic(c: &Cluster, name: &str, partitions: u32) {
    let (status, body) = call(
        &c.primary,
        "POST",
        "/topics",
        Some(json!({"name": name, "number_of_partitions": partitions})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        body["message"],
        format!("Topic '{}' created successfully.", name)
    );
}

async fn register(c: &Cluster, role: &str, topic: &str) -> String {
    let (status, body) = call(
        &c.primary,
        "POST",
        &format!("/{}/register", role),
        Some(json!({"topic": topic})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body[format!("{}_id", role)].as_str().unwrap().to_string()
}

async fn produce(c: &Cluster, topic: &str, producer_id: &str, message: &str) -> (StatusCode, Value) {
    call(
        &c.primary,
        "POST",
        "/producer/produce",
        Some(json!({"topic": topic, "producer_id": producer_id, "message": message})),
    )
    .await
}

async fn consume(c: &Cluster, topic: &str, consumer_id: &str, partition: Option<u32>) -> Value {
    let mut body = json!({"topic": topic, "consumer_id": consumer_id});
    if let Some(p) = partition {
        body["partition_index"] = json!(p);
    }
    let (status, body) = call(&c.readonly, "GET", "/consumer/consume", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn test_three_partitions_three_produces_sum_to_three() {
    let c = cluster(3);
    add_brokers(&c, &["b1", "b2", "b3"]).await;
    create_topic(&c, "orders", 3).await;
    let producer = register(&c, "producer", "orders").await;
    let consumer = register(&c, "consumer", "orders").await;

    for m in ["a", "b", "c"] {
        let (status, body) = produce(&c, "orders", &producer, m).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "success");
    }

    let (status, body) = call(
        &c.readonly,
        "GET",
        "/size",
        Some(json!({"topic": "orders", "consumer_id": consumer})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let sizes = body["sizes"].as_array().unwrap();
    assert_eq!(sizes.len(), 3);
    let total: u64 = sizes.iter().map(|s| s["size"].as_u64().unwrap()).sum();
    assert_eq!(total, 3);

    // Every partition was created on all three brokers.
    for broker in ["b1", "b2", "b3"] {
        assert_eq!(c.brokers.created_partitions(broker).len(), 3);
    }
}

#[tokio::test]
async fn test_consume_empty_topic_returns_no_message() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "empty", 2).await;
    let consumer = register(&c, "consumer", "empty").await;

    let body = consume(&c, "empty", &consumer, None).await;
    assert_eq!(body["status"], "success");
    assert!(body["message"].is_null());
    assert!(body["partition_read"].as_u64().unwrap() < 2);
}

#[tokio::test]
async fn test_produce_then_consume_once() {
    let c = cluster(2);
    add_brokers(&c, &["b1", "b2"]).await;
    create_topic(&c, "t", 1).await;
    let producer = register(&c, "producer", "t").await;
    let consumer = register(&c, "consumer", "t").await;

    let (status, _) = produce(&c, "t", &producer, "m1").await;
    assert_eq!(status, StatusCode::OK);

    let body = consume(&c, "t", &consumer, Some(0)).await;
    assert_eq!(body["message"], "m1");
    assert_eq!(body["partition_read"], 0);

    let body = consume(&c, "t", &consumer, Some(0)).await;
    assert!(body["message"].is_null());
}

#[tokio::test]
async fn test_concurrent_consumers_claim_unique_offsets() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "t", 1).await;
    let producer = register(&c, "producer", "t").await;
    let consumer = register(&c, "consumer", "t").await;
    for i in 0..20 {
        let (status, _) = produce(&c, "t", &producer, &format!("m{i}")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let outcomes = join_all(
        (0..25).map(|_| c.readonly_manager.consume("t", &consumer, Some(0))),
    )
    .await;
    let mut messages: Vec<String> = outcomes
        .into_iter()
        .filter_map(|o| o.unwrap().message().map(str::to_string))
        .collect();
    messages.sort();
    messages.dedup();
    assert_eq!(messages.len(), 20);
}

#[tokio::test]
async fn test_producer_register_auto_creates_topic() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    let (status, body) = call(
        &c.primary,
        "POST",
        "/producer/register",
        Some(json!({"topic": "fresh"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["partition_count"], 2);

    let (_, body) = call(&c.primary, "GET", "/topics", None).await;
    assert_eq!(body["topics"], json!(["fresh"]));

    // Consumers never create topics.
    let (status, body) = call(
        &c.primary,
        "POST",
        "/consumer/register",
        Some(json!({"topic": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Topic does not exist.");
}

#[tokio::test]
async fn test_failure_replies() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "t", 1).await;

    let (status, body) = call(
        &c.primary,
        "POST",
        "/topics",
        Some(json!({"name": "t", "number_of_partitions": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"status": "failure", "message": "Topic already exists."}));

    let (status, body) = produce(&c, "t", "nobody", "m").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Producer not registered with topic.");

    let (status, body) = call(&c.primary, "POST", "/producer/produce", Some(json!({"topic": "t"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failure");

    let (status, body) = call(
        &c.readonly,
        "GET",
        "/consumer/consume",
        Some(json!({"topic": "t", "consumer_id": "nobody"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Consumer not registered with topic.");

    let consumer = register(&c, "consumer", "t").await;
    let (status, body) = call(
        &c.readonly,
        "GET",
        "/size",
        Some(json!({"topic": "t", "consumer_id": consumer, "partition_index": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid partition number.");
}

#[tokio::test]
async fn test_negative_partition_index_is_out_of_range() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "t", 2).await;
    let producer = register(&c, "producer", "t").await;
    let consumer = register(&c, "consumer", "t").await;

    let (status, body) = call(
        &c.primary,
        "POST",
        "/producer/produce",
        Some(json!({"topic": "t", "producer_id": producer, "message": "m", "partition_index": -1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"status": "failure", "message": "Invalid Partition Number."}));
    assert!(c.brokers.log("b1", "t", 0).is_empty());
    assert!(c.brokers.log("b1", "t", 1).is_empty());

    for uri in ["/consumer/consume", "/size"] {
        let (status, body) = call(
            &c.readonly,
            "GET",
            uri,
            Some(json!({"topic": "t", "consumer_id": consumer, "partition_index": -1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body, json!({"status": "failure", "message": "Invalid partition number."}));
    }
}

#[tokio::test]
async fn test_admin_requires_token() {
    let c = cluster(1);
    let (status, body) = call(
        &c.primary,
        "POST",
        "/admin/broker/add",
        Some(json!({"broker_host": "b1", "token": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Authentication failed");

    add_brokers(&c, &["b1"]).await;
    let (status, body) = call(
        &c.primary,
        "POST",
        "/admin/broker/add",
        Some(json!({"broker_host": "b1", "token": TOKEN})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Broker with hostname already exists.");
}

#[tokio::test]
async fn test_deactivated_broker_blocks_produce_until_reactivated() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "t", 1).await;
    let producer = register(&c, "producer", "t").await;

    let admin = |change: &'static str| {
        let primary = c.primary.clone();
        async move {
            call(
                &primary,
                "POST",
                &format!("/admin/broker/{change}"),
                Some(json!({"broker_host": "b1", "token": TOKEN})),
            )
            .await
        }
    };

    let (status, _) = admin("deactivate").await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = admin("deactivate").await;
    assert_eq!(body["message"], "Broker with hostname not active.");

    let (status, body) = produce(&c, "t", &producer, "m").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "All brokers are inactive.");

    // A topic created while b1 is inactive is queued and replayed on activation.
    create_topic(&c, "later", 1).await;
    assert!(!c.brokers.hosts_partition("b1", "later", 0));

    let (status, body) = admin("activate").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(c.brokers.hosts_partition("b1", "later", 0));
    let (status, _) = produce(&c, "t", &producer, "m").await;
    assert_eq!(status, StatusCode::OK);

    let routes = c.sync.routes();
    assert!(routes.contains(&"/sync/broker/deactivate".to_string()));
    assert!(routes.contains(&"/sync/broker/activate".to_string()));
}

#[tokio::test]
async fn test_sync_endpoints_update_readonly_cache() {
    let c = cluster(1);
    let (status, _) = call(
        &c.readonly,
        "POST",
        "/sync/topics",
        Some(json!({"name": "pushed", "number_of_partitions": 1, "broker_list": [["b1"]]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&c.readonly, "GET", "/topics", None).await;
    assert_eq!(body["topics"], json!(["pushed"]));

    let (status, _) = call(
        &c.readonly,
        "POST",
        "/sync/broker/deactivate",
        Some(json!({"broker_host": "b1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!c.readonly_manager.broker_is_active("b1"));

    let (status, body) = call(
        &c.readonly,
        "POST",
        "/sync/broker/reboot",
        Some(json!({"broker_host": "b1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failure");
}

#[tokio::test]
async fn test_metadata_endpoint_runs_commands() {
    let c = cluster(1);
    add_brokers(&c, &["b1"]).await;
    create_topic(&c, "t", 1).await;

    let (status, body) = call(&c.primary, "POST", "/metadata", Some(json!({"op": "list_topics"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {"kind": "names", "value": ["t"]}}));

    let (status, body) = call(
        &c.primary,
        "POST",
        "/metadata",
        Some(json!({"op": "partition_count", "name": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Err": "TopicNotFound"}));
}
