//! Read-only managers talking to a live primary over HTTP.
//!
//! **Note:** These tests bind TCP listeners on 127.0.0.1.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use object_store::memory::InMemory;

use connectify::api::SyncTopicRequest;
use connectify::client::mock::{MockBrokerClient, RecordingReplicaSync};
use connectify::client::{BrokerChange, HttpReplicaSync, ReplicaSync, SyncMessage};
use connectify::error::Error;
use connectify::manager::primary_http::{self, PrimaryState};
use connectify::manager::{DataManager, PendingRequestQueue, ReadonlyManager, readonly_http};
use connectify::metadata::{InMemoryMetadataStore, MetadataStore, RemoteMetadataStore};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

struct Primary {
    url: String,
    manager: Arc<DataManager>,
    brokers: Arc<MockBrokerClient>,
}

async fn start_primary() -> Primary {
    let store = Arc::new(InMemoryMetadataStore::new());
    let brokers = Arc::new(MockBrokerClient::new());
    let manager = Arc::new(DataManager::new(
        store,
        brokers.clone(),
        Arc::new(RecordingReplicaSync::new()),
        Arc::new(PendingRequestQueue::new(Arc::new(InMemory::new()))),
        1,
        2,
    ));
    let url = serve(primary_http::router(Arc::new(PrimaryState::new(
        manager.clone(),
        "rnn1234",
    ))))
    .await;
    Primary {
        url,
        manager,
        brokers,
    }
}

#[tokio::test]
async fn test_remote_store_shares_counters_with_primary() {
    let primary = start_primary().await;
    let remote = RemoteMetadataStore::new(&primary.url, TIMEOUT).unwrap();

    primary.manager.add_broker("b1").await.unwrap();
    primary.manager.create_topic("t", Some(1)).await.unwrap();
    let (consumer, _) = primary.manager.add_consumer("t").await.unwrap();

    assert_eq!(remote.list_topics().await.unwrap(), vec!["t"]);
    assert_eq!(remote.partition_count("t").await.unwrap(), 1);
    assert_eq!(remote.brokers_for_partition("t", 0).await.unwrap(), vec!["b1"]);
    assert!(remote.check_consumer_registered(&consumer, "t").await.unwrap());

    // Nothing committed yet: no offset to claim.
    assert_eq!(remote.consumer_offset(&consumer, "t", 0).await.unwrap(), None);

    assert_eq!(remote.allocate_log_index("t", 0).await.unwrap(), 0);
    assert_eq!(primary.manager.store().allocate_log_index("t", 0).await.unwrap(), 1);
    assert_eq!(remote.commit_partition_size("t", 0).await.unwrap(), 1);
    assert_eq!(remote.consumer_offset(&consumer, "t", 0).await.unwrap(), Some(0));
    assert_eq!(remote.peek_consumer_offset(&consumer, "t", 0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_remote_store_returns_typed_errors() {
    let primary = start_primary().await;
    let remote = RemoteMetadataStore::new(&primary.url, TIMEOUT).unwrap();

    remote.register_broker("b1").await.unwrap();
    assert_eq!(
        remote.register_broker("b1").await,
        Err(Error::BrokerAlreadyExists)
    );
    assert_eq!(remote.partition_count("nope").await, Err(Error::TopicNotFound));
    assert_eq!(remote.broker("b9").await.map(|b| b.addr), Err(Error::BrokerNotFound));
}

#[tokio::test]
async fn test_readonly_manager_over_remote_store() {
    let primary = start_primary().await;
    primary.manager.add_broker("b1").await.unwrap();
    primary.manager.create_topic("t", Some(2)).await.unwrap();
    let (producer, _) = primary.manager.add_producer("t").await.unwrap();
    let (consumer, _) = primary.manager.add_consumer("t").await.unwrap();
    primary.manager.produce("t", &producer, "hello", Some(1)).await.unwrap();

    let store = Arc::new(RemoteMetadataStore::new(&primary.url, TIMEOUT).unwrap());
    let readonly = ReadonlyManager::new(store, primary.brokers.clone());
    readonly.bootstrap().await.unwrap();
    assert_eq!(readonly.get_topics(), vec!["t"]);

    let outcome = readonly.consume("t", &consumer, None).await.unwrap();
    assert_eq!(outcome.message(), Some("hello"));
    assert_eq!(outcome.partition(), 1);

    let sizes = readonly.size("t", &consumer, None).await.unwrap();
    assert!(sizes.iter().all(|s| s.size == 0));
}

#[tokio::test]
async fn test_http_sync_reaches_readonly_managers() {
    let primary = start_primary().await;
    let store = Arc::new(RemoteMetadataStore::new(&primary.url, TIMEOUT).unwrap());
    let readonly = Arc::new(ReadonlyManager::new(store, primary.brokers.clone()));
    let readonly_url = serve(readonly_http::router(readonly.clone())).await;

    let sync = HttpReplicaSync::new(vec![readonly_url, "http://127.0.0.1:1".to_string()], TIMEOUT)
        .unwrap();

    let outcome = sync
        .broadcast(SyncMessage::Topic(SyncTopicRequest {
            name: "pushed".into(),
            number_of_partitions: 1,
            broker_list: vec![vec!["b1".into()]],
        }))
        .await;
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.is_complete());
    assert_eq!(readonly.get_topics(), vec!["pushed"]);

    sync.broadcast(SyncMessage::broker(BrokerChange::Deactivate, "b1"))
        .await;
    assert!(!readonly.broker_is_active("b1"));
}
