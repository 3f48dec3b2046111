//! Primary write path and broker registry administration.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::request_queue::{PendingRequestQueue, ReplayOutcome};
use crate::api::{BrokerProduceRequest, CreatePartitionRequest, SyncConsumerRequest, SyncTopicRequest};
use crate::client::{BrokerChange, BrokerClient, PendingRequest, ReplicaSync, SyncMessage};
use crate::constants::{MAX_PARTITIONS_PER_TOPIC, MAX_TAKEN_INDEX_SKIPS};
use crate::error::{Error, Result};
use crate::metadata::{MetadataCheckpoint, MetadataStore};
use crate::metrics;
use crate::types::{
    BrokerAddr, BrokerStatus, LogIndex, PartitionAssignment, PartitionIndex, RequestedPartition,
    partition_in_range,
};

/// Where a produced record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceReceipt {
    pub broker: BrokerAddr,
    pub partition: PartitionIndex,
    pub log_index: LogIndex,
}

pub struct DataManager {
    store: Arc<dyn MetadataStore>,
    brokers: Arc<dyn BrokerClient>,
    sync: Arc<dyn ReplicaSync>,
    pending: Arc<PendingRequestQueue>,
    replication_factor: usize,
    default_partitions: u32,
    /// Serializes placement so a topic is never visible without its partitions.
    placement: Mutex<()>,
    checkpoint: Option<Arc<MetadataCheckpoint>>,
}

impl DataManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        brokers: Arc<dyn BrokerClient>,
        sync: Arc<dyn ReplicaSync>,
        pending: Arc<PendingRequestQueue>,
        replication_factor: usize,
        default_partitions: u32,
    ) -> Self {
        Self {
            store,
            brokers,
            sync,
            pending,
            replication_factor: replication_factor.max(1),
            default_partitions,
            placement: Mutex::new(()),
            checkpoint: None,
        }
    }

    /// Save the metadata store after every placement and registry change.
    pub fn with_checkpoint(mut self, checkpoint: Arc<MetadataCheckpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    async fn checkpoint(&self, after: &'static str) {
        if let Some(checkpoint) = &self.checkpoint
            && let Err(e) = checkpoint.save().await
        {
            error!(after, error = %e, "Metadata checkpoint failed");
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn pending(&self) -> &Arc<PendingRequestQueue> {
        &self.pending
    }

    // ========================================================================
    // Topics
    // ========================================================================

    /// Create a topic and place its partitions on the least loaded brokers.
    ///
    /// Every check runs before anything is written: a rejected create leaves
    /// broker loads, ports and existing assignments untouched.
    pub async fn add_topic_and_return(
        &self,
        name: &str,
        partition_count: Option<u32>,
    ) -> Result<Vec<PartitionAssignment>> {
        let partition_count = partition_count.unwrap_or(self.default_partitions);
        if name.trim().is_empty() {
            return Err(Error::InvalidRequest("Topic name must not be empty.".to_string()));
        }
        if partition_count == 0 || partition_count > MAX_PARTITIONS_PER_TOPIC {
            return Err(Error::InvalidRequest(format!(
                "number_of_partitions must be between 1 and {}.",
                MAX_PARTITIONS_PER_TOPIC
            )));
        }

        let _placement = self.placement.lock().await;

        if self.store.topic_exists(name).await? {
            return Err(Error::TopicAlreadyExists);
        }
        let broker_count = self.store.list_brokers().await?.len();
        if broker_count == 0 {
            return Err(Error::InvalidRequest("No brokers registered.".to_string()));
        }
        let replicas_per_partition = self.replication_factor.min(broker_count);

        self.store.create_topic(name, partition_count).await?;

        let mut assignments = Vec::with_capacity(partition_count as usize);
        for partition in 0..partition_count {
            let replicas = self
                .store
                .least_loaded_brokers(replicas_per_partition)
                .await?;
            self.store.increment_broker_load(&replicas).await?;
            let port = self.store.next_replica_port().await?;
            self.store
                .assign_partition_brokers(name, partition, replicas.clone(), port)
                .await?;
            assignments.push(PartitionAssignment {
                partition,
                replicas,
                port,
            });
        }

        self.checkpoint("topic placement").await;
        info!(
            topic = name,
            partitions = partition_count,
            replication = replicas_per_partition,
            "Topic placed"
        );
        Ok(assignments)
    }

    /// Full topic create: placement, partition creation on every replica
    /// broker (queued for brokers that cannot take it now), then a sync push.
    pub async fn create_topic(
        &self,
        name: &str,
        partition_count: Option<u32>,
    ) -> Result<Vec<PartitionAssignment>> {
        let assignments = self.add_topic_and_return(name, partition_count).await?;

        let mut creates = Vec::new();
        for assignment in &assignments {
            let request = CreatePartitionRequest {
                name: name.to_string(),
                partition_index: assignment.partition,
                replicas: assignment.replicas.clone(),
                port: assignment.port,
            };
            for broker in &assignment.replicas {
                creates.push((broker.clone(), request.clone()));
            }
        }

        let results = join_all(
            creates
                .iter()
                .map(|(broker, request)| self.create_on_broker(broker, request)),
        )
        .await;

        // Enqueue in placement order so each broker's queue stays partition ordered.
        for ((broker, request), delivered) in creates.into_iter().zip(results) {
            if delivered {
                continue;
            }
            let partition = request.partition_index;
            match self
                .queue_for_broker(&broker, PendingRequest::CreatePartition(request))
                .await
            {
                Ok(seq) => info!(
                    topic = name,
                    partition,
                    broker = %broker,
                    seq,
                    "Partition create queued for broker"
                ),
                Err(e) => error!(
                    topic = name,
                    partition,
                    broker = %broker,
                    error = %e,
                    "Failed to queue partition create"
                ),
            }
        }

        self.sync
            .broadcast(SyncMessage::Topic(SyncTopicRequest {
                name: name.to_string(),
                number_of_partitions: assignments.len() as u32,
                broker_list: assignments.iter().map(|a| a.replicas.clone()).collect(),
            }))
            .await;

        Ok(assignments)
    }

    /// `true` when the broker took the request now.
    async fn create_on_broker(&self, broker: &str, request: &CreatePartitionRequest) -> bool {
        match self.store.is_broker_active(broker).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(broker, error = %e, "Broker lookup failed during topic create");
                return false;
            }
        }
        match self.brokers.create_partition(broker, request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    broker,
                    topic = %request.name,
                    partition = request.partition_index,
                    error = %e,
                    "Partition create failed"
                );
                false
            }
        }
    }

    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.store.list_topics().await
    }

    // ========================================================================
    // Producers and consumers
    // ========================================================================

    /// Register a producer on an existing topic; returns (producer id, partition count).
    pub async fn add_producer(&self, topic: &str) -> Result<(String, u32)> {
        if !self.store.topic_exists(topic).await? {
            return Err(Error::TopicNotFound);
        }
        let producer_id = uuid::Uuid::new_v4().to_string();
        self.store.register_producer(&producer_id, topic).await?;
        let partition_count = self.store.partition_count(topic).await?;
        self.checkpoint("producer registration").await;
        debug!(topic, producer_id = %producer_id, "Producer registered");
        Ok((producer_id, partition_count))
    }

    /// [`add_producer`](Self::add_producer), creating the topic with the
    /// default partition count first when it does not exist.
    pub async fn register_producer(&self, topic: &str) -> Result<(String, u32)> {
        if !self.store.topic_exists(topic).await? {
            match self.create_topic(topic, None).await {
                Ok(_) | Err(Error::TopicAlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }
        self.add_producer(topic).await
    }

    /// Register a consumer; never creates the topic.
    pub async fn add_consumer(&self, topic: &str) -> Result<(String, u32)> {
        if !self.store.topic_exists(topic).await? {
            return Err(Error::TopicNotFound);
        }
        let consumer_id = uuid::Uuid::new_v4().to_string();
        self.store.register_consumer(&consumer_id, topic).await?;
        let partition_count = self.store.partition_count(topic).await?;
        self.checkpoint("consumer registration").await;

        self.sync
            .broadcast(SyncMessage::Consumer(SyncConsumerRequest {
                topic: topic.to_string(),
                consumer_id: consumer_id.clone(),
            }))
            .await;

        debug!(topic, consumer_id = %consumer_id, "Consumer registered");
        Ok((consumer_id, partition_count))
    }

    // ========================================================================
    // Produce path
    // ========================================================================

    /// Resolve the partition and an active replica broker for a produce.
    ///
    /// Without an explicit index the producer's round-robin cursor picks the
    /// partition, moving on to the next one while a partition has no active
    /// replica. An explicit index is range checked before anything changes.
    pub async fn get_broker_host(
        &self,
        topic: &str,
        producer_id: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<(BrokerAddr, PartitionIndex)> {
        if !self.store.topic_exists(topic).await? {
            return Err(Error::TopicNotFound);
        }
        if !self
            .store
            .check_producer_registered(producer_id, topic)
            .await?
        {
            return Err(Error::ProducerNotRegistered);
        }

        match partition {
            Some(requested) => {
                let count = self.store.partition_count(topic).await?;
                let p = partition_in_range(requested, count).ok_or(Error::InvalidPartition)?;
                let broker = self
                    .active_replica(topic, p)
                    .await?
                    .ok_or(Error::NoActiveBroker)?;
                Ok((broker, p))
            }
            None => {
                let partition_count = self.store.partition_count(topic).await?;
                for _ in 0..partition_count {
                    let p = self.store.next_partition_for_producer(producer_id).await?;
                    if let Some(broker) = self.active_replica(topic, p).await? {
                        return Ok((broker, p));
                    }
                }
                Err(Error::NoActiveBroker)
            }
        }
    }

    /// A random active broker of the partition's replica set.
    async fn active_replica(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<Option<BrokerAddr>> {
        let mut replicas = self.store.brokers_for_partition(topic, partition).await?;
        fastrand::shuffle(&mut replicas);
        for broker in replicas {
            if self.store.is_broker_active(&broker).await? {
                return Ok(Some(broker));
            }
        }
        Ok(None)
    }

    pub async fn get_log_index(&self, topic: &str, partition: PartitionIndex) -> Result<LogIndex> {
        self.store.allocate_log_index(topic, partition).await
    }

    pub async fn incr_partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64> {
        self.store.commit_partition_size(topic, partition).await
    }

    /// Resolve, allocate an index, replicate through the broker, commit.
    ///
    /// A broker failure after allocation leaves that index unused. An index
    /// the broker reports as holding another record is committed as is and a
    /// fresh one is allocated.
    pub async fn produce(
        &self,
        topic: &str,
        producer_id: &str,
        message: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<ProduceReceipt> {
        let result = self
            .produce_inner(topic, producer_id, message, partition)
            .await;
        metrics::record_produce(if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn produce_inner(
        &self,
        topic: &str,
        producer_id: &str,
        message: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<ProduceReceipt> {
        let (broker, partition) = self.get_broker_host(topic, producer_id, partition).await?;

        for _ in 0..=MAX_TAKEN_INDEX_SKIPS {
            let log_index = self.get_log_index(topic, partition).await?;
            let request = BrokerProduceRequest {
                topic: topic.to_string(),
                producer_id: producer_id.to_string(),
                message: message.to_string(),
                partition_index: partition,
                log_index,
            };
            match self.brokers.produce(&broker, &request).await {
                Ok(_) => {
                    self.incr_partition_size(topic, partition).await?;
                    return Ok(ProduceReceipt {
                        broker,
                        partition,
                        log_index,
                    });
                }
                Err(Error::LogIndexTaken) => {
                    // The record there was written before the counters were
                    // restored; count it and move past it.
                    self.incr_partition_size(topic, partition).await?;
                    warn!(topic, partition, log_index, broker = %broker, "Log index already taken, reallocating");
                }
                Err(e) => {
                    warn!(
                        topic,
                        partition,
                        log_index,
                        broker = %broker,
                        error = %e,
                        "Produce failed on broker"
                    );
                    return Err(Error::ClusterNotAvailable(format!(
                        "Unable to produce message on broker {}: {}",
                        broker, e
                    )));
                }
            }
        }
        Err(Error::ClusterNotAvailable(format!(
            "Partition {} of topic {} has no free log index near its counter",
            partition, topic
        )))
    }

    // ========================================================================
    // Broker registry
    // ========================================================================

    pub async fn add_broker(&self, addr: &str) -> Result<()> {
        self.store.register_broker(addr).await?;
        self.checkpoint("broker add").await;
        info!(broker = addr, "Broker added");
        self.sync
            .broadcast(SyncMessage::broker(BrokerChange::Add, addr))
            .await;
        Ok(())
    }

    /// Unregister a broker and drop whatever was still queued for it.
    pub async fn remove_broker(&self, addr: &str) -> Result<()> {
        self.store.broker(addr).await?;
        let purged = self.pending.purge(addr).await?;
        self.store.remove_broker(addr).await?;
        self.checkpoint("broker remove").await;
        info!(broker = addr, purged, "Broker removed");
        self.sync
            .broadcast(SyncMessage::broker(BrokerChange::Remove, addr))
            .await;
        Ok(())
    }

    /// Deliver everything queued for `addr`, oldest first.
    pub async fn replay_pending(&self, addr: &str) -> Result<ReplayOutcome> {
        let brokers = self.brokers.clone();
        self.pending
            .replay(addr, |request| {
                let brokers = brokers.clone();
                async move { brokers.deliver(addr, &request).await }
            })
            .await
    }

    /// Queue `request` for a broker that could not take it.
    ///
    /// The broker may have been activated since the caller saw it inactive,
    /// after its activation replay already ran. In that case the queue is
    /// replayed here so the request does not wait for the next activation.
    async fn queue_for_broker(&self, broker: &str, request: PendingRequest) -> Result<u64> {
        let seq = self.pending.enqueue(broker, request).await?;
        if self.store.is_broker_active(broker).await? {
            let outcome = self.replay_pending(broker).await?;
            if !outcome.is_complete() {
                warn!(
                    broker,
                    remaining = outcome.remaining,
                    "Queued requests not delivered to active broker"
                );
            }
        }
        Ok(seq)
    }

    /// Replay the broker's pending queue, then mark it active.
    ///
    /// A replay that stops early leaves the broker inactive with the rest of
    /// its queue intact. Requests queued between the replay and the status
    /// change are delivered by a second pass.
    pub async fn activate_broker(&self, addr: &str) -> Result<()> {
        if self.store.broker(addr).await?.status.is_active() {
            return Err(Error::BrokerNotInactive);
        }

        let outcome = self.replay_pending(addr).await?;
        if !outcome.is_complete() {
            return Err(Error::ClusterNotAvailable(format!(
                "Unable to play requests for broker {}: {} still pending",
                addr, outcome.remaining
            )));
        }

        let previous = self
            .store
            .set_broker_status(addr, BrokerStatus::Active)
            .await?;
        if previous.is_active() {
            return Err(Error::BrokerNotInactive);
        }

        let late = self.replay_pending(addr).await?;
        if !late.is_complete() {
            warn!(
                broker = addr,
                remaining = late.remaining,
                "Requests queued during activation not delivered"
            );
        }
        metrics::record_broker_transition("activate");
        self.checkpoint("broker activate").await;
        info!(
            broker = addr,
            replayed = outcome.delivered + late.delivered,
            "Broker activated"
        );

        self.sync
            .broadcast(SyncMessage::broker(BrokerChange::Activate, addr))
            .await;
        Ok(())
    }

    pub async fn deactivate_broker(&self, addr: &str) -> Result<()> {
        if !self.store.broker(addr).await?.status.is_active() {
            return Err(Error::BrokerNotActive);
        }
        let previous = self
            .store
            .set_broker_status(addr, BrokerStatus::Inactive)
            .await?;
        if !previous.is_active() {
            return Err(Error::BrokerNotActive);
        }
        metrics::record_broker_transition("deactivate");
        self.checkpoint("broker deactivate").await;
        info!(broker = addr, "Broker deactivated");

        let outcome = self
            .sync
            .broadcast(SyncMessage::broker(BrokerChange::Deactivate, addr))
            .await;
        if !outcome.is_complete() {
            warn!(
                broker = addr,
                failed = outcome.failed,
                "Deactivation not delivered to every read-only manager"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockBrokerClient, RecordingReplicaSync};
    use crate::metadata::{InMemoryMetadataStore, MetadataPersistence};
    use object_store::memory::InMemory;

    struct Fixture {
        manager: DataManager,
        store: Arc<InMemoryMetadataStore>,
        brokers: Arc<MockBrokerClient>,
        sync: Arc<RecordingReplicaSync>,
    }

    async fn fixture(broker_count: usize, replication_factor: usize) -> Fixture {
        let store = Arc::new(InMemoryMetadataStore::new());
        let brokers = Arc::new(MockBrokerClient::new());
        let sync = Arc::new(RecordingReplicaSync::new());
        let pending = Arc::new(PendingRequestQueue::new(Arc::new(InMemory::new())));
        let manager = DataManager::new(
            store.clone(),
            brokers.clone(),
            sync.clone(),
            pending,
            replication_factor,
            2,
        );
        for i in 0..broker_count {
            manager.add_broker(&format!("b{}", i)).await.unwrap();
        }
        Fixture {
            manager,
            store,
            brokers,
            sync,
        }
    }

    #[tokio::test]
    async fn test_add_topic_places_on_least_loaded() {
        let f = fixture(3, 1).await;
        let assignments = f.manager.add_topic_and_return("t", Some(3)).await.unwrap();
        let mut owners: Vec<String> = assignments.iter().map(|a| a.replicas[0].clone()).collect();
        owners.sort();
        assert_eq!(owners, vec!["b0", "b1", "b2"]);

        let ports: Vec<u16> = assignments.iter().map(|a| a.port).collect();
        assert_eq!(ports, vec![5011, 5012, 5013]);
    }

    #[tokio::test]
    async fn test_replication_capped_by_broker_count() {
        let f = fixture(2, 3).await;
        let assignments = f.manager.add_topic_and_return("t", None).await.unwrap();
        assert_eq!(assignments.len(), 2);
        for a in &assignments {
            assert_eq!(a.replicas.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_duplicate_topic_keeps_original_assignment() {
        let f = fixture(3, 1).await;
        f.manager.add_topic_and_return("t", Some(2)).await.unwrap();
        let before = f.store.partition_assignment("t", 0).await.unwrap();
        let loads_before = f.store.list_brokers().await.unwrap();

        let err = f.manager.add_topic_and_return("t", Some(5)).await.unwrap_err();
        assert_eq!(err, Error::TopicAlreadyExists);
        assert_eq!(f.store.partition_count("t").await.unwrap(), 2);
        assert_eq!(f.store.partition_assignment("t", 0).await.unwrap(), before);
        assert_eq!(f.store.list_brokers().await.unwrap(), loads_before);
    }

    #[tokio::test]
    async fn test_topic_rejected_without_brokers() {
        let f = fixture(0, 3).await;
        assert!(matches!(
            f.manager.add_topic_and_return("t", None).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(!f.store.topic_exists("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_topic_queues_for_inactive_broker() {
        let f = fixture(2, 2).await;
        f.manager.deactivate_broker("b1").await.unwrap();

        f.manager.create_topic("t", Some(2)).await.unwrap();

        assert_eq!(f.brokers.created_partitions("b0").len(), 2);
        assert!(f.brokers.created_partitions("b1").is_empty());
        assert_eq!(f.manager.pending().len("b1").await.unwrap(), 2);
        assert!(f.sync.routes().contains(&"/sync/topics".to_string()));
    }

    #[tokio::test]
    async fn test_create_topic_queues_on_rpc_failure() {
        let f = fixture(1, 1).await;
        f.brokers.set_down("b0");
        f.manager.create_topic("t", Some(1)).await.unwrap();
        assert_eq!(f.manager.pending().len("b0").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_register_producer_auto_creates_topic() {
        let f = fixture(1, 1).await;
        let (producer_id, partitions) = f.manager.register_producer("auto").await.unwrap();
        assert_eq!(partitions, 2);
        assert!(f.store.check_producer_registered(&producer_id, "auto").await.unwrap());
        assert_eq!(f.manager.add_producer("missing").await, Err(Error::TopicNotFound));
    }

    #[tokio::test]
    async fn test_consumer_registration_never_creates_topic() {
        let f = fixture(1, 1).await;
        assert_eq!(f.manager.add_consumer("t").await, Err(Error::TopicNotFound));
        assert!(!f.store.topic_exists("t").await.unwrap());

        f.manager.create_topic("t", Some(1)).await.unwrap();
        let (consumer_id, count) = f.manager.add_consumer("t").await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            f.store.peek_consumer_offset(&consumer_id, "t", 0).await.unwrap(),
            0
        );
        assert!(
            f.sync
                .routes()
                .contains(&"/sync/consumer/register".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_partition_mutates_nothing() {
        let f = fixture(1, 1).await;
        f.manager.create_topic("t", Some(2)).await.unwrap();
        let (producer_id, _) = f.manager.add_producer("t").await.unwrap();

        for requested in [2, -1] {
            let err = f
                .manager
                .produce("t", &producer_id, "m", Some(requested))
                .await
                .unwrap_err();
            assert_eq!(err, Error::InvalidPartition);
        }
        assert_eq!(f.store.allocate_log_index("t", 0).await.unwrap(), 0);
        assert_eq!(f.store.allocate_log_index("t", 1).await.unwrap(), 0);
        assert_eq!(
            f.store.next_partition_for_producer(&producer_id).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_unregistered_producer_rejected() {
        let f = fixture(1, 1).await;
        f.manager.create_topic("t", Some(1)).await.unwrap();
        assert_eq!(
            f.manager.get_broker_host("t", "nobody", None).await,
            Err(Error::ProducerNotRegistered)
        );
        assert_eq!(
            f.manager.get_broker_host("nope", "nobody", None).await,
            Err(Error::TopicNotFound)
        );
    }

    #[tokio::test]
    async fn test_round_robin_produce_cycles_partitions() {
        let f = fixture(3, 1).await;
        f.manager.create_topic("t", Some(3)).await.unwrap();
        let (producer_id, _) = f.manager.add_producer("t").await.unwrap();

        let mut partitions = Vec::new();
        for i in 0..6 {
            let receipt = f
                .manager
                .produce("t", &producer_id, &format!("m{}", i), None)
                .await
                .unwrap();
            partitions.push(receipt.partition);
        }
        assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
        for p in 0..3 {
            assert_eq!(f.store.partition_size("t", p).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_produce_skips_partition_without_active_replica() {
        let f = fixture(2, 1).await;
        let assignments = f.manager.create_topic("t", Some(2)).await.unwrap();
        let (producer_id, _) = f.manager.add_producer("t").await.unwrap();
        let down = assignments[0].replicas[0].clone();
        f.manager.deactivate_broker(&down).await.unwrap();

        let receipt = f.manager.produce("t", &producer_id, "m", None).await.unwrap();
        assert_eq!(receipt.partition, 1);

        assert_eq!(
            f.manager.produce("t", &producer_id, "m", Some(0)).await,
            Err(Error::NoActiveBroker)
        );
    }

    #[tokio::test]
    async fn test_failed_produce_wastes_index_without_commit() {
        let f = fixture(1, 1).await;
        f.manager.create_topic("t", Some(1)).await.unwrap();
        let (producer_id, _) = f.manager.add_producer("t").await.unwrap();
        f.brokers.set_down("b0");

        let err = f.manager.produce("t", &producer_id, "m", Some(0)).await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotAvailable(_)));
        assert_eq!(f.store.partition_size("t", 0).await.unwrap(), 0);

        f.brokers.set_up("b0");
        let receipt = f.manager.produce("t", &producer_id, "m", Some(0)).await.unwrap();
        assert_eq!(receipt.log_index, 1);
    }

    #[tokio::test]
    async fn test_produce_after_counter_rollback_keeps_both_records() {
        let f = fixture(1, 1).await;
        f.manager.create_topic("t", Some(1)).await.unwrap();
        let (producer_id, _) = f.manager.add_producer("t").await.unwrap();
        let (consumer_id, _) = f.manager.add_consumer("t").await.unwrap();
        let stale = f.store.snapshot();

        f.manager.produce("t", &producer_id, "m1", Some(0)).await.unwrap();
        f.store.restore(stale);

        let receipt = f.manager.produce("t", &producer_id, "m2", Some(0)).await.unwrap();
        assert_eq!(receipt.log_index, 1);
        let stored: Vec<String> = f
            .brokers
            .log("b0", "t", 0)
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert_eq!(stored, vec!["m1", "m2"]);
        assert_eq!(f.store.partition_size("t", 0).await.unwrap(), 2);
        assert_eq!(f.store.consumer_offset(&consumer_id, "t", 0).await.unwrap(), Some(0));
        assert_eq!(f.store.consumer_offset(&consumer_id, "t", 0).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_broker_admin_transitions() {
        let f = fixture(1, 1).await;
        assert_eq!(f.manager.add_broker("b0").await, Err(Error::BrokerAlreadyExists));
        assert_eq!(f.manager.activate_broker("b0").await, Err(Error::BrokerNotInactive));
        f.manager.deactivate_broker("b0").await.unwrap();
        assert_eq!(f.manager.deactivate_broker("b0").await, Err(Error::BrokerNotActive));
        f.manager.activate_broker("b0").await.unwrap();
        assert_eq!(f.manager.remove_broker("zz").await, Err(Error::BrokerNotFound));
        f.manager.remove_broker("b0").await.unwrap();

        assert_eq!(
            f.sync.routes(),
            vec![
                "/sync/broker/add",
                "/sync/broker/deactivate",
                "/sync/broker/activate",
                "/sync/broker/remove",
            ]
        );
    }

    #[tokio::test]
    async fn test_activation_replays_queue_in_order() {
        let f = fixture(1, 1).await;
        f.manager.deactivate_broker("b0").await.unwrap();
        f.manager.create_topic("a", Some(2)).await.unwrap();
        f.manager.create_topic("b", Some(1)).await.unwrap();
        assert_eq!(f.manager.pending().len("b0").await.unwrap(), 3);

        f.manager.activate_broker("b0").await.unwrap();

        let delivered: Vec<(String, u32)> = f
            .brokers
            .created_partitions("b0")
            .into_iter()
            .map(|r| (r.name, r.partition_index))
            .collect();
        assert_eq!(
            delivered,
            vec![("a".into(), 0), ("a".into(), 1), ("b".into(), 0)]
        );
        assert!(f.manager.pending().is_empty("b0").await.unwrap());
        assert!(f.store.is_broker_active("b0").await.unwrap());
    }

    #[tokio::test]
    async fn test_activation_fails_when_replay_incomplete() {
        let f = fixture(1, 1).await;
        f.manager.deactivate_broker("b0").await.unwrap();
        f.manager.create_topic("t", Some(1)).await.unwrap();
        f.brokers.set_down("b0");

        let err = f.manager.activate_broker("b0").await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotAvailable(_)));
        assert!(!f.store.is_broker_active("b0").await.unwrap());
        assert_eq!(f.manager.pending().len("b0").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_broker_purges_its_queue() {
        let f = fixture(1, 1).await;
        f.manager.deactivate_broker("b0").await.unwrap();
        f.manager.create_topic("t", Some(2)).await.unwrap();
        assert_eq!(f.manager.pending().len("b0").await.unwrap(), 2);

        f.manager.remove_broker("b0").await.unwrap();
        assert!(f.manager.pending().is_empty("b0").await.unwrap());

        // The same address joining again starts with nothing to replay.
        f.manager.add_broker("b0").await.unwrap();
        f.manager.deactivate_broker("b0").await.unwrap();
        f.manager.activate_broker("b0").await.unwrap();
        assert!(f.brokers.created_partitions("b0").is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_placement_across_restart() {
        let object_store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
        let store = Arc::new(InMemoryMetadataStore::new());
        let checkpoint = Arc::new(MetadataCheckpoint::new(
            store.clone(),
            MetadataPersistence::new(object_store.clone()),
        ));
        let manager = DataManager::new(
            store,
            Arc::new(MockBrokerClient::new()),
            Arc::new(RecordingReplicaSync::new()),
            Arc::new(PendingRequestQueue::new(object_store.clone())),
            1,
            2,
        )
        .with_checkpoint(checkpoint);
        manager.add_broker("b0").await.unwrap();
        let assignments = manager.create_topic("t", Some(2)).await.unwrap();

        let restarted = InMemoryMetadataStore::new();
        assert!(
            MetadataPersistence::new(object_store)
                .restore_into(&restarted)
                .await
                .unwrap()
        );
        assert_eq!(restarted.list_topics().await.unwrap(), vec!["t"]);
        let next = restarted.next_replica_port().await.unwrap();
        assert!(assignments.iter().all(|a| a.port < next));
    }

    /// Delegates to the mock. The first partition create it sees also queues
    /// a create for the next partition from another task, landing while the
    /// broker's activation is in progress.
    struct EnqueueDuringReplay {
        inner: Arc<MockBrokerClient>,
        manager: std::sync::OnceLock<std::sync::Weak<DataManager>>,
        late: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    }

    #[async_trait::async_trait]
    impl BrokerClient for EnqueueDuringReplay {
        async fn ping(&self, broker: &str) -> Result<()> {
            self.inner.ping(broker).await
        }

        async fn create_partition(
            &self,
            broker: &str,
            request: &CreatePartitionRequest,
        ) -> Result<()> {
            self.inner.create_partition(broker, request).await?;
            let mut late = self.late.lock().unwrap();
            if late.is_none()
                && let Some(manager) = self.manager.get().and_then(std::sync::Weak::upgrade)
            {
                let broker = broker.to_string();
                let mut next = request.clone();
                next.partition_index += 1;
                *late = Some(tokio::spawn(async move {
                    manager
                        .queue_for_broker(&broker, PendingRequest::CreatePartition(next))
                        .await
                        .unwrap();
                }));
            }
            Ok(())
        }

        async fn produce(&self, broker: &str, request: &BrokerProduceRequest) -> Result<LogIndex> {
            self.inner.produce(broker, request).await
        }

        async fn consume(
            &self,
            broker: &str,
            request: &crate::api::BrokerConsumeRequest,
        ) -> Result<crate::api::BrokerConsumeResponse> {
            self.inner.consume(broker, request).await
        }
    }

    #[tokio::test]
    async fn test_request_queued_during_activation_is_delivered() {
        let mock = Arc::new(MockBrokerClient::new());
        let client = Arc::new(EnqueueDuringReplay {
            inner: mock.clone(),
            manager: std::sync::OnceLock::new(),
            late: std::sync::Mutex::new(None),
        });
        let manager = Arc::new(DataManager::new(
            Arc::new(InMemoryMetadataStore::new()),
            client.clone(),
            Arc::new(RecordingReplicaSync::new()),
            Arc::new(PendingRequestQueue::new(Arc::new(InMemory::new()))),
            1,
            1,
        ));
        assert!(client.manager.set(Arc::downgrade(&manager)).is_ok());

        manager.add_broker("b0").await.unwrap();
        manager.deactivate_broker("b0").await.unwrap();
        manager.create_topic("t", Some(1)).await.unwrap();
        assert_eq!(manager.pending().len("b0").await.unwrap(), 1);

        manager.activate_broker("b0").await.unwrap();
        let late = client.late.lock().unwrap().take().unwrap();
        late.await.unwrap();

        assert!(mock.hosts_partition("b0", "t", 0));
        assert!(mock.hosts_partition("b0", "t", 1));
        assert!(manager.pending().is_empty("b0").await.unwrap());
    }
}
