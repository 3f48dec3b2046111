//! Consume-path routing on a read-only manager.
//!
//! The manager keeps a local cache of topics, consumer registrations and
//! broker states. The primary pushes every change through the `/sync/*`
//! endpoints; a cache miss falls back to the shared metadata store, so a
//! lost push only costs one extra lookup. Offsets and sizes are never cached:
//! they are claimed atomically at the metadata authority.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::api::{BrokerConsumeRequest, PartitionSize, SyncTopicRequest};
use crate::client::{BrokerChange, BrokerClient};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::metrics;
use crate::types::{
    BrokerAddr, BrokerStatus, LogIndex, PartitionIndex, RequestedPartition, partition_in_range,
};

#[derive(Debug, Clone)]
struct TopicRoute {
    seq: u64,
    /// Replica set of each partition, in partition order.
    replicas: Vec<Vec<BrokerAddr>>,
}

impl TopicRoute {
    fn partition_count(&self) -> u32 {
        self.replicas.len() as u32
    }
}

/// Result of a consume request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Message {
        partition: PartitionIndex,
        log_index: LogIndex,
        producer_id: String,
        message: String,
    },
    /// Every partition tried was fully consumed.
    Empty { partition: PartitionIndex },
}

impl ConsumeOutcome {
    pub fn partition(&self) -> PartitionIndex {
        match self {
            ConsumeOutcome::Message { partition, .. } | ConsumeOutcome::Empty { partition } => {
                *partition
            }
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ConsumeOutcome::Message { message, .. } => Some(message),
            ConsumeOutcome::Empty { .. } => None,
        }
    }
}

pub struct ReadonlyManager {
    store: Arc<dyn MetadataStore>,
    brokers: Arc<dyn BrokerClient>,
    topics: DashMap<String, TopicRoute>,
    topic_seq: AtomicU64,
    consumers: DashMap<String, HashSet<String>>,
    broker_status: DashMap<BrokerAddr, BrokerStatus>,
    /// Next partition to try per consumer.
    cursors: DashMap<String, PartitionIndex>,
}

impl ReadonlyManager {
    pub fn new(store: Arc<dyn MetadataStore>, brokers: Arc<dyn BrokerClient>) -> Self {
        Self {
            store,
            brokers,
            topics: DashMap::new(),
            topic_seq: AtomicU64::new(0),
            consumers: DashMap::new(),
            broker_status: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    /// Rebuild the routing cache from the metadata store.
    pub async fn bootstrap(&self) -> Result<()> {
        self.topics.clear();
        self.consumers.clear();
        self.broker_status.clear();

        for broker in self.store.list_brokers().await? {
            self.broker_status.insert(broker.addr, broker.status);
        }
        let topics = self.store.list_topics().await?;
        for topic in &topics {
            self.load_topic(topic).await?;
            let consumers: HashSet<String> =
                self.store.list_consumers(topic).await?.into_iter().collect();
            self.consumers.insert(topic.clone(), consumers);
        }

        info!(
            topics = topics.len(),
            brokers = self.broker_status.len(),
            "Read-only routing cache bootstrapped"
        );
        Ok(())
    }

    async fn load_topic(&self, topic: &str) -> Result<()> {
        let count = self.store.partition_count(topic).await?;
        let mut replicas = Vec::with_capacity(count as usize);
        for p in 0..count {
            replicas.push(self.store.brokers_for_partition(topic, p).await?);
        }
        self.insert_topic(topic, replicas);
        Ok(())
    }

    fn insert_topic(&self, topic: &str, replicas: Vec<Vec<BrokerAddr>>) -> bool {
        let mut inserted = false;
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            inserted = true;
            TopicRoute {
                seq: self.topic_seq.fetch_add(1, Ordering::Relaxed),
                replicas,
            }
        });
        inserted
    }

    /// Partition count of a known topic, loading it from the store on a miss.
    async fn topic_partitions(&self, topic: &str) -> Result<u32> {
        if let Some(route) = self.topics.get(topic) {
            return Ok(route.partition_count());
        }
        if !self.store.topic_exists(topic).await? {
            return Err(Error::TopicNotFound);
        }
        debug!(topic, "Topic missing from routing cache, loading from store");
        self.load_topic(topic).await?;
        self.topics
            .get(topic)
            .map(|route| route.partition_count())
            .ok_or(Error::TopicNotFound)
    }

    async fn consumer_known(&self, topic: &str, consumer_id: &str) -> Result<bool> {
        let cached = self
            .consumers
            .get(topic)
            .is_some_and(|set| set.contains(consumer_id));
        if cached {
            return Ok(true);
        }
        if self
            .store
            .check_consumer_registered(consumer_id, topic)
            .await?
        {
            self.consumers
                .entry(topic.to_string())
                .or_default()
                .insert(consumer_id.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Add a topic pushed by the primary. Known topics are left unchanged.
    pub fn sync_topic(&self, request: SyncTopicRequest) -> Result<()> {
        if request.broker_list.len() != request.number_of_partitions as usize {
            return Err(Error::InvalidRequest(format!(
                "broker_list has {} entries for {} partitions",
                request.broker_list.len(),
                request.number_of_partitions
            )));
        }
        if self.insert_topic(&request.name, request.broker_list) {
            debug!(topic = %request.name, "Topic synced");
        }
        Ok(())
    }

    pub fn sync_consumer(&self, topic: &str, consumer_id: &str) {
        self.consumers
            .entry(topic.to_string())
            .or_default()
            .insert(consumer_id.to_string());
    }

    pub fn sync_broker(&self, change: BrokerChange, broker: &str) {
        match change {
            BrokerChange::Add => {
                self.broker_status
                    .entry(broker.to_string())
                    .or_insert(BrokerStatus::Active);
            }
            BrokerChange::Remove => {
                self.broker_status.remove(broker);
            }
            BrokerChange::Activate => {
                self.broker_status
                    .insert(broker.to_string(), BrokerStatus::Active);
            }
            BrokerChange::Deactivate => {
                self.broker_status
                    .insert(broker.to_string(), BrokerStatus::Inactive);
            }
        }
        debug!(broker, change = change.as_str(), "Broker state synced");
    }

    /// Cached state; brokers never heard of are assumed active.
    pub fn broker_is_active(&self, broker: &str) -> bool {
        self.broker_status
            .get(broker)
            .map(|status| status.is_active())
            .unwrap_or(true)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Cached topic names in the order they became known.
    pub fn get_topics(&self) -> Vec<String> {
        let mut topics: Vec<(u64, String)> = self
            .topics
            .iter()
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        topics.sort();
        topics.into_iter().map(|(_, name)| name).collect()
    }

    /// Check topic, partition range and registration; returns the partition count.
    pub async fn is_request_valid(
        &self,
        topic: &str,
        consumer_id: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<u32> {
        let count = self.topic_partitions(topic).await?;
        if let Some(requested) = partition
            && partition_in_range(requested, count).is_none()
        {
            return Err(Error::InvalidReadPartition);
        }
        if !self.consumer_known(topic, consumer_id).await? {
            return Err(Error::ConsumerNotRegistered);
        }
        Ok(count)
    }

    /// Per-consumer round robin, starting from a random partition.
    pub async fn find_best_partition(&self, topic: &str, consumer_id: &str) -> Result<PartitionIndex> {
        let count = self.topic_partitions(topic).await?;
        let mut cursor = self
            .cursors
            .entry(consumer_id.to_string())
            .or_insert_with(|| fastrand::u32(0..count));
        let partition = *cursor % count;
        *cursor = (partition + 1) % count;
        Ok(partition)
    }

    /// Claim the consumer's next offset and read it from an active replica.
    ///
    /// With an explicit partition only that partition is tried; otherwise up
    /// to every partition in round-robin order. A claimed offset whose record
    /// no replica can serve fails with [`Error::NoBrokersAvailable`].
    pub async fn consume(
        &self,
        topic: &str,
        consumer_id: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<ConsumeOutcome> {
        let result = self.consume_inner(topic, consumer_id, partition).await;
        let status = match &result {
            Ok(ConsumeOutcome::Message { .. }) => "message",
            Ok(ConsumeOutcome::Empty { .. }) => "empty",
            Err(_) => "error",
        };
        metrics::record_consume(status);
        result
    }

    async fn consume_inner(
        &self,
        topic: &str,
        consumer_id: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<ConsumeOutcome> {
        let count = self.is_request_valid(topic, consumer_id, partition).await?;
        let explicit = partition.and_then(|p| partition_in_range(p, count));
        let (start, tries) = match explicit {
            Some(p) => (p, 1),
            None => (self.find_best_partition(topic, consumer_id).await?, count),
        };

        for i in 0..tries {
            let p = (start + i) % count;
            let Some(log_index) = self.store.consumer_offset(consumer_id, topic, p).await? else {
                continue;
            };
            return self.read_from_replicas(topic, p, log_index).await;
        }
        Ok(ConsumeOutcome::Empty { partition: start })
    }

    async fn read_from_replicas(
        &self,
        topic: &str,
        partition: PartitionIndex,
        log_index: LogIndex,
    ) -> Result<ConsumeOutcome> {
        let mut replicas = match self.topics.get(topic) {
            Some(route) => route
                .replicas
                .get(partition as usize)
                .cloned()
                .unwrap_or_default(),
            None => self.store.brokers_for_partition(topic, partition).await?,
        };
        fastrand::shuffle(&mut replicas);

        let request = BrokerConsumeRequest {
            topic: topic.to_string(),
            partition_index: partition,
            log_index,
        };
        for broker in replicas.iter().filter(|b| self.broker_is_active(b)) {
            match self.brokers.consume(broker, &request).await {
                Ok(reply) => {
                    return Ok(ConsumeOutcome::Message {
                        partition,
                        log_index,
                        producer_id: reply.producer_id,
                        message: reply.message,
                    });
                }
                Err(e) => {
                    warn!(
                        broker = %broker,
                        topic,
                        partition,
                        log_index,
                        error = %e,
                        "Replica read failed, trying next replica"
                    );
                }
            }
        }
        Err(Error::NoBrokersAvailable)
    }

    /// Unread messages per partition: committed size minus the consumer's offset.
    pub async fn size(
        &self,
        topic: &str,
        consumer_id: &str,
        partition: Option<RequestedPartition>,
    ) -> Result<Vec<PartitionSize>> {
        let count = self.is_request_valid(topic, consumer_id, partition).await?;
        let explicit = partition.and_then(|p| partition_in_range(p, count));
        let partitions: Vec<PartitionIndex> = match explicit {
            Some(p) => vec![p],
            None => (0..count).collect(),
        };

        let mut sizes = Vec::with_capacity(partitions.len());
        for p in partitions {
            let committed = self.store.partition_size(topic, p).await?;
            let offset = self.store.peek_consumer_offset(consumer_id, topic, p).await?;
            sizes.push(PartitionSize {
                partition_number: p,
                size: committed.saturating_sub(offset),
            });
        }
        Ok(sizes)
    }
}
