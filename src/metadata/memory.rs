//! Sharded in-memory metadata store.
//!
//! Every record class lives in its own `DashMap`, and every counter is
//! mutated under the shard guard of its own key:
//!
//! - partition counters (`size_pre`, `size_post`) under the partition key
//! - consumer offsets under `(consumer, partition key)`
//! - producer cursors under the producer id
//! - broker load and health under the broker address
//!
//! Topic creation is the one place that nests guards: it fills `partitions`
//! while holding the new topic's vacant `topics` entry, so readers never see
//! a topic without its partitions. Lock order is `topics` before `partitions`,
//! and no operation takes a `topics` guard while holding any other.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::MetadataStore;
use crate::constants::{HEALTH_FLOOR, HEALTH_OK, MAX_PARTITIONS_PER_TOPIC, REPLICA_PORT_BASE};
use crate::error::{Error, Result};
use crate::types::{
    BrokerAddr, BrokerInfo, BrokerStatus, HealthUpdate, LogIndex, PartitionAssignment,
    PartitionIndex, PartitionKey,
};

#[derive(Debug, Clone)]
struct TopicEntry {
    partition_count: u32,
    created_seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionEntry {
    replicas: Vec<BrokerAddr>,
    port: u16,
    size_pre: u64,
    size_post: u64,
}

#[derive(Debug, Clone)]
struct ProducerEntry {
    topic: String,
    cursor: PartitionIndex,
}

/// Serializable image of an [`InMemoryMetadataStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub brokers: Vec<BrokerInfo>,
    pub topics: Vec<TopicSnapshot>,
    pub producers: Vec<(String, String, PartitionIndex)>,
    pub consumers: Vec<(String, String)>,
    pub offsets: Vec<OffsetSnapshot>,
    pub next_port: u16,
    pub broker_seq: u64,
    pub topic_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub name: String,
    pub created_seq: u64,
    pub partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub replicas: Vec<BrokerAddr>,
    pub port: u16,
    pub size_pre: u64,
    pub size_post: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetSnapshot {
    pub consumer_id: String,
    pub topic: String,
    pub partition: PartitionIndex,
    pub offset: LogIndex,
}

pub struct InMemoryMetadataStore {
    brokers: DashMap<BrokerAddr, BrokerInfo>,
    topics: DashMap<String, TopicEntry>,
    partitions: DashMap<PartitionKey, PartitionEntry>,
    producers: DashMap<String, ProducerEntry>,
    consumers: DashMap<String, String>,
    offsets: DashMap<(String, PartitionKey), LogIndex>,
    next_port: AtomicU16,
    broker_seq: AtomicU64,
    topic_seq: AtomicU64,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            brokers: DashMap::new(),
            topics: DashMap::new(),
            partitions: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            offsets: DashMap::new(),
            next_port: AtomicU16::new(REPLICA_PORT_BASE),
            broker_seq: AtomicU64::new(0),
            topic_seq: AtomicU64::new(0),
        }
    }

    fn partition_key(&self, topic: &str, partition: PartitionIndex) -> Result<PartitionKey> {
        let count = self
            .topics
            .get(topic)
            .map(|t| t.partition_count)
            .ok_or(Error::TopicNotFound)?;
        if partition >= count {
            return Err(Error::NotFound(format!("Partition {} of topic {}", partition, topic)));
        }
        Ok(PartitionKey::new(topic, partition))
    }

    /// Capture the whole store.
    ///
    /// Offsets are read before partition counters, so a restored offset can
    /// never exceed its restored partition size even though the capture is
    /// not a single atomic cut.
    pub fn snapshot(&self) -> MetadataSnapshot {
        let offsets = self
            .offsets
            .iter()
            .map(|entry| {
                let (consumer_id, key) = entry.key();
                OffsetSnapshot {
                    consumer_id: consumer_id.clone(),
                    topic: key.topic.clone(),
                    partition: key.partition,
                    offset: *entry.value(),
                }
            })
            .collect();

        let mut topics: Vec<TopicSnapshot> = self
            .topics
            .iter()
            .map(|entry| TopicSnapshot {
                name: entry.key().clone(),
                created_seq: entry.created_seq,
                partitions: Vec::with_capacity(entry.partition_count as usize),
            })
            .collect();
        topics.sort_by_key(|t| t.created_seq);
        for topic in &mut topics {
            let count = self
                .topics
                .get(&topic.name)
                .map(|t| t.partition_count)
                .unwrap_or(0);
            for partition in 0..count {
                let key = PartitionKey::new(topic.name.clone(), partition);
                let entry = self
                    .partitions
                    .get(&key)
                    .map(|p| p.clone())
                    .unwrap_or_default();
                topic.partitions.push(PartitionSnapshot {
                    replicas: entry.replicas,
                    port: entry.port,
                    size_pre: entry.size_pre,
                    size_post: entry.size_post,
                });
            }
        }

        let mut brokers: Vec<BrokerInfo> = self.brokers.iter().map(|b| b.clone()).collect();
        brokers.sort_by_key(|b| b.registered_seq);

        MetadataSnapshot {
            brokers,
            topics,
            producers: self
                .producers
                .iter()
                .map(|p| (p.key().clone(), p.topic.clone(), p.cursor))
                .collect(),
            consumers: self
                .consumers
                .iter()
                .map(|c| (c.key().clone(), c.value().clone()))
                .collect(),
            offsets,
            next_port: self.next_port.load(Ordering::SeqCst),
            broker_seq: self.broker_seq.load(Ordering::SeqCst),
            topic_seq: self.topic_seq.load(Ordering::SeqCst),
        }
    }

    /// Replace the store's contents with `snapshot`.
    pub fn restore(&self, snapshot: MetadataSnapshot) {
        self.brokers.clear();
        self.topics.clear();
        self.partitions.clear();
        self.producers.clear();
        self.consumers.clear();
        self.offsets.clear();

        for broker in snapshot.brokers {
            self.brokers.insert(broker.addr.clone(), broker);
        }
        for topic in snapshot.topics {
            for (index, partition) in topic.partitions.iter().enumerate() {
                self.partitions.insert(
                    PartitionKey::new(topic.name.clone(), index as PartitionIndex),
                    PartitionEntry {
                        replicas: partition.replicas.clone(),
                        port: partition.port,
                        size_pre: partition.size_pre,
                        size_post: partition.size_post,
                    },
                );
            }
            self.topics.insert(
                topic.name,
                TopicEntry {
                    partition_count: topic.partitions.len() as u32,
                    created_seq: topic.created_seq,
                },
            );
        }
        for (id, topic, cursor) in snapshot.producers {
            self.producers.insert(id, ProducerEntry { topic, cursor });
        }
        for (id, topic) in snapshot.consumers {
            self.consumers.insert(id, topic);
        }
        for offset in snapshot.offsets {
            self.offsets.insert(
                (
                    offset.consumer_id,
                    PartitionKey::new(offset.topic, offset.partition),
                ),
                offset.offset,
            );
        }
        self.next_port.store(snapshot.next_port, Ordering::SeqCst);
        self.broker_seq.store(snapshot.broker_seq, Ordering::SeqCst);
        self.topic_seq.store(snapshot.topic_seq, Ordering::SeqCst);

        info!(
            brokers = self.brokers.len(),
            topics = self.topics.len(),
            "Restored metadata store"
        );
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn register_broker(&self, addr: &str) -> Result<()> {
        match self.brokers.entry(addr.to_string()) {
            Entry::Occupied(_) => Err(Error::BrokerAlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(BrokerInfo {
                    addr: addr.to_string(),
                    partition_load: 0,
                    health: HEALTH_OK,
                    status: BrokerStatus::Active,
                    registered_seq: self.broker_seq.fetch_add(1, Ordering::SeqCst),
                });
                debug!(broker = addr, "Registered broker");
                Ok(())
            }
        }
    }

    async fn remove_broker(&self, addr: &str) -> Result<()> {
        self.brokers
            .remove(addr)
            .map(|_| ())
            .ok_or(Error::BrokerNotFound)
    }

    async fn list_brokers(&self) -> Result<Vec<BrokerInfo>> {
        let mut brokers: Vec<BrokerInfo> = self.brokers.iter().map(|b| b.clone()).collect();
        brokers.sort_by_key(|b| b.registered_seq);
        Ok(brokers)
    }

    async fn broker(&self, addr: &str) -> Result<BrokerInfo> {
        self.brokers
            .get(addr)
            .map(|b| b.clone())
            .ok_or(Error::BrokerNotFound)
    }

    async fn set_broker_health(&self, addr: &str, update: HealthUpdate) -> Result<i32> {
        let mut broker = self.brokers.get_mut(addr).ok_or(Error::BrokerNotFound)?;
        broker.health = match update {
            HealthUpdate::Decrement => (broker.health - 1).max(HEALTH_FLOOR),
            HealthUpdate::Reset => HEALTH_OK,
        };
        Ok(broker.health)
    }

    async fn set_broker_status(&self, addr: &str, status: BrokerStatus) -> Result<BrokerStatus> {
        let mut broker = self.brokers.get_mut(addr).ok_or(Error::BrokerNotFound)?;
        let previous = broker.status;
        broker.status = status;
        Ok(previous)
    }

    async fn is_broker_active(&self, addr: &str) -> Result<bool> {
        self.brokers
            .get(addr)
            .map(|b| b.status.is_active())
            .ok_or(Error::BrokerNotFound)
    }

    async fn least_loaded_brokers(&self, n: usize) -> Result<Vec<BrokerAddr>> {
        let mut brokers: Vec<BrokerInfo> = self.brokers.iter().map(|b| b.clone()).collect();
        brokers.sort_by_key(|b| (!b.status.is_active(), b.partition_load, b.registered_seq));
        Ok(brokers.into_iter().take(n).map(|b| b.addr).collect())
    }

    async fn increment_broker_load(&self, addrs: &[BrokerAddr]) -> Result<()> {
        for addr in addrs {
            let mut broker = self.brokers.get_mut(addr).ok_or(Error::BrokerNotFound)?;
            broker.partition_load += 1;
        }
        Ok(())
    }

    async fn create_topic(&self, name: &str, partition_count: u32) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidRequest("Topic name must not be empty.".into()));
        }
        if partition_count == 0 || partition_count > MAX_PARTITIONS_PER_TOPIC {
            return Err(Error::InvalidRequest(format!(
                "number_of_partitions must be between 1 and {}.",
                MAX_PARTITIONS_PER_TOPIC
            )));
        }

        match self.topics.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::TopicAlreadyExists),
            Entry::Vacant(slot) => {
                for partition in 0..partition_count {
                    self.partitions
                        .insert(PartitionKey::new(name, partition), PartitionEntry::default());
                }
                slot.insert(TopicEntry {
                    partition_count,
                    created_seq: self.topic_seq.fetch_add(1, Ordering::SeqCst),
                });
                Ok(())
            }
        }
    }

    async fn topic_exists(&self, name: &str) -> Result<bool> {
        Ok(self.topics.contains_key(name))
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut topics: Vec<(u64, String)> = self
            .topics
            .iter()
            .map(|t| (t.created_seq, t.key().clone()))
            .collect();
        topics.sort();
        Ok(topics.into_iter().map(|(_, name)| name).collect())
    }

    async fn partition_count(&self, name: &str) -> Result<u32> {
        self.topics
            .get(name)
            .map(|t| t.partition_count)
            .ok_or(Error::TopicNotFound)
    }

    async fn assign_partition_brokers(
        &self,
        topic: &str,
        partition: PartitionIndex,
        replicas: Vec<BrokerAddr>,
        port: u16,
    ) -> Result<()> {
        let key = self.partition_key(topic, partition)?;
        let mut entry = self
            .partitions
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("Partition {}", key)))?;
        entry.replicas = replicas;
        entry.port = port;
        Ok(())
    }

    async fn partition_assignment(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<PartitionAssignment> {
        let key = self.partition_key(topic, partition)?;
        let entry = self
            .partitions
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("Partition {}", key)))?;
        Ok(PartitionAssignment {
            partition,
            replicas: entry.replicas.clone(),
            port: entry.port,
        })
    }

    async fn next_replica_port(&self) -> Result<u16> {
        let previous = self
            .next_port
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_add(1))
            .map_err(|_| Error::Storage("Replica port range exhausted".into()))?;
        Ok(previous + 1)
    }

    async fn register_producer(&self, producer_id: &str, topic: &str) -> Result<()> {
        if !self.topics.contains_key(topic) {
            return Err(Error::TopicNotFound);
        }
        self.producers.insert(
            producer_id.to_string(),
            ProducerEntry {
                topic: topic.to_string(),
                cursor: 0,
            },
        );
        Ok(())
    }

    async fn register_consumer(&self, consumer_id: &str, topic: &str) -> Result<()> {
        let count = self
            .topics
            .get(topic)
            .map(|t| t.partition_count)
            .ok_or(Error::TopicNotFound)?;
        self.consumers
            .insert(consumer_id.to_string(), topic.to_string());
        for partition in 0..count {
            self.offsets
                .entry((consumer_id.to_string(), PartitionKey::new(topic, partition)))
                .or_insert(0);
        }
        Ok(())
    }

    async fn check_producer_registered(&self, producer_id: &str, topic: &str) -> Result<bool> {
        Ok(self
            .producers
            .get(producer_id)
            .is_some_and(|p| p.topic == topic))
    }

    async fn check_consumer_registered(&self, consumer_id: &str, topic: &str) -> Result<bool> {
        Ok(self
            .consumers
            .get(consumer_id)
            .is_some_and(|t| t.as_str() == topic))
    }

    async fn list_consumers(&self, topic: &str) -> Result<Vec<String>> {
        if !self.topics.contains_key(topic) {
            return Err(Error::TopicNotFound);
        }
        let mut consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|c| c.value() == topic)
            .map(|c| c.key().clone())
            .collect();
        consumers.sort();
        Ok(consumers)
    }

    async fn next_partition_for_producer(&self, producer_id: &str) -> Result<PartitionIndex> {
        let topic = self
            .producers
            .get(producer_id)
            .map(|p| p.topic.clone())
            .ok_or(Error::ProducerNotRegistered)?;
        let count = self.partition_count(&topic).await?;

        let mut producer = self
            .producers
            .get_mut(producer_id)
            .ok_or(Error::ProducerNotRegistered)?;
        let current = producer.cursor % count;
        producer.cursor = (current + 1) % count;
        Ok(current)
    }

    async fn allocate_log_index(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<LogIndex> {
        let key = self.partition_key(topic, partition)?;
        let mut entry = self
            .partitions
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("Partition {}", key)))?;
        let index = entry.size_pre;
        entry.size_pre += 1;
        Ok(index)
    }

    async fn commit_partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64> {
        let key = self.partition_key(topic, partition)?;
        let mut entry = self
            .partitions
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("Partition {}", key)))?;
        if entry.size_post >= entry.size_pre {
            return Err(Error::InvalidRequest(format!(
                "Partition {} has no allocated index left to commit.",
                key
            )));
        }
        entry.size_post += 1;
        Ok(entry.size_post)
    }

    async fn partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64> {
        let key = self.partition_key(topic, partition)?;
        self.partitions
            .get(&key)
            .map(|p| p.size_post)
            .ok_or_else(|| Error::NotFound(format!("Partition {}", key)))
    }

    async fn consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<Option<LogIndex>> {
        // size_post only grows, so comparing against a value read before the
        // offset guard is taken can only under-deliver, never over-deliver.
        let size = self.partition_size(topic, partition).await?;
        let key = (consumer_id.to_string(), PartitionKey::new(topic, partition));
        let mut offset = self
            .offsets
            .get_mut(&key)
            .ok_or(Error::ConsumerNotRegistered)?;
        if *offset < size {
            let claimed = *offset;
            *offset += 1;
            Ok(Some(claimed))
        } else {
            Ok(None)
        }
    }

    async fn peek_consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<LogIndex> {
        self.partition_key(topic, partition)?;
        let key = (consumer_id.to_string(), PartitionKey::new(topic, partition));
        self.offsets
            .get(&key)
            .map(|o| *o)
            .ok_or(Error::ConsumerNotRegistered)
    }
}
