//! Metadata store: the single owner of brokers, topics, partitions,
//! producers, consumers, size counters and offsets.
//!
//! [`MetadataStore`] is the interface every manager codes against:
//!
//! - [`InMemoryMetadataStore`] is the authoritative store hosted by the
//!   primary. Counters are sharded per key, so unrelated partitions never
//!   contend on one lock.
//! - [`RemoteMetadataStore`] forwards each call as a [`MetadataCommand`] to the
//!   primary's `/metadata` endpoint, so read-only managers share the same
//!   atomic offsets and sizes.
//! - [`MetadataPersistence`] snapshots the in-memory store to an object store,
//!   and [`MetadataCheckpoint`] serializes those saves for the live primary.

mod commands;
mod memory;
mod persistence;
mod remote;

pub use commands::{MetadataCommand, MetadataResponse, dispatch};
pub use memory::{InMemoryMetadataStore, MetadataSnapshot};
pub use persistence::{MetadataCheckpoint, MetadataPersistence};
pub use remote::RemoteMetadataStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    BrokerAddr, BrokerInfo, BrokerStatus, HealthUpdate, LogIndex, PartitionAssignment,
    PartitionIndex,
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ----- brokers -----

    /// Register a new broker, active with a clean health record.
    async fn register_broker(&self, addr: &str) -> Result<()>;

    async fn remove_broker(&self, addr: &str) -> Result<()>;

    /// Brokers in registration order.
    async fn list_brokers(&self) -> Result<Vec<BrokerInfo>>;

    async fn broker(&self, addr: &str) -> Result<BrokerInfo>;

    /// Apply a health update and return the new counter (never below the floor).
    async fn set_broker_health(&self, addr: &str, update: HealthUpdate) -> Result<i32>;

    /// Set membership status and return the previous one.
    async fn set_broker_status(&self, addr: &str, status: BrokerStatus) -> Result<BrokerStatus>;

    async fn is_broker_active(&self, addr: &str) -> Result<bool>;

    /// Up to `n` distinct brokers, active before inactive, then by load,
    /// then by registration order.
    async fn least_loaded_brokers(&self, n: usize) -> Result<Vec<BrokerAddr>>;

    async fn increment_broker_load(&self, addrs: &[BrokerAddr]) -> Result<()>;

    // ----- topics and partitions -----

    async fn create_topic(&self, name: &str, partition_count: u32) -> Result<()>;

    async fn topic_exists(&self, name: &str) -> Result<bool>;

    /// Topic names in creation order.
    async fn list_topics(&self) -> Result<Vec<String>>;

    async fn partition_count(&self, name: &str) -> Result<u32>;

    async fn assign_partition_brokers(
        &self,
        topic: &str,
        partition: PartitionIndex,
        replicas: Vec<BrokerAddr>,
        port: u16,
    ) -> Result<()>;

    async fn partition_assignment(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<PartitionAssignment>;

    async fn brokers_for_partition(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<Vec<BrokerAddr>> {
        Ok(self.partition_assignment(topic, partition).await?.replicas)
    }

    /// Allocate a cluster-unique Raft control port.
    async fn next_replica_port(&self) -> Result<u16>;

    // ----- producers and consumers -----

    async fn register_producer(&self, producer_id: &str, topic: &str) -> Result<()>;

    async fn register_consumer(&self, consumer_id: &str, topic: &str) -> Result<()>;

    async fn check_producer_registered(&self, producer_id: &str, topic: &str) -> Result<bool>;

    async fn check_consumer_registered(&self, consumer_id: &str, topic: &str) -> Result<bool>;

    async fn list_consumers(&self, topic: &str) -> Result<Vec<String>>;

    /// Round-robin get-and-increment of the producer's partition cursor.
    async fn next_partition_for_producer(&self, producer_id: &str) -> Result<PartitionIndex>;

    // ----- counters -----

    /// Atomic increment of `size_pre`; returns the pre-increment value.
    async fn allocate_log_index(&self, topic: &str, partition: PartitionIndex)
    -> Result<LogIndex>;

    /// Atomic increment of `size_post`; returns the new committed size.
    async fn commit_partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64>;

    /// Committed size (`size_post`).
    async fn partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64>;

    /// Conditional atomic increment of a consumer offset.
    ///
    /// Returns the old offset and advances it when it is below the committed
    /// size; returns `None` without mutating otherwise.
    async fn consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<Option<LogIndex>>;

    /// Current offset without advancing it.
    async fn peek_consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<LogIndex>;
}
