//! Shared domain types.
//!
//! These are the records the metadata store owns and the values that travel
//! between managers, brokers and replicas.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a broker's HTTP API, `host:port` (or a bare host).
pub type BrokerAddr = String;

/// Index of a partition within its topic.
pub type PartitionIndex = u32;

/// Partition index as a client sent it; may be out of range or negative.
pub type RequestedPartition = i64;

/// `requested` as an index into a topic of `count` partitions, if it is one.
pub fn partition_in_range(requested: RequestedPartition, count: u32) -> Option<PartitionIndex> {
    PartitionIndex::try_from(requested)
        .ok()
        .filter(|p| *p < count)
}

/// Partition-relative position of a log record.
pub type LogIndex = u64;

/// Identifies one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: PartitionIndex,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: PartitionIndex) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Membership state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerStatus {
    Active,
    Inactive,
}

impl BrokerStatus {
    pub fn is_active(self) -> bool {
        self == BrokerStatus::Active
    }
}

/// A broker as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub addr: BrokerAddr,
    /// Number of partition replicas placed on this broker.
    pub partition_load: u64,
    /// 0 when healthy, decremented per failed check down to the floor.
    pub health: i32,
    pub status: BrokerStatus,
    /// Registration order, used for deterministic tie breaks.
    pub registered_seq: u64,
}

/// Change applied to a broker's health counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthUpdate {
    /// One failed check attempt.
    Decrement,
    /// A successful check.
    Reset,
}

/// Placement of one partition: who replicates it and on which control port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition: PartitionIndex,
    /// Ordered replica set; the first broker is the preferred leader.
    pub replicas: Vec<BrokerAddr>,
    /// Raft control port shared by every replica of this partition.
    pub port: u16,
}

/// A committed entry of a partition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: LogIndex,
    pub producer_id: String,
    pub message: String,
    /// Milliseconds since the Unix epoch, stamped by the broker that accepted the write.
    pub timestamp_ms: i64,
}

/// Host portion of a broker address (`"b1:5000"` → `"b1"`).
pub fn broker_host(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Raft address of a replica hosted on `broker` listening on `port`.
pub fn replica_addr(broker: &str, port: u16) -> String {
    format!("{}:{}", broker_host(broker), port)
}

/// Base URL of a broker's HTTP API. Bare hosts get the default port 5000.
pub fn broker_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else if addr.contains(':') {
        format!("http://{}", addr)
    } else {
        format!("http://{}:5000", addr)
    }
}

/// Current wall clock time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
