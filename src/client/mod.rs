//! Outbound RPC clients used by the managers.
//!
//! - [`BrokerClient`]: manager → broker calls (ping, partition create,
//!   produce, consume, pending replay).
//! - [`ReplicaSync`]: primary → read-only manager cache pushes.
//!
//! Both are traits so the managers can be driven by the in-crate test doubles
//! in [`mock`] instead of real HTTP endpoints.

mod broker;
pub mod mock;
mod sync;

pub use broker::HttpBrokerClient;
pub use sync::HttpReplicaSync;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::{
    BrokerConsumeRequest, BrokerConsumeResponse, BrokerProduceRequest, CreatePartitionRequest,
    SyncBrokerRequest, SyncConsumerRequest, SyncTopicRequest,
};
use crate::error::{Error, Result};
use crate::types::LogIndex;

/// A management request held for a broker that could not take it yet.
///
/// Persisted in the pending queue and delivered in FIFO order once the
/// broker becomes reachable again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingRequest {
    CreatePartition(CreatePartitionRequest),
}

impl PendingRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PendingRequest::CreatePartition(_) => "create_partition",
        }
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Liveness check (`GET /`).
    async fn ping(&self, broker: &str) -> Result<()>;

    async fn create_partition(&self, broker: &str, request: &CreatePartitionRequest)
    -> Result<()>;

    /// Append a record at the request's log index; returns that index.
    async fn produce(&self, broker: &str, request: &BrokerProduceRequest) -> Result<LogIndex>;

    async fn consume(
        &self,
        broker: &str,
        request: &BrokerConsumeRequest,
    ) -> Result<BrokerConsumeResponse>;

    /// Replay one queued request.
    async fn deliver(&self, broker: &str, request: &PendingRequest) -> Result<()> {
        match request {
            PendingRequest::CreatePartition(create) => self.create_partition(broker, create).await,
        }
    }
}

/// Membership change pushed to read-only managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerChange {
    Add,
    Remove,
    Activate,
    Deactivate,
}

impl BrokerChange {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerChange::Add => "add",
            BrokerChange::Remove => "remove",
            BrokerChange::Activate => "activate",
            BrokerChange::Deactivate => "deactivate",
        }
    }
}

impl std::str::FromStr for BrokerChange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(BrokerChange::Add),
            "remove" => Ok(BrokerChange::Remove),
            "activate" => Ok(BrokerChange::Activate),
            "deactivate" => Ok(BrokerChange::Deactivate),
            other => Err(Error::InvalidRequest(format!(
                "Unknown broker change '{}'.",
                other
            ))),
        }
    }
}

/// One cache update for the read-only managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Topic(SyncTopicRequest),
    Consumer(SyncConsumerRequest),
    Broker(BrokerChange, SyncBrokerRequest),
}

impl SyncMessage {
    pub fn broker(change: BrokerChange, broker_host: &str) -> Self {
        SyncMessage::Broker(
            change,
            SyncBrokerRequest {
                broker_host: broker_host.to_string(),
            },
        )
    }

    /// Path of the read-only endpoint that accepts this update.
    pub fn route(&self) -> String {
        match self {
            SyncMessage::Topic(_) => "/sync/topics".to_string(),
            SyncMessage::Consumer(_) => "/sync/consumer/register".to_string(),
            SyncMessage::Broker(change, _) => format!("/sync/broker/{}", change.as_str()),
        }
    }

    pub fn body(&self) -> Result<serde_json::Value> {
        let value = match self {
            SyncMessage::Topic(request) => serde_json::to_value(request)?,
            SyncMessage::Consumer(request) => serde_json::to_value(request)?,
            SyncMessage::Broker(_, request) => serde_json::to_value(request)?,
        };
        Ok(value)
    }
}

/// Result of one broadcast across every read-only manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub delivered: usize,
    pub failed: usize,
}

impl SyncOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[async_trait]
pub trait ReplicaSync: Send + Sync {
    /// Push `message` to every read-only manager. Per-target failures are
    /// logged and counted, never returned as errors.
    async fn broadcast(&self, message: SyncMessage) -> SyncOutcome;
}
