//! In-memory test doubles for [`BrokerClient`] and [`ReplicaSync`].
//!
//! [`MockBrokerClient`] keeps a log per (broker, topic, partition) so a
//! produce followed by a consume round-trips without any network, and lets a
//! test take brokers down and bring them back.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BrokerClient, ReplicaSync, SyncMessage, SyncOutcome};
use crate::api::{
    BrokerConsumeRequest, BrokerConsumeResponse, BrokerProduceRequest, CreatePartitionRequest,
    STATUS_SUCCESS,
};
use crate::error::{Error, Result};
use crate::types::{LogIndex, LogRecord, PartitionKey, now_ms};

/// A call observed by [`MockBrokerClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Ping(String),
    CreatePartition(String, CreatePartitionRequest),
    Produce(String, BrokerProduceRequest),
    Consume(String, BrokerConsumeRequest),
}

impl BrokerCall {
    pub fn broker(&self) -> &str {
        match self {
            BrokerCall::Ping(b)
            | BrokerCall::CreatePartition(b, _)
            | BrokerCall::Produce(b, _)
            | BrokerCall::Consume(b, _) => b,
        }
    }
}

#[derive(Default)]
pub struct MockBrokerClient {
    down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<BrokerCall>>,
    partitions: DashMap<(String, PartitionKey), CreatePartitionRequest>,
    logs: DashMap<(String, PartitionKey), BTreeMap<LogIndex, LogRecord>>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call to `broker` fails with a retryable error.
    pub fn set_down(&self, broker: &str) {
        if let Ok(mut down) = self.down.lock() {
            down.insert(broker.to_string());
        }
    }

    pub fn set_up(&self, broker: &str) {
        if let Ok(mut down) = self.down.lock() {
            down.remove(broker);
        }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, broker: &str) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.broker() == broker)
            .collect()
    }

    /// Partition creates delivered to `broker`, in arrival order.
    pub fn created_partitions(&self, broker: &str) -> Vec<CreatePartitionRequest> {
        self.calls_to(broker)
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::CreatePartition(_, request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn hosts_partition(&self, broker: &str, topic: &str, partition: u32) -> bool {
        self.partitions
            .contains_key(&(broker.to_string(), PartitionKey::new(topic, partition)))
    }

    /// Records stored on `broker` for one partition.
    pub fn log(&self, broker: &str, topic: &str, partition: u32) -> Vec<LogRecord> {
        self.logs
            .get(&(broker.to_string(), PartitionKey::new(topic, partition)))
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, call: BrokerCall) -> Result<()> {
        let broker = call.broker().to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let is_down = self
            .down
            .lock()
            .map(|down| down.contains(&broker))
            .unwrap_or(false);
        if is_down {
            Err(Error::Rpc(format!("broker {} unreachable", broker)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn ping(&self, broker: &str) -> Result<()> {
        self.record(BrokerCall::Ping(broker.to_string()))
    }

    async fn create_partition(
        &self,
        broker: &str,
        request: &CreatePartitionRequest,
    ) -> Result<()> {
        self.record(BrokerCall::CreatePartition(
            broker.to_string(),
            request.clone(),
        ))?;
        self.partitions
            .entry((
                broker.to_string(),
                PartitionKey::new(&request.name, request.partition_index),
            ))
            .or_insert_with(|| request.clone());
        Ok(())
    }

    async fn produce(&self, broker: &str, request: &BrokerProduceRequest) -> Result<LogIndex> {
        self.record(BrokerCall::Produce(broker.to_string(), request.clone()))?;
        let key = PartitionKey::new(&request.topic, request.partition_index);
        if let Some(log) = self.logs.get(&(broker.to_string(), key.clone()))
            && let Some(existing) = log.get(&request.log_index)
            && (existing.producer_id != request.producer_id || existing.message != request.message)
        {
            return Err(Error::LogIndexTaken);
        }
        // Replication is modeled by writing to every broker hosting the partition.
        let hosts: Vec<String> = self
            .partitions
            .iter()
            .filter(|entry| entry.key().1 == key)
            .map(|entry| entry.key().0.clone())
            .collect();
        let hosts = if hosts.is_empty() {
            vec![broker.to_string()]
        } else {
            hosts
        };
        for host in hosts {
            self.logs
                .entry((host, key.clone()))
                .or_default()
                .entry(request.log_index)
                .or_insert_with(|| LogRecord {
                    index: request.log_index,
                    producer_id: request.producer_id.clone(),
                    message: request.message.clone(),
                    timestamp_ms: now_ms(),
                });
        }
        Ok(request.log_index)
    }

    async fn consume(
        &self,
        broker: &str,
        request: &BrokerConsumeRequest,
    ) -> Result<BrokerConsumeResponse> {
        self.record(BrokerCall::Consume(broker.to_string(), request.clone()))?;
        let key = (
            broker.to_string(),
            PartitionKey::new(&request.topic, request.partition_index),
        );
        let record = self
            .logs
            .get(&key)
            .and_then(|log| log.get(&request.log_index).cloned())
            .ok_or_else(|| Error::Rpc(format!("Log index {} not found.", request.log_index)))?;
        Ok(BrokerConsumeResponse {
            status: STATUS_SUCCESS.to_string(),
            message: record.message,
            producer_id: record.producer_id,
            partition_read: request.partition_index,
            log_index: record.index,
            timestamp_ms: record.timestamp_ms,
        })
    }
}

/// [`ReplicaSync`] that records every broadcast and reports full delivery.
#[derive(Default)]
pub struct RecordingReplicaSync {
    messages: Mutex<Vec<SyncMessage>>,
}

impl RecordingReplicaSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SyncMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn routes(&self) -> Vec<String> {
        self.messages().iter().map(SyncMessage::route).collect()
    }
}

#[async_trait]
impl ReplicaSync for RecordingReplicaSync {
    async fn broadcast(&self, message: SyncMessage) -> SyncOutcome {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
        SyncOutcome {
            delivered: 1,
            failed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(name: &str, partition: u32) -> CreatePartitionRequest {
        CreatePartitionRequest {
            name: name.to_string(),
            partition_index: partition,
            replicas: vec!["b1".into(), "b2".into()],
            port: 5011,
        }
    }

    #[tokio::test]
    async fn test_down_broker_fails_and_is_recorded() {
        let client = MockBrokerClient::new();
        client.set_down("b1");
        assert!(client.ping("b1").await.unwrap_err().is_retryable());
        assert!(client.ping("b2").await.is_ok());
        client.set_up("b1");
        assert!(client.ping("b1").await.is_ok());
        assert_eq!(client.calls_to("b1").len(), 2);
    }

    #[tokio::test]
    async fn test_produce_replicates_to_partition_hosts() {
        let client = MockBrokerClient::new();
        client.create_partition("b1", &create("t", 0)).await.unwrap();
        client.create_partition("b2", &create("t", 0)).await.unwrap();

        let request = BrokerProduceRequest {
            topic: "t".into(),
            producer_id: "p".into(),
            message: "m0".into(),
            partition_index: 0,
            log_index: 0,
        };
        assert_eq!(client.produce("b1", &request).await.unwrap(), 0);

        let read = BrokerConsumeRequest {
            topic: "t".into(),
            partition_index: 0,
            log_index: 0,
        };
        assert_eq!(client.consume("b2", &read).await.unwrap().message, "m0");
        assert_eq!(client.log("b1", "t", 0).len(), 1);
        assert!(client.hosts_partition("b2", "t", 0));
    }
}
