use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{MetadataCommand, MetadataResponse, MetadataStore};
use crate::error::{Error, Result};
use crate::types::{
    BrokerAddr, BrokerInfo, BrokerStatus, HealthUpdate, LogIndex, PartitionAssignment,
    PartitionIndex,
};

/// Metadata store that forwards every call to the primary manager.
///
/// Atomic counters (log index allocation, consumer offsets) therefore stay
/// linearizable across managers: only the primary ever mutates them.
pub struct RemoteMetadataStore {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteMetadataStore {
    pub fn new(primary_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/metadata", primary_url.trim_end_matches('/')),
        })
    }

    async fn call(&self, command: MetadataCommand) -> Result<MetadataResponse> {
        let op = command.name();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&command)
            .send()
            .await
            .map_err(|e| {
                warn!(op, error = %e, "Metadata call to primary failed");
                Error::from(e)
            })?;

        if !response.status().is_success() {
            return Err(Error::Rpc(format!(
                "primary answered {} for {}",
                response.status(),
                op
            )));
        }

        let result: std::result::Result<MetadataResponse, Error> = response.json().await?;
        debug!(op, ok = result.is_ok(), "Metadata call completed");
        result
    }
}

fn unexpected(op: &str, response: MetadataResponse) -> Error {
    Error::Storage(format!("unexpected response to {}: {:?}", op, response))
}

macro_rules! expect_response {
    ($self:ident, $command:expr, $variant:ident) => {{
        let command = $command;
        let op = command.name();
        match $self.call(command).await? {
            MetadataResponse::$variant(value) => Ok(value),
            other => Err(unexpected(op, other)),
        }
    }};
    ($self:ident, $command:expr) => {{
        let command = $command;
        let op = command.name();
        match $self.call(command).await? {
            MetadataResponse::Unit => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }};
}

#[async_trait]
impl MetadataStore for RemoteMetadataStore {
    async fn register_broker(&self, addr: &str) -> Result<()> {
        expect_response!(self, MetadataCommand::RegisterBroker { addr: addr.into() })
    }

    async fn remove_broker(&self, addr: &str) -> Result<()> {
        expect_response!(self, MetadataCommand::RemoveBroker { addr: addr.into() })
    }

    async fn list_brokers(&self) -> Result<Vec<BrokerInfo>> {
        expect_response!(self, MetadataCommand::ListBrokers, Brokers)
    }

    async fn broker(&self, addr: &str) -> Result<BrokerInfo> {
        expect_response!(self, MetadataCommand::Broker { addr: addr.into() }, Broker)
    }

    async fn set_broker_health(&self, addr: &str, update: HealthUpdate) -> Result<i32> {
        expect_response!(
            self,
            MetadataCommand::SetBrokerHealth {
                addr: addr.into(),
                update
            },
            Health
        )
    }

    async fn set_broker_status(&self, addr: &str, status: BrokerStatus) -> Result<BrokerStatus> {
        expect_response!(
            self,
            MetadataCommand::SetBrokerStatus {
                addr: addr.into(),
                status
            },
            Status
        )
    }

    async fn is_broker_active(&self, addr: &str) -> Result<bool> {
        expect_response!(self, MetadataCommand::IsBrokerActive { addr: addr.into() }, Bool)
    }

    async fn least_loaded_brokers(&self, n: usize) -> Result<Vec<BrokerAddr>> {
        expect_response!(self, MetadataCommand::LeastLoadedBrokers { n }, Names)
    }

    async fn increment_broker_load(&self, addrs: &[BrokerAddr]) -> Result<()> {
        expect_response!(
            self,
            MetadataCommand::IncrementBrokerLoad {
                addrs: addrs.to_vec()
            }
        )
    }

    async fn create_topic(&self, name: &str, partition_count: u32) -> Result<()> {
        expect_response!(
            self,
            MetadataCommand::CreateTopic {
                name: name.into(),
                partition_count
            }
        )
    }

    async fn topic_exists(&self, name: &str) -> Result<bool> {
        expect_response!(self, MetadataCommand::TopicExists { name: name.into() }, Bool)
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        expect_response!(self, MetadataCommand::ListTopics, Names)
    }

    async fn partition_count(&self, name: &str) -> Result<u32> {
        expect_response!(self, MetadataCommand::PartitionCount { name: name.into() }, Count)
    }

    async fn assign_partition_brokers(
        &self,
        topic: &str,
        partition: PartitionIndex,
        replicas: Vec<BrokerAddr>,
        port: u16,
    ) -> Result<()> {
        expect_response!(
            self,
            MetadataCommand::AssignPartitionBrokers {
                topic: topic.into(),
                partition,
                replicas,
                port
            }
        )
    }

    async fn partition_assignment(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<PartitionAssignment> {
        expect_response!(
            self,
            MetadataCommand::PartitionAssignment {
                topic: topic.into(),
                partition
            },
            Assignment
        )
    }

    async fn next_replica_port(&self) -> Result<u16> {
        expect_response!(self, MetadataCommand::NextReplicaPort, Port)
    }

    async fn register_producer(&self, producer_id: &str, topic: &str) -> Result<()> {
        expect_response!(
            self,
            MetadataCommand::RegisterProducer {
                producer_id: producer_id.into(),
                topic: topic.into()
            }
        )
    }

    async fn register_consumer(&self, consumer_id: &str, topic: &str) -> Result<()> {
        expect_response!(
            self,
            MetadataCommand::RegisterConsumer {
                consumer_id: consumer_id.into(),
                topic: topic.into()
            }
        )
    }

    async fn check_producer_registered(&self, producer_id: &str, topic: &str) -> Result<bool> {
        expect_response!(
            self,
            MetadataCommand::CheckProducerRegistered {
                producer_id: producer_id.into(),
                topic: topic.into()
            },
            Bool
        )
    }

    async fn check_consumer_registered(&self, consumer_id: &str, topic: &str) -> Result<bool> {
        expect_response!(
            self,
            MetadataCommand::CheckConsumerRegistered {
                consumer_id: consumer_id.into(),
                topic: topic.into()
            },
            Bool
        )
    }

    async fn list_consumers(&self, topic: &str) -> Result<Vec<String>> {
        expect_response!(
            self,
            MetadataCommand::ListConsumers {
                topic: topic.into()
            },
            Names
        )
    }

    async fn next_partition_for_producer(&self, producer_id: &str) -> Result<PartitionIndex> {
        expect_response!(
            self,
            MetadataCommand::NextPartitionForProducer {
                producer_id: producer_id.into()
            },
            Count
        )
    }

    async fn allocate_log_index(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<LogIndex> {
        expect_response!(
            self,
            MetadataCommand::AllocateLogIndex {
                topic: topic.into(),
                partition
            },
            Index
        )
    }

    async fn commit_partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64> {
        expect_response!(
            self,
            MetadataCommand::CommitPartitionSize {
                topic: topic.into(),
                partition
            },
            Index
        )
    }

    async fn partition_size(&self, topic: &str, partition: PartitionIndex) -> Result<u64> {
        expect_response!(
            self,
            MetadataCommand::PartitionSize {
                topic: topic.into(),
                partition
            },
            Index
        )
    }

    async fn consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<Option<LogIndex>> {
        expect_response!(
            self,
            MetadataCommand::ConsumerOffset {
                consumer_id: consumer_id.into(),
                topic: topic.into(),
                partition
            },
            MaybeIndex
        )
    }

    async fn peek_consumer_offset(
        &self,
        consumer_id: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<LogIndex> {
        expect_response!(
            self,
            MetadataCommand::PeekConsumerOffset {
                consumer_id: consumer_id.into(),
                topic: topic.into(),
                partition
            },
            Index
        )
    }
}
