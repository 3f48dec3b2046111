//! Wire form of [`MetadataStore`] calls.
//!
//! Read-only managers do not own metadata; they send one [`MetadataCommand`]
//! per store call to the primary, which runs it through [`dispatch`] against
//! its authoritative store and replies with a `Result<MetadataResponse, Error>`.

use serde::{Deserialize, Serialize};

use super::MetadataStore;
use crate::error::Result;
use crate::types::{
    BrokerAddr, BrokerInfo, BrokerStatus, HealthUpdate, LogIndex, PartitionAssignment,
    PartitionIndex,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataCommand {
    RegisterBroker {
        addr: String,
    },
    RemoveBroker {
        addr: String,
    },
    ListBrokers,
    Broker {
        addr: String,
    },
    SetBrokerHealth {
        addr: String,
        update: HealthUpdate,
    },
    SetBrokerStatus {
        addr: String,
        status: BrokerStatus,
    },
    IsBrokerActive {
        addr: String,
    },
    LeastLoadedBrokers {
        n: usize,
    },
    IncrementBrokerLoad {
        addrs: Vec<BrokerAddr>,
    },
    CreateTopic {
        name: String,
        partition_count: u32,
    },
    TopicExists {
        name: String,
    },
    ListTopics,
    PartitionCount {
        name: String,
    },
    AssignPartitionBrokers {
        topic: String,
        partition: PartitionIndex,
        replicas: Vec<BrokerAddr>,
        port: u16,
    },
    PartitionAssignment {
        topic: String,
        partition: PartitionIndex,
    },
    NextReplicaPort,
    RegisterProducer {
        producer_id: String,
        topic: String,
    },
    RegisterConsumer {
        consumer_id: String,
        topic: String,
    },
    CheckProducerRegistered {
        producer_id: String,
        topic: String,
    },
    CheckConsumerRegistered {
        consumer_id: String,
        topic: String,
    },
    ListConsumers {
        topic: String,
    },
    NextPartitionForProducer {
        producer_id: String,
    },
    AllocateLogIndex {
        topic: String,
        partition: PartitionIndex,
    },
    CommitPartitionSize {
        topic: String,
        partition: PartitionIndex,
    },
    PartitionSize {
        topic: String,
        partition: PartitionIndex,
    },
    ConsumerOffset {
        consumer_id: String,
        topic: String,
        partition: PartitionIndex,
    },
    PeekConsumerOffset {
        consumer_id: String,
        topic: String,
        partition: PartitionIndex,
    },
}

impl MetadataCommand {
    /// Short operation name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            MetadataCommand::RegisterBroker { .. } => "register_broker",
            MetadataCommand::RemoveBroker { .. } => "remove_broker",
            MetadataCommand::ListBrokers => "list_brokers",
            MetadataCommand::Broker { .. } => "broker",
            MetadataCommand::SetBrokerHealth { .. } => "set_broker_health",
            MetadataCommand::SetBrokerStatus { .. } => "set_broker_status",
            MetadataCommand::IsBrokerActive { .. } => "is_broker_active",
            MetadataCommand::LeastLoadedBrokers { .. } => "least_loaded_brokers",
            MetadataCommand::IncrementBrokerLoad { .. } => "increment_broker_load",
            MetadataCommand::CreateTopic { .. } => "create_topic",
            MetadataCommand::TopicExists { .. } => "topic_exists",
            MetadataCommand::ListTopics => "list_topics",
            MetadataCommand::PartitionCount { .. } => "partition_count",
            MetadataCommand::AssignPartitionBrokers { .. } => "assign_partition_brokers",
            MetadataCommand::PartitionAssignment { .. } => "partition_assignment",
            MetadataCommand::NextReplicaPort => "next_replica_port",
            MetadataCommand::RegisterProducer { .. } => "register_producer",
            MetadataCommand::RegisterConsumer { .. } => "register_consumer",
            MetadataCommand::CheckProducerRegistered { .. } => "check_producer_registered",
            MetadataCommand::CheckConsumerRegistered { .. } => "check_consumer_registered",
            MetadataCommand::ListConsumers { .. } => "list_consumers",
            MetadataCommand::NextPartitionForProducer { .. } => "next_partition_for_producer",
            MetadataCommand::AllocateLogIndex { .. } => "allocate_log_index",
            MetadataCommand::CommitPartitionSize { .. } => "commit_partition_size",
            MetadataCommand::PartitionSize { .. } => "partition_size",
            MetadataCommand::ConsumerOffset { .. } => "consumer_offset",
            MetadataCommand::PeekConsumerOffset { .. } => "peek_consumer_offset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetadataResponse {
    Unit,
    Bool(bool),
    Health(i32),
    Count(u32),
    Port(u16),
    Index(LogIndex),
    MaybeIndex(Option<LogIndex>),
    Names(Vec<String>),
    Brokers(Vec<BrokerInfo>),
    Broker(BrokerInfo),
    Status(BrokerStatus),
    Assignment(PartitionAssignment),
}

/// Run `command` against `store`.
pub async fn dispatch(
    store: &dyn MetadataStore,
    command: MetadataCommand,
) -> Result<MetadataResponse> {
    use MetadataCommand as C;
    use MetadataResponse as R;

    Ok(match command {
        C::RegisterBroker { addr } => {
            store.register_broker(&addr).await?;
            R::Unit
        }
        C::RemoveBroker { addr } => {
            store.remove_broker(&addr).await?;
            R::Unit
        }
        C::ListBrokers => R::Brokers(store.list_brokers().await?),
        C::Broker { addr } => R::Broker(store.broker(&addr).await?),
        C::SetBrokerHealth { addr, update } => {
            R::Health(store.set_broker_health(&addr, update).await?)
        }
        C::SetBrokerStatus { addr, status } => {
            R::Status(store.set_broker_status(&addr, status).await?)
        }
        C::IsBrokerActive { addr } => R::Bool(store.is_broker_active(&addr).await?),
        C::LeastLoadedBrokers { n } => R::Names(store.least_loaded_brokers(n).await?),
        C::IncrementBrokerLoad { addrs } => {
            store.increment_broker_load(&addrs).await?;
            R::Unit
        }
        C::CreateTopic {
            name,
            partition_count,
        } => {
            store.create_topic(&name, partition_count).await?;
            R::Unit
        }
        C::TopicExists { name } => R::Bool(store.topic_exists(&name).await?),
        C::ListTopics => R::Names(store.list_topics().await?),
        C::PartitionCount { name } => R::Count(store.partition_count(&name).await?),
        C::AssignPartitionBrokers {
            topic,
            partition,
            replicas,
            port,
        } => {
            store
                .assign_partition_brokers(&topic, partition, replicas, port)
                .await?;
            R::Unit
        }
        C::PartitionAssignment { topic, partition } => {
            R::Assignment(store.partition_assignment(&topic, partition).await?)
        }
        C::NextReplicaPort => R::Port(store.next_replica_port().await?),
        C::RegisterProducer { producer_id, topic } => {
            store.register_producer(&producer_id, &topic).await?;
            R::Unit
        }
        C::RegisterConsumer { consumer_id, topic } => {
            store.register_consumer(&consumer_id, &topic).await?;
            R::Unit
        }
        C::CheckProducerRegistered { producer_id, topic } => {
            R::Bool(store.check_producer_registered(&producer_id, &topic).await?)
        }
        C::CheckConsumerRegistered { consumer_id, topic } => {
            R::Bool(store.check_consumer_registered(&consumer_id, &topic).await?)
        }
        C::ListConsumers { topic } => R::Names(store.list_consumers(&topic).await?),
        C::NextPartitionForProducer { producer_id } => {
            R::Count(store.next_partition_for_producer(&producer_id).await?)
        }
        C::AllocateLogIndex { topic, partition } => {
            R::Index(store.allocate_log_index(&topic, partition).await?)
        }
        C::CommitPartitionSize { topic, partition } => {
            R::Index(store.commit_partition_size(&topic, partition).await?)
        }
        C::PartitionSize { topic, partition } => {
            R::Index(store.partition_size(&topic, partition).await?)
        }
        C::ConsumerOffset {
            consumer_id,
            topic,
            partition,
        } => R::MaybeIndex(
            store
                .consumer_offset(&consumer_id, &topic, partition)
                .await?,
        ),
        C::PeekConsumerOffset {
            consumer_id,
            topic,
            partition,
        } => R::Index(
            store
                .peek_consumer_offset(&consumer_id, &topic, partition)
                .await?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::metadata::InMemoryMetadataStore;

    #[tokio::test]
    async fn test_dispatch_runs_against_store() {
        let store = InMemoryMetadataStore::new();
        let created = dispatch(
            &store,
            MetadataCommand::CreateTopic {
                name: "t".into(),
                partition_count: 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(created, MetadataResponse::Unit);

        let count = dispatch(&store, MetadataCommand::PartitionCount { name: "t".into() })
            .await
            .unwrap();
        assert_eq!(count, MetadataResponse::Count(3));
    }

    #[tokio::test]
    async fn test_dispatch_passes_errors_through() {
        let store = InMemoryMetadataStore::new();
        let err = dispatch(
            &store,
            MetadataCommand::PartitionSize {
                topic: "missing".into(),
                partition: 0,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, Error::TopicNotFound);
    }

    #[test]
    fn test_command_wire_format() {
        let command = MetadataCommand::ConsumerOffset {
            consumer_id: "c".into(),
            topic: "t".into(),
            partition: 1,
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["op"], "consumer_offset");
        assert_eq!(json["partition"], 1);
        assert_eq!(command.name(), "consumer_offset");

        let response = MetadataResponse::MaybeIndex(None);
        let json = serde_json::to_string(&response).unwrap();
        let back: MetadataResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
