//! Broker node: hosts partition replicas and serves the internal data plane.
//!
//! Each hosted (topic, partition) is a [`PartitionReplica`] with its own Raft
//! listener on the partition's control port. Partition manifests are kept in
//! the object store so a restarted broker brings its replicas back before it
//! starts answering pings.

mod http;

pub use http::router;

use std::sync::Arc;

use backon::Retryable;
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::api::{CreatePartitionRequest, PartitionSize};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::replica::{LogResponse, PartitionReplica, ReplicaConfig, ReplicaNodeId};
use crate::retry::fast_policy;
use crate::store::put_atomic;
use crate::types::{LogIndex, LogRecord, PartitionIndex, PartitionKey, broker_host, now_ms, replica_addr};

const MANIFEST_PREFIX: &str = "broker/partitions";

type ReplicaSlot = Arc<OnceCell<Arc<PartitionReplica>>>;

pub struct BrokerNode {
    config: BrokerConfig,
    object_store: Arc<dyn ObjectStore>,
    replicas: DashMap<PartitionKey, ReplicaSlot>,
}

impl BrokerNode {
    pub fn new(config: BrokerConfig, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            object_store,
            replicas: DashMap::new(),
        }
    }

    pub fn advertised_addr(&self) -> &str {
        &self.config.advertised_addr
    }

    /// Restart every replica whose manifest was persisted by an earlier run.
    ///
    /// Returns how many replicas were brought back. A manifest that fails to
    /// start is logged and skipped so one bad partition does not keep the
    /// broker down.
    pub async fn recover(&self) -> Result<usize> {
        let prefix = ObjectPath::from(MANIFEST_PREFIX);
        let manifests: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;

        let mut recovered = 0;
        for meta in manifests {
            if meta.location.as_ref().contains(".temp-") {
                continue;
            }
            let bytes = self.object_store.get(&meta.location).await?.bytes().await?;
            let request: CreatePartitionRequest = match serde_json::from_slice(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!(path = %meta.location, error = %e, "Skipping unreadable partition manifest");
                    continue;
                }
            };
            match self.create_partition(&request).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!(
                    topic = %request.name,
                    partition = request.partition_index,
                    error = %e,
                    "Failed to recover partition replica"
                ),
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered partition replicas");
        }
        Ok(recovered)
    }

    /// Start the replica for one partition. Creating a partition that is
    /// already hosted succeeds without side effects.
    pub async fn create_partition(&self, request: &CreatePartitionRequest) -> Result<()> {
        let key = PartitionKey::new(&request.name, request.partition_index);
        let slot = self
            .replicas
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut started = false;
        let started_flag = &mut started;
        let key_ref = &key;
        slot.get_or_try_init(|| async move {
            let replica = self.start_replica(key_ref, request).await?;
            *started_flag = true;
            Ok::<_, Error>(Arc::new(replica))
        })
        .await?;

        if started {
            self.persist_manifest(&key, request).await?;
            metrics::HOSTED_REPLICAS.set(self.hosted_partitions().len() as i64);
            info!(
                topic = %key.topic,
                partition = key.partition,
                port = request.port,
                replicas = request.replicas.len(),
                "Partition replica created"
            );
        }
        Ok(())
    }

    async fn start_replica(
        &self,
        key: &PartitionKey,
        request: &CreatePartitionRequest,
    ) -> Result<PartitionReplica> {
        let node_id = self.position_in(&request.replicas).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "Broker {} is not in the replica set of {}",
                self.config.advertised_addr, key
            ))
        })?;

        let members = request
            .replicas
            .iter()
            .enumerate()
            .map(|(i, broker)| (i as ReplicaNodeId, replica_addr(broker, request.port)))
            .collect();

        let config = ReplicaConfig {
            node_id,
            listen_addr: format!("{}:{}", self.config.raft_bind_host, request.port),
            members,
            storage_prefix: format!("replicas/{}", key),
            ..self.config.replica.clone()
        };
        PartitionReplica::start(config, self.object_store.clone()).await
    }

    /// Raft node id of this broker: its position in `replicas`, matched on
    /// the full address first and on the host alone second.
    fn position_in(&self, replicas: &[String]) -> Option<ReplicaNodeId> {
        let own = self.config.advertised_addr.as_str();
        replicas
            .iter()
            .position(|r| r == own)
            .or_else(|| {
                replicas
                    .iter()
                    .position(|r| broker_host(r) == broker_host(own))
            })
            .map(|i| i as ReplicaNodeId)
    }

    async fn persist_manifest(
        &self,
        key: &PartitionKey,
        request: &CreatePartitionRequest,
    ) -> Result<()> {
        let path = ObjectPath::from(format!("{}/{}", MANIFEST_PREFIX, key));
        put_atomic(self.object_store.as_ref(), &path, serde_json::to_vec(request)?).await
    }

    fn replica(&self, topic: &str, partition: PartitionIndex) -> Result<Arc<PartitionReplica>> {
        self.replicas
            .get(&PartitionKey::new(topic, partition))
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| Error::NotFound(format!("Partition {} of topic {}", partition, topic)))
    }

    /// Replicate a record at `log_index`. A retry of an index that already
    /// committed returns the same index; a different record at that index
    /// fails with [`Error::LogIndexTaken`].
    pub async fn append(
        &self,
        topic: &str,
        partition: PartitionIndex,
        log_index: LogIndex,
        producer_id: &str,
        message: &str,
    ) -> Result<LogIndex> {
        let replica = self.replica(topic, partition)?;
        let response = replica
            .append_log(log_index, producer_id, message, now_ms())
            .await?;
        match response {
            LogResponse::Appended { index } | LogResponse::AlreadyPresent { index } => Ok(index),
            LogResponse::Conflict { index } => {
                warn!(topic, partition, index, producer_id, "Append refused, index holds another record");
                Err(Error::LogIndexTaken)
            }
            LogResponse::Ok => Ok(log_index),
        }
    }

    pub async fn read(
        &self,
        topic: &str,
        partition: PartitionIndex,
        log_index: LogIndex,
    ) -> Result<LogRecord> {
        let replica = self.replica(topic, partition)?;
        // A follower can trail the leader's commit by a few applies.
        (|| async { replica.read_log(log_index).await })
            .retry(fast_policy())
            .when(|e: &Error| e.is_not_found())
            .await
    }

    /// Committed length of the hosted partitions of `topic`, or of one of them.
    pub async fn size(
        &self,
        topic: &str,
        partition: Option<PartitionIndex>,
    ) -> Result<Vec<PartitionSize>> {
        let partitions: Vec<PartitionIndex> = match partition {
            Some(p) => vec![p],
            None => self
                .hosted_partitions()
                .into_iter()
                .filter(|k| k.topic == topic)
                .map(|k| k.partition)
                .collect(),
        };
        if partitions.is_empty() {
            return Err(Error::TopicNotFound);
        }

        let mut sizes = Vec::with_capacity(partitions.len());
        for p in partitions {
            let replica = self.replica(topic, p)?;
            sizes.push(PartitionSize {
                partition_number: p,
                size: replica.len().await as u64,
            });
        }
        Ok(sizes)
    }

    /// Partitions with a running replica, sorted.
    pub fn hosted_partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self
            .replicas
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn leader_of(&self, topic: &str, partition: PartitionIndex) -> Result<Option<ReplicaNodeId>> {
        Ok(self.replica(topic, partition)?.current_leader())
    }

    /// Stop every hosted replica. Errors are logged; shutdown continues.
    pub async fn shutdown(&self) {
        let replicas: Vec<(PartitionKey, Arc<PartitionReplica>)> = self
            .replicas
            .iter()
            .filter_map(|entry| entry.value().get().map(|r| (entry.key().clone(), r.clone())))
            .collect();
        for (key, replica) in replicas {
            if let Err(e) = replica.shutdown().await {
                warn!(partition = %key, error = %e, "Replica shutdown failed");
            }
        }
        self.replicas.clear();
        metrics::HOSTED_REPLICAS.set(0);
    }
}
