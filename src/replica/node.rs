//! A running partition replica: Raft node, RPC listener and local log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use object_store::ObjectStore;
use openraft::error::{ClientWriteError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{LogCommand, LogResponse};
use super::config::ReplicaConfig;
use super::network::{ReplicaNetworkFactory, ReplicaRpcServer, forward_client_write};
use super::state_machine::PartitionLog;
use super::storage::ReplicaStore;
use super::types::{ReplicaNodeId, TypeConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{LogIndex, LogRecord};

pub struct PartitionReplica {
    raft: Arc<Raft<TypeConfig>>,
    log: Arc<RwLock<PartitionLog>>,
    network: ReplicaNetworkFactory,
    node_id: ReplicaNodeId,
    config: ReplicaConfig,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    proposal_semaphore: Arc<Semaphore>,
}

impl PartitionReplica {
    /// Restore persisted state, start the Raft core and its RPC listener, and
    /// initialize the membership.
    pub async fn start(config: ReplicaConfig, object_store: Arc<dyn ObjectStore>) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(Error::Config(format!(
                "Invalid replica config: {}",
                errors.join(", ")
            )));
        }

        let store = ReplicaStore::open(object_store, &config.storage_prefix).await?;
        let log = store.state_machine();

        let network = ReplicaNetworkFactory::new();
        for (node_id, addr) in &config.members {
            network.add_node(*node_id, addr.clone()).await;
        }

        let (log_store, sm_store) = Adaptor::new(store);
        let raft = Raft::new(
            config.node_id,
            Arc::new(config.to_openraft_config()),
            network.clone(),
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| Error::Raft(format!("Failed to create Raft node: {}", e)))?;
        let raft = Arc::new(raft);

        let rpc_server = match ReplicaRpcServer::bind(raft.clone(), &config.listen_addr).await {
            Ok(server) => server,
            Err(e) => {
                let _ = raft.shutdown().await;
                return Err(e);
            }
        };

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = rpc_server.run() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Replica RPC server error");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Replica RPC server shutting down");
                }
            }
        });

        let replica = Self {
            raft,
            log,
            network,
            node_id: config.node_id,
            proposal_semaphore: Arc::new(Semaphore::new(config.max_pending_proposals)),
            config,
            shutdown_tx,
        };
        replica.initialize().await?;

        info!(
            node_id = replica.node_id,
            listen_addr = %replica.config.listen_addr,
            members = replica.config.members.len(),
            prefix = %replica.config.storage_prefix,
            "Partition replica started"
        );
        Ok(replica)
    }

    /// Install the full membership. Every replica calls this with the same
    /// set; a node that already has a membership (restart, or a peer got
    /// there first) keeps it.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let members: BTreeMap<ReplicaNodeId, BasicNode> = self
            .config
            .members
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(e)) => {
                debug!(node_id = self.node_id, reason = %e, "Replica already initialized");
                Ok(())
            }
            Err(e) => Err(Error::Raft(format!("Failed to initialize replica: {}", e))),
        }
    }

    fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    /// Replicate `command` and return the state machine's response once it is
    /// committed and applied.
    ///
    /// Waits at most `proposal_timeout` for a proposal slot and again for the
    /// commit. Followers forward to the leader they know about.
    pub async fn propose(&self, command: LogCommand) -> Result<LogResponse> {
        let _permit = match timeout(
            self.config.proposal_timeout,
            self.proposal_semaphore.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Raft("Proposal semaphore closed".to_string())),
            Err(_) => {
                metrics::record_proposal("backpressure", 0.0);
                return Err(Error::ClusterNotAvailable(format!(
                    "too many pending proposals (max {})",
                    self.config.max_pending_proposals
                )));
            }
        };

        let start = Instant::now();
        let result = match timeout(self.config.proposal_timeout, self.propose_inner(command)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ClusterNotAvailable(format!(
                "proposal not committed within {:?}",
                self.config.proposal_timeout
            ))),
        };
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_proposal(status, start.elapsed().as_secs_f64());
        result
    }

    async fn propose_inner(&self, command: LogCommand) -> Result<LogResponse> {
        match self.raft.client_write(command.clone()).await {
            Ok(response) => Ok(response.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                let Some(leader_id) = forward.leader_id else {
                    return Err(Error::ClusterNotAvailable(
                        "no leader elected for partition".to_string(),
                    ));
                };
                let leader_addr = match forward.leader_node {
                    Some(node) => node.addr,
                    None => self.network.get_node_addr(leader_id).await.ok_or_else(|| {
                        Error::ClusterNotAvailable(format!("unknown leader node {}", leader_id))
                    })?,
                };
                let current_term = self.raft.metrics().borrow().current_term;
                debug!(
                    node_id = self.node_id,
                    leader_id,
                    leader_addr = %leader_addr,
                    current_term,
                    "Forwarding proposal to leader"
                );
                forward_client_write(&leader_addr, command, current_term, 0).await
            }
            Err(e) => {
                warn!(node_id = self.node_id, error = %e, "Proposal failed");
                Err(Error::ClusterNotAvailable(e.to_string()))
            }
        }
    }

    /// Append a record at `index`. Retrying with the same index is safe: the
    /// state machine reports `AlreadyPresent` and keeps the first record.
    pub async fn append_log(
        &self,
        index: LogIndex,
        producer_id: &str,
        message: &str,
        timestamp_ms: i64,
    ) -> Result<LogResponse> {
        self.propose(LogCommand::append(index, producer_id, message, timestamp_ms))
            .await
    }

    /// Read a committed record from the local copy of the log.
    pub async fn read_log(&self, index: LogIndex) -> Result<LogRecord> {
        self.log
            .read()
            .await
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Log index {}", index)))
    }

    /// Number of records applied locally.
    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.read().await.is_empty()
    }

    pub fn current_leader(&self) -> Option<ReplicaNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    pub fn node_id(&self) -> ReplicaNodeId {
        self.node_id
    }

    pub fn available_proposal_slots(&self) -> usize {
        self.proposal_semaphore.available_permits()
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Raft(format!("Failed to shutdown replica: {}", e)))?;
        info!(
            node_id = self.node_id,
            prefix = %self.config.storage_prefix,
            "Partition replica shut down"
        );
        Ok(())
    }
}
