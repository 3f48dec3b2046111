//! Network transport between the replicas of one partition.
//!
//! Every replica listens on the partition's control port. Messages are
//! bincode-encoded and framed with a big-endian `u32` length prefix; a
//! connection carries any number of request/response pairs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{LogCommand, LogResponse};
use super::types::{ReplicaNodeId, TypeConfig};
use crate::error::{Error, Result};

const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

const RPC_MAX_RETRIES: u32 = 2;

const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

const RPC_RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

/// Largest frame accepted from a peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Maximum number of hops for forwarded writes.
pub const MAX_FORWARD_HOPS: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicaRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<ReplicaNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// A write forwarded from a follower to the leader it believes in.
    ClientWrite {
        command: LogCommand,
        /// Term the sender observed; a leader with a newer term rejects it.
        expected_term: u64,
        forward_hops: u8,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorKind {
    LeadershipChanged,
    NotLeader { leader_hint: Option<ReplicaNodeId> },
    ForwardLoopDetected,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcErrorInfo {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(RpcErrorKind::Internal, e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ReplicaRpcResponse {
    AppendEntries(AppendEntriesResponse<ReplicaNodeId>),
    Vote(VoteResponse<ReplicaNodeId>),
    InstallSnapshot(InstallSnapshotResponse<ReplicaNodeId>),
    ClientWriteOk(LogResponse),
    Error(RpcErrorInfo),
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    let stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Connection timeout to {}", addr),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn round_trip(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<ReplicaRpcResponse> {
    timeout(RPC_OPERATION_TIMEOUT, async {
        write_frame(stream, data).await?;
        let buf = read_frame(stream).await?;
        bincode::deserialize(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "RPC operation timeout"))?
}

/// Forward a write to the replica at `addr`, which should be the leader.
///
/// The receiver refuses the write if its term moved past `expected_term` or
/// if it is not the leader, instead of forwarding again.
pub async fn forward_client_write(
    addr: &str,
    command: LogCommand,
    expected_term: u64,
    forward_hops: u8,
) -> Result<LogResponse> {
    if forward_hops >= MAX_FORWARD_HOPS {
        return Err(Error::ClusterNotAvailable(format!(
            "forward loop detected after {} hops",
            forward_hops
        )));
    }

    let message = ReplicaRpcMessage::ClientWrite {
        command,
        expected_term,
        forward_hops: forward_hops + 1,
    };
    let data = bincode::serialize(&message)?;
    let mut stream = connect(addr)
        .await
        .map_err(|e| Error::ClusterNotAvailable(format!("leader at {} unreachable: {}", addr, e)))?;
    let response = round_trip(&mut stream, &data)
        .await
        .map_err(|e| Error::ClusterNotAvailable(format!("forward to {} failed: {}", addr, e)))?;

    match response {
        ReplicaRpcResponse::ClientWriteOk(resp) => Ok(resp),
        ReplicaRpcResponse::Error(info) => match info.kind {
            RpcErrorKind::Internal => Err(Error::Raft(info.message)),
            _ => Err(Error::ClusterNotAvailable(info.message)),
        },
        _ => Err(Error::Rpc("unexpected response to forwarded write".into())),
    }
}

/// Creates connections to the other replicas of a partition.
#[derive(Clone, Default)]
pub struct ReplicaNetworkFactory {
    nodes: Arc<RwLock<BTreeMap<ReplicaNodeId, String>>>,
}

impl ReplicaNetworkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, node_id: ReplicaNodeId, addr: String) {
        self.nodes.write().await.insert(node_id, addr);
    }

    pub async fn get_node_addr(&self, node_id: ReplicaNodeId) -> Option<String> {
        self.nodes.read().await.get(&node_id).cloned()
    }
}

impl RaftNetworkFactory<TypeConfig> for ReplicaNetworkFactory {
    type Network = ReplicaConnection;

    async fn new_client(&mut self, target: ReplicaNodeId, node: &BasicNode) -> Self::Network {
        self.nodes.write().await.insert(target, node.addr.clone());
        ReplicaConnection {
            target_addr: node.addr.clone(),
            cached_conn: tokio::sync::Mutex::new(None),
        }
    }
}

/// A connection to one peer replica.
pub struct ReplicaConnection {
    target_addr: String,
    cached_conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl ReplicaConnection {
    async fn send_rpc(&self, message: ReplicaRpcMessage) -> std::io::Result<ReplicaRpcResponse> {
        let data = bincode::serialize(&message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut last_error = None;
        for attempt in 0..=RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = std::cmp::min(
                    RPC_RETRY_BASE_DELAY * (1 << (attempt - 1)),
                    RPC_RETRY_MAX_DELAY,
                );
                let jitter_factor = 0.75 + (fastrand::f64() * 0.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor);
                debug!(
                    target = %self.target_addr,
                    attempt,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Retrying replica RPC after backoff"
                );
                tokio::time::sleep(jittered_delay).await;
            }

            match self.try_send_rpc(&data).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| std::io::Error::other("RPC failed with no error")))
    }

    async fn try_send_rpc(&self, data: &[u8]) -> std::io::Result<ReplicaRpcResponse> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            match round_trip(stream, data).await {
                Ok(response) => return Ok(response),
                Err(_) => *guard = None,
            }
        }

        let mut stream = connect(&self.target_addr).await?;
        let response = round_trip(&mut stream, data).await?;
        *guard = Some(stream);
        Ok(response)
    }
}

fn network_error<E: std::error::Error + 'static>(e: &E) -> NetworkError {
    NetworkError::new(e)
}

fn unexpected_response() -> NetworkError {
    network_error(&std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "Unexpected response type",
    ))
}

impl RaftNetwork<TypeConfig> for ReplicaConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        AppendEntriesResponse<ReplicaNodeId>,
        RPCError<ReplicaNodeId, BasicNode, RaftError<ReplicaNodeId>>,
    > {
        let response = self
            .send_rpc(ReplicaRpcMessage::AppendEntries(req))
            .await
            .map_err(|e| RPCError::Network(network_error(&e)))?;

        match response {
            ReplicaRpcResponse::AppendEntries(resp) => Ok(resp),
            ReplicaRpcResponse::Error(info) => Err(RPCError::Network(network_error(
                &std::io::Error::other(info.message),
            ))),
            _ => Err(RPCError::Network(unexpected_response())),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<ReplicaNodeId>,
        _option: RPCOption,
    ) -> std::result::Result<
        VoteResponse<ReplicaNodeId>,
        RPCError<ReplicaNodeId, BasicNode, RaftError<ReplicaNodeId>>,
    > {
        let response = self
            .send_rpc(ReplicaRpcMessage::Vote(req))
            .await
            .map_err(|e| RPCError::Network(network_error(&e)))?;

        match response {
            ReplicaRpcResponse::Vote(resp) => Ok(resp),
            ReplicaRpcResponse::Error(info) => Err(RPCError::Network(network_error(
                &std::io::Error::other(info.message),
            ))),
            _ => Err(RPCError::Network(unexpected_response())),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<ReplicaNodeId>,
        RPCError<ReplicaNodeId, BasicNode, RaftError<ReplicaNodeId, InstallSnapshotError>>,
    > {
        let response = self
            .send_rpc(ReplicaRpcMessage::InstallSnapshot(req))
            .await
            .map_err(|e| RPCError::Network(network_error(&e)))?;

        match response {
            ReplicaRpcResponse::InstallSnapshot(resp) => Ok(resp),
            ReplicaRpcResponse::Error(info) => Err(RPCError::Network(network_error(
                &std::io::Error::other(info.message),
            ))),
            _ => Err(RPCError::Network(unexpected_response())),
        }
    }
}

/// Accepts Raft RPCs for one replica.
pub struct ReplicaRpcServer {
    raft: Arc<openraft::Raft<TypeConfig>>,
    listener: TcpListener,
}

impl ReplicaRpcServer {
    /// Bind the control port. Failing here (port taken) fails replica start.
    pub async fn bind(raft: Arc<openraft::Raft<TypeConfig>>, listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            Error::Raft(format!("failed to bind replica port {}: {}", listen_addr, e))
        })?;
        info!(addr = %listen_addr, "Replica RPC server listening");
        Ok(Self { raft, listener })
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let raft = self.raft.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(raft, stream).await {
                    debug!(peer = %peer_addr, error = %e, "Replica RPC connection closed");
                }
            });
        }
    }

    async fn handle_connection(
        raft: Arc<openraft::Raft<TypeConfig>>,
        mut stream: TcpStream,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        stream.set_nodelay(true)?;
        loop {
            let buf = match read_frame(&mut stream).await {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let message: ReplicaRpcMessage = bincode::deserialize(&buf)?;
            let response = Self::handle_message(&raft, message).await;
            let data = bincode::serialize(&response)?;
            write_frame(&mut stream, &data).await?;
        }
    }

    async fn handle_message(
        raft: &openraft::Raft<TypeConfig>,
        message: ReplicaRpcMessage,
    ) -> ReplicaRpcResponse {
        match message {
            ReplicaRpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => ReplicaRpcResponse::AppendEntries(resp),
                Err(e) => ReplicaRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            ReplicaRpcMessage::Vote(req) => match raft.vote(req).await {
                Ok(resp) => ReplicaRpcResponse::Vote(resp),
                Err(e) => ReplicaRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            ReplicaRpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => ReplicaRpcResponse::InstallSnapshot(resp),
                Err(e) => ReplicaRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            ReplicaRpcMessage::ClientWrite {
                command,
                expected_term,
                forward_hops,
            } => Self::handle_forwarded_write(raft, command, expected_term, forward_hops).await,
        }
    }

    async fn handle_forwarded_write(
        raft: &openraft::Raft<TypeConfig>,
        command: LogCommand,
        expected_term: u64,
        forward_hops: u8,
    ) -> ReplicaRpcResponse {
        if forward_hops > MAX_FORWARD_HOPS {
            return ReplicaRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::ForwardLoopDetected,
                format!(
                    "Forward loop detected: {} hops exceeds limit of {}",
                    forward_hops, MAX_FORWARD_HOPS
                ),
            ));
        }

        let (current_term, current_leader, id) = {
            let metrics = raft.metrics();
            let metrics = metrics.borrow();
            (metrics.current_term, metrics.current_leader, metrics.id)
        };

        if expected_term > 0 && current_term > expected_term {
            warn!(
                expected_term,
                current_term, forward_hops, "Rejecting forwarded write: leadership changed"
            );
            return ReplicaRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::LeadershipChanged,
                format!(
                    "Stale leader: expected term {} but current term is {}",
                    expected_term, current_term
                ),
            ));
        }

        if current_leader != Some(id) {
            return ReplicaRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::NotLeader {
                    leader_hint: current_leader,
                },
                match current_leader {
                    Some(leader) => format!("not the leader, leader is node {}", leader),
                    None => "not the leader, no leader elected".to_string(),
                },
            ));
        }

        match raft.client_write(command).await {
            Ok(resp) => ReplicaRpcResponse::ClientWriteOk(resp.data),
            Err(e) => ReplicaRpcResponse::Error(RpcErrorInfo::internal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_refuses_after_hop_limit() {
        let err = forward_client_write(
            "127.0.0.1:1",
            LogCommand::append(0, "p", "m", 0),
            1,
            MAX_FORWARD_HOPS,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ClusterNotAvailable(_)));
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_leader() {
        let err = forward_client_write("127.0.0.1:1", LogCommand::append(0, "p", "m", 0), 1, 0)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_factory_tracks_addresses() {
        let factory = ReplicaNetworkFactory::new();
        factory.add_node(2, "b2:5011".into()).await;
        assert_eq!(factory.get_node_addr(2).await.as_deref(), Some("b2:5011"));
        assert!(factory.get_node_addr(3).await.is_none());
    }

    #[tokio::test]
    async fn test_frames_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let buf = read_frame(&mut stream).await.unwrap();
                write_frame(&mut stream, &buf).await.unwrap();
            }
        });

        let mut stream = connect(&addr.to_string()).await.unwrap();
        for payload in [&b"one"[..], &b"two"[..]] {
            write_frame(&mut stream, payload).await.unwrap();
            assert_eq!(read_frame(&mut stream).await.unwrap(), payload);
        }
        server.await.unwrap();
    }
}
