//! Raft-replicated partition logs.
//!
//! Every partition of every topic is its own Raft group. The replicas of a
//! partition live on the brokers of its replica set; the broker's position in
//! that set is its Raft node id, and all replicas share the partition's
//! control port:
//!
//! ```text
//!   broker-a:5011 (node 0) ◄──► broker-b:5011 (node 1) ◄──► broker-c:5011 (node 2)
//!          │                           │                           │
//!     PartitionLog               PartitionLog                PartitionLog
//!   index → LogRecord          index → LogRecord           index → LogRecord
//! ```
//!
//! Writes go through [`PartitionReplica::propose`] and are applied exactly
//! once on commit. Reads are served from the local [`PartitionLog`] of any
//! replica.

mod commands;
mod config;
mod network;
mod node;
mod state_machine;
mod storage;
mod types;

pub use commands::{LogCommand, LogResponse};
pub use config::ReplicaConfig;
pub use network::{MAX_FORWARD_HOPS, ReplicaNetworkFactory, forward_client_write};
pub use node::PartitionReplica;
pub use state_machine::PartitionLog;
pub use storage::ReplicaStore;
pub use types::{ReplicaNodeId, TypeConfig};
