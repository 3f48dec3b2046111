//! Raft type configuration for partition replicas.

use openraft::BasicNode;
use std::io::Cursor;

use super::commands::{LogCommand, LogResponse};

/// Position of a broker in a partition's replica set.
pub type ReplicaNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogCommand,
        R = LogResponse,
        NodeId = ReplicaNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
