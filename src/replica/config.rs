//! Configuration for one partition replica.

use std::time::Duration;

use super::types::ReplicaNodeId;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Position of the hosting broker in the partition's replica set.
    pub node_id: ReplicaNodeId,

    /// Address the Raft RPC listener binds to.
    pub listen_addr: String,

    /// Every voter of the partition, `(node_id, host:control_port)`.
    pub members: Vec<(ReplicaNodeId, String)>,

    /// Object store prefix for the vote, journal and snapshots.
    pub storage_prefix: String,

    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Build a snapshot (and purge the journal) every N applied entries.
    pub snapshot_threshold: u64,

    /// Concurrent proposals allowed before callers wait for a slot.
    pub max_pending_proposals: usize,

    /// Upper bound on waiting for a proposal slot plus its commit.
    pub proposal_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "127.0.0.1:5011".to_string(),
            members: Vec::new(),
            storage_prefix: "replicas/default".to_string(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_payload_entries: 100,
            snapshot_threshold: 1_000,
            max_pending_proposals: 1_000,
            proposal_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplicaConfig {
    /// Check only the timing knobs; brokers validate these once at startup,
    /// before any partition exists.
    pub fn validate_timing(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.proposal_timeout.is_zero() {
            errors.push("proposal_timeout must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.validate_timing().err().unwrap_or_default();

        if self.members.is_empty() {
            errors.push("members must not be empty".to_string());
        } else if !self.members.iter().any(|(id, _)| *id == self.node_id) {
            errors.push(format!(
                "node_id ({}) is not one of the members",
                self.node_id
            ));
        }

        if self.max_pending_proposals == 0 {
            errors.push("max_pending_proposals must be at least 1".to_string());
        }

        if self.max_payload_entries == 0 {
            errors.push("max_payload_entries must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Address other replicas use to reach this one.
    pub fn advertised_addr(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|(id, _)| *id == self.node_id)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: format!("connectify-{}", self.storage_prefix),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> ReplicaConfig {
        ReplicaConfig {
            node_id: 1,
            members: vec![
                (0, "b0:5011".into()),
                (1, "b1:5011".into()),
                (2, "b2:5011".into()),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_timing_is_valid() {
        assert!(ReplicaConfig::default().validate_timing().is_ok());
        assert!(three_members().validate().is_ok());
    }

    #[test]
    fn test_election_timeout_order() {
        let config = ReplicaConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(400),
            ..three_members()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("election_timeout_min")));
    }

    #[test]
    fn test_heartbeat_too_slow() {
        let config = ReplicaConfig {
            heartbeat_interval: Duration::from_millis(400),
            ..three_members()
        };
        let errors = config.validate_timing().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_node_must_be_member() {
        let config = ReplicaConfig {
            node_id: 7,
            ..three_members()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("node_id")));
        assert!(ReplicaConfig::default().validate().is_err());
    }

    #[test]
    fn test_advertised_addr_and_openraft_config() {
        let config = three_members();
        assert_eq!(config.advertised_addr(), Some("b1:5011"));

        let raft = config.to_openraft_config();
        assert_eq!(raft.heartbeat_interval, 100);
        assert_eq!(raft.election_timeout_min, 300);
        assert_eq!(raft.election_timeout_max, 600);
        assert!(raft.validate().is_ok());
    }
}
