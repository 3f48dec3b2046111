//! Centralized cluster constants.
//!
//! # Categories
//!
//! - **Placement**: partition counts, replication, control ports
//! - **Health**: failure counter bounds and check pacing
//! - **Network**: RPC timeouts and HTTP defaults

use std::time::Duration;

// =============================================================================
// Placement
// =============================================================================

/// Partition count used when a topic is created without an explicit count.
pub const DEFAULT_PARTITION_COUNT: u32 = 2;

/// Upper bound on partitions per topic.
pub const MAX_PARTITIONS_PER_TOPIC: u32 = 1024;

/// Replicas per partition when the cluster has enough brokers.
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Control ports are handed out above this base; the first partition gets 5011.
pub const REPLICA_PORT_BASE: u16 = 5010;

/// Occupied log indices one produce moves past before it gives up. Indices
/// are only occupied after the primary restarted from an older snapshot.
pub const MAX_TAKEN_INDEX_SKIPS: usize = 64;

// =============================================================================
// Health
// =============================================================================

/// Health counter value of a broker whose last check succeeded.
pub const HEALTH_OK: i32 = 0;

/// Lowest health counter value. Reaching it deactivates an active broker.
pub const HEALTH_FLOOR: i32 = -3;

/// Health check attempts per broker per tick.
pub const HEALTH_CHECK_ATTEMPTS: usize = 3;

/// Delay before the first health check retry; doubles for the next one (1s, 2s).
pub const HEALTH_CHECK_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Interval between health monitor ticks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Network
// =============================================================================

/// Timeout applied to every manager → broker and manager → manager call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single liveness ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(800);

/// Default shared token for `/admin/*` endpoints.
pub const DEFAULT_ADMIN_TOKEN: &str = "rnn1234";

/// Default HTTP listen address for every service.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";

/// Interval between metadata snapshots on the primary.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
