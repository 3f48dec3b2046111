//! Service configuration.
//!
//! Each service reads its settings from `CONNECTIFY_*` environment variables
//! through `from_env()`. Parsing goes through `from_lookup`, which takes any
//! key → value function, so tests never touch the process environment.
//! `validate()` reports every problem at once.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_ADMIN_TOKEN, DEFAULT_HEALTH_INTERVAL, DEFAULT_LISTEN_ADDR, DEFAULT_PARTITION_COUNT,
    DEFAULT_PING_TIMEOUT, DEFAULT_REPLICATION_FACTOR, DEFAULT_RPC_TIMEOUT,
    DEFAULT_SNAPSHOT_INTERVAL, MAX_PARTITIONS_PER_TOPIC,
};
use crate::error::{Error, Result};
use crate::replica::ReplicaConfig;

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", key, e))),
        _ => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_list<F>(lookup: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn into_config_error(errors: Vec<String>) -> Error {
    Error::Config(errors.join(", "))
}

/// Settings of the primary manager.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    pub listen_addr: String,
    pub admin_token: String,
    /// Base URLs of every read-only manager that receives sync pushes.
    pub readonly_urls: Vec<String>,
    /// Local directory for metadata snapshots and pending requests; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub replication_factor: usize,
    pub default_partitions: u32,
    pub health_interval: Duration,
    pub rpc_timeout: Duration,
    pub ping_timeout: Duration,
    pub snapshot_interval: Duration,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            admin_token: DEFAULT_ADMIN_TOKEN.to_string(),
            readonly_urls: Vec::new(),
            data_dir: None,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            default_partitions: DEFAULT_PARTITION_COUNT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl PrimaryConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            listen_addr: lookup("CONNECTIFY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            admin_token: lookup("CONNECTIFY_ADMIN_TOKEN").unwrap_or(defaults.admin_token),
            readonly_urls: parse_list(&lookup, "CONNECTIFY_READONLY_URLS"),
            data_dir: lookup("CONNECTIFY_DATA_DIR").map(PathBuf::from),
            replication_factor: parse_var(
                &lookup,
                "CONNECTIFY_REPLICATION_FACTOR",
                defaults.replication_factor,
            )?,
            default_partitions: parse_var(
                &lookup,
                "CONNECTIFY_DEFAULT_PARTITIONS",
                defaults.default_partitions,
            )?,
            health_interval: parse_millis(
                &lookup,
                "CONNECTIFY_HEALTH_INTERVAL_MS",
                defaults.health_interval,
            )?,
            rpc_timeout: parse_millis(&lookup, "CONNECTIFY_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
            ping_timeout: parse_millis(
                &lookup,
                "CONNECTIFY_PING_TIMEOUT_MS",
                defaults.ping_timeout,
            )?,
            snapshot_interval: parse_millis(
                &lookup,
                "CONNECTIFY_SNAPSHOT_INTERVAL_MS",
                defaults.snapshot_interval,
            )?,
        };
        config.validate().map_err(into_config_error)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.admin_token.is_empty() {
            errors.push("admin_token must not be empty".to_string());
        }
        if self.replication_factor == 0 {
            errors.push("replication_factor must be at least 1".to_string());
        }
        if self.default_partitions == 0 || self.default_partitions > MAX_PARTITIONS_PER_TOPIC {
            errors.push(format!(
                "default_partitions must be between 1 and {}, got {}",
                MAX_PARTITIONS_PER_TOPIC, self.default_partitions
            ));
        }
        if self.health_interval.is_zero() {
            errors.push("health_interval must be positive".to_string());
        }
        if self.rpc_timeout.is_zero() || self.ping_timeout.is_zero() {
            errors.push("rpc_timeout and ping_timeout must be positive".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Settings of a read-only manager.
#[derive(Debug, Clone)]
pub struct ReadonlyConfig {
    pub listen_addr: String,
    /// Base URL of the primary manager, which hosts the metadata store.
    pub primary_url: String,
    pub rpc_timeout: Duration,
}

impl Default for ReadonlyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            primary_url: "http://primary:5000".to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ReadonlyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            listen_addr: lookup("CONNECTIFY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            primary_url: lookup("CONNECTIFY_PRIMARY_URL").unwrap_or(defaults.primary_url),
            rpc_timeout: parse_millis(&lookup, "CONNECTIFY_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
        };
        config.validate().map_err(into_config_error)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !(self.primary_url.starts_with("http://") || self.primary_url.starts_with("https://")) {
            errors.push(format!(
                "primary_url must be an http(s) URL, got {}",
                self.primary_url
            ));
        }
        if self.rpc_timeout.is_zero() {
            errors.push("rpc_timeout must be positive".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Settings of a broker node.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: String,
    /// The address this broker is registered under at the primary.
    pub advertised_addr: String,
    /// Host the per-partition Raft listeners bind to.
    pub raft_bind_host: String,
    pub data_dir: Option<PathBuf>,
    /// Raft timing shared by every replica this broker hosts.
    pub replica: ReplicaConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            advertised_addr: "127.0.0.1:5000".to_string(),
            raft_bind_host: "0.0.0.0".to_string(),
            data_dir: None,
            replica: ReplicaConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut replica = defaults.replica.clone();
        replica.heartbeat_interval = parse_millis(
            &lookup,
            "CONNECTIFY_RAFT_HEARTBEAT_MS",
            replica.heartbeat_interval,
        )?;
        replica.election_timeout_min = parse_millis(
            &lookup,
            "CONNECTIFY_RAFT_ELECTION_MIN_MS",
            replica.election_timeout_min,
        )?;
        replica.election_timeout_max = parse_millis(
            &lookup,
            "CONNECTIFY_RAFT_ELECTION_MAX_MS",
            replica.election_timeout_max,
        )?;
        replica.proposal_timeout = parse_millis(
            &lookup,
            "CONNECTIFY_PROPOSAL_TIMEOUT_MS",
            replica.proposal_timeout,
        )?;

        let config = Self {
            listen_addr: lookup("CONNECTIFY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            advertised_addr: lookup("CONNECTIFY_ADVERTISED_ADDR")
                .unwrap_or(defaults.advertised_addr),
            raft_bind_host: lookup("CONNECTIFY_RAFT_BIND_HOST").unwrap_or(defaults.raft_bind_host),
            data_dir: lookup("CONNECTIFY_DATA_DIR").map(PathBuf::from),
            replica,
        };
        config.validate().map_err(into_config_error)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.advertised_addr.is_empty() {
            errors.push("advertised_addr must not be empty".to_string());
        }
        if self.raft_bind_host.is_empty() {
            errors.push("raft_bind_host must not be empty".to_string());
        }
        if let Err(replica_errors) = self.replica.validate_timing() {
            errors.extend(replica_errors);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
