//! Crate-wide error type.
//!
//! Every failure a client can observe maps to one [`Error`] variant whose
//! `Display` text is part of the HTTP contract: managers and brokers reply with
//! `{"status": "failure", "message": <error text>}` and existing clients match
//! on those strings.
//!
//! # Serialization
//!
//! `Error` is `Serialize`/`Deserialize` so read-only managers receive the exact
//! same variant from the primary's `/metadata` endpoint that a local store would
//! have produced. Third-party errors are therefore folded into string payloads
//! through `From` impls instead of being carried as sources.

use std::result;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, ThisError, Serialize, Deserialize)]
pub enum Error {
    #[error("Topic already exists.")]
    TopicAlreadyExists,

    #[error("Topic does not exist.")]
    TopicNotFound,

    #[error("Producer not registered with topic.")]
    ProducerNotRegistered,

    #[error("Consumer not registered with topic.")]
    ConsumerNotRegistered,

    /// Out-of-range partition on the produce path.
    #[error("Invalid Partition Number.")]
    InvalidPartition,

    /// Out-of-range partition on the consume/size path.
    #[error("Invalid partition number.")]
    InvalidReadPartition,

    #[error("Broker with hostname already exists.")]
    BrokerAlreadyExists,

    #[error("Broker with hostname not present.")]
    BrokerNotFound,

    #[error("Broker with hostname not inactive.")]
    BrokerNotInactive,

    #[error("Broker with hostname not active.")]
    BrokerNotActive,

    /// Every replica of the requested partition is inactive.
    #[error("All brokers are inactive.")]
    NoActiveBroker,

    /// No replica answered a read.
    #[error("No active brokers found")]
    NoBrokersAvailable,

    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The broker already stores a different record at the allocated index.
    #[error("Log index already holds another record.")]
    LogIndexTaken,

    /// Generic missing key (partition, producer, log index, ...).
    #[error("{0} not found.")]
    NotFound(String),

    /// Malformed request body or field.
    #[error("{0}")]
    InvalidRequest(String),

    /// No leader, lost quorum, or a data-plane RPC timed out.
    #[error("Cluster not available: {0}")]
    ClusterNotAvailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller may retry the same request later.
    ///
    /// Validation and registration failures are permanent; transport,
    /// consensus and storage failures are usually transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ClusterNotAvailable(_)
                | Error::Rpc(_)
                | Error::Raft(_)
                | Error::Storage(_)
                | Error::NoActiveBroker
                | Error::NoBrokersAvailable
        )
    }

    /// Rebuild the error a peer put in a failure reply. Only variants callers
    /// act on are recognized; any other text becomes [`Error::Rpc`].
    pub fn from_failure_message(message: String) -> Self {
        if message == Error::LogIndexTaken.to_string() {
            Error::LogIndexTaken
        } else {
            Error::Rpc(message)
        }
    }

    /// Whether this error means "the thing you asked for is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TopicNotFound | Error::BrokerNotFound | Error::NotFound(_)
        )
    }

    /// Whether this error is a duplicate-create that sync paths may ignore.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::TopicAlreadyExists | Error::BrokerAlreadyExists)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(format!("encoding failed: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::ClusterNotAvailable(format!("request timed out: {}", e))
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
