//! # Connectify
//! Distributed partitioned message queue with Raft-replicated partition logs.
//!
//! A cluster has three kinds of processes:
//!
//! - a **primary manager** that owns the metadata store, places topic
//!   partitions on brokers, routes produces and watches broker health
//!   ([`manager::DataManager`], [`manager::HealthMonitor`]);
//! - **read-only managers** that serve consumes from a routing cache pushed by
//!   the primary ([`manager::ReadonlyManager`]);
//! - **brokers** that host one Raft group per partition replica
//!   ([`broker::BrokerNode`], [`replica::PartitionReplica`]).
//!
//! Log indexes, committed sizes and consumer offsets are atomic counters in
//! the [`metadata::MetadataStore`]; the partition logs themselves only ever
//! grow through consensus.
//!
//! ## Running a cluster
//! ```bash
//! CONNECTIFY_ADVERTISED_ADDR=127.0.0.1:6001 CONNECTIFY_LISTEN_ADDR=0.0.0.0:6001 \
//!     cargo run --bin connectify-broker
//! CONNECTIFY_PRIMARY_URL=http://127.0.0.1:5000 CONNECTIFY_LISTEN_ADDR=0.0.0.0:5100 \
//!     cargo run --bin connectify-readonly
//! CONNECTIFY_READONLY_URLS=http://127.0.0.1:5100 cargo run --bin connectify-primary
//!
//! curl -XPOST localhost:5000/admin/broker/add \
//!     -H 'content-type: application/json' \
//!     -d '{"broker_host":"127.0.0.1:6001","token":"rnn1234"}'
//! ```
//!
//! ## Embedding
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use connectify::client::mock::{MockBrokerClient, RecordingReplicaSync};
//! use connectify::manager::{DataManager, PendingRequestQueue};
//! use connectify::metadata::InMemoryMetadataStore;
//! use object_store::memory::InMemory;
//!
//! # async fn run() -> connectify::error::Result<()> {
//! let manager = DataManager::new(
//!     Arc::new(InMemoryMetadataStore::new()),
//!     Arc::new(MockBrokerClient::new()),
//!     Arc::new(RecordingReplicaSync::new()),
//!     Arc::new(PendingRequestQueue::new(Arc::new(InMemory::new()))),
//!     3,
//!     2,
//! );
//! manager.add_broker("broker-1:5000").await?;
//! manager.create_topic("orders", Some(4)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod background_tasks;
pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod metrics;
pub mod replica;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for services embedding the managers.
    pub use crate::error::{Error, Result};
    pub use crate::manager::{DataManager, ReadonlyManager};
    pub use crate::metadata::{InMemoryMetadataStore, MetadataStore};
    pub use crate::types::{BrokerAddr, LogIndex, PartitionIndex, PartitionKey};
}
