//! Broker node.
//!
//! Hosts partition replicas, each with its own Raft listener on the
//! partition's control port, and serves the internal data plane.
//!
//! ```bash
//! CONNECTIFY_ADVERTISED_ADDR=broker-1:5000 \
//! CONNECTIFY_DATA_DIR=/var/lib/connectify-broker \
//! cargo run --bin connectify-broker
//! ```

use std::sync::Arc;

use connectify::broker::{self, BrokerNode};
use connectify::config::BrokerConfig;
use connectify::store::create_object_store;
use connectify::telemetry::{LogFormat, init_logging};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = BrokerConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        advertised_addr = %config.advertised_addr,
        raft_bind_host = %config.raft_bind_host,
        data_dir = ?config.data_dir,
        "Starting broker"
    );

    let object_store = create_object_store(config.data_dir.as_deref())?;
    let listen_addr = config.listen_addr.clone();
    let node = Arc::new(BrokerNode::new(config, object_store));
    let recovered = node.recover().await?;
    if recovered > 0 {
        info!(replicas = recovered, "Recovered partition replicas");
    }

    let app = broker::router(node.clone());
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(address = %listen_addr, "Broker is serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.shutdown().await;
    info!("Broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
