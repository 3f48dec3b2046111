//! Read-only manager.
//!
//! Serves consume and size requests from a routing cache that the primary
//! keeps current through `/sync/*` pushes. Offsets are claimed at the
//! primary's metadata store.
//!
//! ```bash
//! CONNECTIFY_PRIMARY_URL=http://primary:5000 cargo run --bin connectify-readonly
//! ```

use std::sync::Arc;

use connectify::client::HttpBrokerClient;
use connectify::config::ReadonlyConfig;
use connectify::manager::{ReadonlyManager, readonly_http};
use connectify::metadata::RemoteMetadataStore;
use connectify::telemetry::{LogFormat, init_logging};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = ReadonlyConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        primary_url = %config.primary_url,
        "Starting read-only manager"
    );

    let store = Arc::new(RemoteMetadataStore::new(
        &config.primary_url,
        config.rpc_timeout,
    )?);
    let brokers = Arc::new(HttpBrokerClient::new(config.rpc_timeout, config.rpc_timeout)?);
    let manager = Arc::new(ReadonlyManager::new(store, brokers));

    // The primary may still be starting; sync pushes and cache-miss lookups
    // fill the cache in that case.
    if let Err(e) = manager.bootstrap().await {
        warn!(error = %e, "Routing cache bootstrap failed, starting with an empty cache");
    }

    let app = readonly_http::router(manager);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(address = %config.listen_addr, "Read-only manager is serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Read-only manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
