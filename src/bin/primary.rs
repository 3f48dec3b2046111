//! Primary manager.
//!
//! Hosts the authoritative metadata store, places topics, routes produces and
//! runs the broker health monitor.
//!
//! ```bash
//! CONNECTIFY_READONLY_URLS=http://readonly-1:5000,http://readonly-2:5000 \
//! CONNECTIFY_DATA_DIR=/var/lib/connectify \
//! cargo run --bin connectify-primary
//! ```
//!
//! Brokers join through `POST /admin/broker/add` with the admin token.

use std::sync::Arc;
use std::time::Duration;

use connectify::background_tasks::BackgroundTaskRegistry;
use connectify::client::{BrokerClient, HttpBrokerClient, HttpReplicaSync};
use connectify::config::PrimaryConfig;
use connectify::manager::primary_http::{self, PrimaryState};
use connectify::manager::{DataManager, HealthMonitor, PendingRequestQueue};
use connectify::metadata::{InMemoryMetadataStore, MetadataCheckpoint, MetadataPersistence};
use connectify::store::create_object_store;
use connectify::telemetry::{LogFormat, init_logging};
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = PrimaryConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        readonly_managers = config.readonly_urls.len(),
        replication_factor = config.replication_factor,
        data_dir = ?config.data_dir,
        "Starting primary manager"
    );

    let object_store = create_object_store(config.data_dir.as_deref())?;
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let persistence = MetadataPersistence::new(object_store.clone());
    if persistence.restore_into(&metadata).await? {
        info!("Metadata restored from snapshot");
    }
    let checkpoint = Arc::new(MetadataCheckpoint::new(metadata.clone(), persistence));

    let brokers: Arc<dyn BrokerClient> =
        Arc::new(HttpBrokerClient::new(config.rpc_timeout, config.ping_timeout)?);
    let sync = Arc::new(HttpReplicaSync::new(
        config.readonly_urls.clone(),
        config.rpc_timeout,
    )?);
    let pending = Arc::new(PendingRequestQueue::new(object_store));
    let manager = Arc::new(DataManager::new(
        metadata.clone(),
        brokers.clone(),
        sync,
        pending,
        config.replication_factor,
        config.default_partitions,
    )
    .with_checkpoint(checkpoint.clone()));

    let mut registry = BackgroundTaskRegistry::new();
    Arc::new(HealthMonitor::new(manager.clone(), brokers)).spawn(&mut registry, config.health_interval);
    {
        let checkpoint = checkpoint.clone();
        registry.spawn_periodic("metadata_snapshot", config.snapshot_interval, move |_| {
            let checkpoint = checkpoint.clone();
            async move {
                if let Err(e) = checkpoint.save().await {
                    warn!(error = %e, "Metadata snapshot failed");
                }
            }
        });
    }

    let app = primary_http::router(Arc::new(PrimaryState::new(
        manager,
        config.admin_token.clone(),
    )));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(address = %config.listen_addr, "Primary manager is serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown_all_with_timeout(SHUTDOWN_TIMEOUT).await;
    checkpoint.save().await?;
    info!("Primary manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
