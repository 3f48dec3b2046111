//! Broker liveness probing and the activate/deactivate loop.
//!
//! Each tick checks every registered broker concurrently. A check is up to
//! [`HEALTH_CHECK_ATTEMPTS`](crate::constants::HEALTH_CHECK_ATTEMPTS) attempts spaced by the
//! health check retry policy; every failed attempt decrements the broker's health
//! counter. A broker that is still failing once the counter sits at the floor
//! is deactivated. A successful attempt resets the counter and, for an
//! inactive broker, replays its pending queue before reactivating it.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::data::DataManager;
use crate::background_tasks::BackgroundTaskRegistry;
use crate::client::BrokerClient;
use crate::constants::HEALTH_FLOOR;
use crate::error::Result;
use crate::retry::health_check_policy;
use crate::types::{BrokerInfo, HealthUpdate};

/// What one tick did to one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Healthy,
    Activated,
    /// Reachable, but its pending queue could not be fully replayed.
    ActivationDeferred,
    /// Unreachable; still above the floor or already inactive.
    Unhealthy { health: i32 },
    Deactivated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: Vec<(String, CheckOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, broker: &str) -> Option<CheckOutcome> {
        self.outcomes
            .iter()
            .find(|(b, _)| b == broker)
            .map(|(_, o)| *o)
    }
}

pub struct HealthMonitor {
    manager: Arc<DataManager>,
    brokers: Arc<dyn BrokerClient>,
    /// Sleeps between check attempts; one fewer than the attempt count.
    retry_delays: Vec<Duration>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<DataManager>, brokers: Arc<dyn BrokerClient>) -> Self {
        Self {
            manager,
            brokers,
            retry_delays: health_check_policy().build().collect(),
        }
    }

    /// Override the delays between attempts (attempts = delays + 1).
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Check every registered broker once.
    pub async fn tick(&self) -> Result<TickReport> {
        let brokers = self.manager.store().list_brokers().await?;
        let checks = brokers.iter().map(|broker| self.check_broker(broker));
        let outcomes = join_all(checks).await;

        let mut report = TickReport::default();
        for (broker, outcome) in brokers.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => report.outcomes.push((broker.addr, outcome)),
                Err(e) => {
                    // The broker may have been removed mid-tick.
                    debug!(broker = %broker.addr, error = %e, "Health check skipped");
                }
            }
        }
        Ok(report)
    }

    async fn check_broker(&self, broker: &BrokerInfo) -> Result<CheckOutcome> {
        let store = self.manager.store();
        let addr = broker.addr.as_str();
        let mut delays = self.retry_delays.iter();
        let health = loop {
            let health = match self.brokers.ping(addr).await {
                Ok(()) => {
                    store.set_broker_health(addr, HealthUpdate::Reset).await?;
                    if store.is_broker_active(addr).await? {
                        return Ok(CheckOutcome::Healthy);
                    }
                    return match self.manager.activate_broker(addr).await {
                        Ok(()) => Ok(CheckOutcome::Activated),
                        Err(e) => {
                            warn!(broker = addr, error = %e, "Broker reachable but not reactivated");
                            Ok(CheckOutcome::ActivationDeferred)
                        }
                    };
                }
                Err(e) => {
                    let health = store
                        .set_broker_health(addr, HealthUpdate::Decrement)
                        .await?;
                    debug!(broker = addr, health, error = %e, "Health check failed");
                    health
                }
            };
            match delays.next() {
                Some(delay) => tokio::time::sleep(*delay).await,
                None => break health,
            }
        };

        if health <= HEALTH_FLOOR && store.is_broker_active(addr).await? {
            return match self.manager.deactivate_broker(addr).await {
                Ok(()) => Ok(CheckOutcome::Deactivated),
                Err(e) => {
                    warn!(broker = addr, error = %e, "Failed to deactivate broker");
                    Ok(CheckOutcome::Unhealthy { health })
                }
            };
        }
        Ok(CheckOutcome::Unhealthy { health })
    }

    /// Run [`tick`](Self::tick) every `interval` until the registry shuts down.
    pub fn spawn(self: Arc<Self>, registry: &mut BackgroundTaskRegistry, interval: Duration) {
        info!(interval_ms = interval.as_millis() as u64, "Starting health monitor");
        registry.spawn_periodic("health_monitor", interval, move |_| {
            let monitor = self.clone();
            async move {
                if let Err(e) = monitor.tick().await {
                    warn!(error = %e, "Health monitor tick failed");
                }
            }
        });
    }
}
