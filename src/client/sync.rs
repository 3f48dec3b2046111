//! Fan-out of cache updates to every read-only manager.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::broker::parse_reply;
use super::{ReplicaSync, SyncMessage, SyncOutcome};
use crate::api::StatusResponse;
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry::with_network_policy;

pub struct HttpReplicaSync {
    client: reqwest::Client,
    targets: Vec<String>,
}

impl HttpReplicaSync {
    pub fn new(targets: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        let targets = targets
            .into_iter()
            .map(|t| t.trim_end_matches('/').to_string())
            .collect();
        Ok(Self { client, targets })
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    async fn push(&self, target: &str, route: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}{}", target, route);
        let response = self.client.post(&url).json(body).send().await?;
        let _: StatusResponse = parse_reply(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ReplicaSync for HttpReplicaSync {
    async fn broadcast(&self, message: SyncMessage) -> SyncOutcome {
        let route = message.route();
        let body = match message.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(route = %route, error = %e, "Failed to encode sync message");
                return SyncOutcome {
                    delivered: 0,
                    failed: self.targets.len(),
                };
            }
        };

        let pushes = self.targets.iter().map(|target| {
            let route = route.as_str();
            let body = &body;
            async move {
                let result = with_network_policy(
                    || self.push(target, route, body),
                    |e: &Error| e.is_retryable(),
                )
                .await;
                (target, result)
            }
        });

        let mut outcome = SyncOutcome::default();
        for (target, result) in join_all(pushes).await {
            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    metrics::record_sync(&route, "success");
                }
                Err(e) => {
                    outcome.failed += 1;
                    metrics::record_sync(&route, "error");
                    warn!(target = %target, route = %route, error = %e, "Sync push failed");
                }
            }
        }
        debug!(
            route = %route,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Sync broadcast finished"
        );
        outcome
    }
}
