//! `reqwest` implementation of [`BrokerClient`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::BrokerClient;
use crate::api::{
    BrokerConsumeRequest, BrokerConsumeResponse, BrokerProduceRequest, BrokerProduceResponse,
    CreatePartitionRequest, FailureResponse, StatusResponse,
};
use crate::error::{Error, Result};
use crate::types::{LogIndex, broker_url};

pub struct HttpBrokerClient {
    client: reqwest::Client,
    ping_timeout: Duration,
}

impl HttpBrokerClient {
    /// `rpc_timeout` bounds every call; pings use the shorter `ping_timeout`.
    pub fn new(rpc_timeout: Duration, ping_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .connect_timeout(rpc_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            ping_timeout,
        })
    }

    async fn post<B, T>(&self, broker: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", broker_url(broker), path);
        let response = self.client.post(&url).json(body).send().await?;
        parse_reply(response).await
    }

    async fn get<B, T>(&self, broker: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", broker_url(broker), path);
        let response = self.client.get(&url).json(body).send().await?;
        parse_reply(response).await
    }
}

/// Decode a success body, or turn a failure body back into an [`Error`].
pub(crate) async fn parse_reply<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&bytes)
            .map_err(|e| Error::Rpc(format!("malformed reply: {}", e)));
    }
    match serde_json::from_slice::<FailureResponse>(&bytes) {
        Ok(failure) => Err(Error::from_failure_message(failure.message)),
        Err(_) => Err(Error::Rpc(format!("HTTP {}", status))),
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn ping(&self, broker: &str) -> Result<()> {
        let url = format!("{}/", broker_url(broker));
        let response = self
            .client
            .get(&url)
            .timeout(self.ping_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            debug!(broker, status = %response.status(), "Ping returned non-success status");
            Err(Error::Rpc(format!("ping returned HTTP {}", response.status())))
        }
    }

    async fn create_partition(
        &self,
        broker: &str,
        request: &CreatePartitionRequest,
    ) -> Result<()> {
        let _: StatusResponse = self.post(broker, "/topics", request).await?;
        Ok(())
    }

    async fn produce(&self, broker: &str, request: &BrokerProduceRequest) -> Result<LogIndex> {
        let reply: BrokerProduceResponse = self.post(broker, "/producer/produce", request).await?;
        Ok(reply.log_index)
    }

    async fn consume(
        &self,
        broker: &str,
        request: &BrokerConsumeRequest,
    ) -> Result<BrokerConsumeResponse> {
        self.get(broker, "/consumer/consume", request).await
    }
}
