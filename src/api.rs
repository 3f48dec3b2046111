//! HTTP request/response models shared by the three services.
//!
//! Every reply is either `200 {"status": "success", ...}` or
//! `400 {"status": "failure", "message": ...}`. [`ApiJson`] folds body
//! rejections into the same failure shape, and [`Error`] renders itself as one.

use axum::extract::{FromRequest, Request};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, async_trait};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics;
use crate::types::{BrokerAddr, LogIndex, PartitionIndex, RequestedPartition};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILURE: &str = "failure";

/// JSON body extractor whose rejection is a `400 failure` reply.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(Error::InvalidRequest(rejection.body_text())),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = FailureResponse {
            status: STATUS_FAILURE.to_string(),
            message: self.to_string(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// `{"status": "success"}`.
pub fn success() -> Json<StatusResponse> {
    Json(StatusResponse::success())
}

/// Prometheus text exposition of the process registry.
pub async fn metrics_handler() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ----- generic replies -----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicsResponse {
    pub status: String,
    pub topics: Vec<String>,
}

// ----- primary manager -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
    #[serde(default)]
    pub number_of_partitions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterProducerResponse {
    pub status: String,
    pub producer_id: String,
    pub partition_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConsumerResponse {
    pub status: String,
    pub consumer_id: String,
    pub partition_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub topic: String,
    pub producer_id: String,
    pub message: String,
    #[serde(default)]
    pub partition_index: Option<RequestedPartition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminBrokerRequest {
    pub broker_host: String,
    pub token: String,
}

// ----- readonly manager -----

/// Body of `/consumer/consume` and `/size` on a readonly manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub topic: String,
    pub consumer_id: String,
    #[serde(default)]
    pub partition_index: Option<RequestedPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResponse {
    pub status: String,
    /// `None` when no unread message was available.
    pub message: Option<String>,
    pub partition_read: PartitionIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSize {
    pub partition_number: PartitionIndex,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizesResponse {
    pub status: String,
    pub sizes: Vec<PartitionSize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTopicRequest {
    pub name: String,
    pub number_of_partitions: u32,
    /// Replica set of each partition, in partition order.
    pub broker_list: Vec<Vec<BrokerAddr>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConsumerRequest {
    pub topic: String,
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBrokerRequest {
    pub broker_host: String,
}

// ----- broker node -----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePartitionRequest {
    pub name: String,
    pub partition_index: PartitionIndex,
    pub replicas: Vec<BrokerAddr>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerProduceRequest {
    pub topic: String,
    pub producer_id: String,
    pub message: String,
    pub partition_index: PartitionIndex,
    pub log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerProduceResponse {
    pub status: String,
    pub log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConsumeRequest {
    pub topic: String,
    pub partition_index: PartitionIndex,
    pub log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConsumeResponse {
    pub status: String,
    pub message: String,
    pub producer_id: String,
    pub partition_read: PartitionIndex,
    pub log_index: LogIndex,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSizeRequest {
    pub topic: String,
    #[serde(default)]
    pub partition_index: Option<PartitionIndex>,
}
