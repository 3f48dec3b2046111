//! Internal HTTP API of a broker node.
//!
//! - `GET /` liveness
//! - `POST /topics` start a partition replica
//! - `POST /producer/produce` replicate a record at a manager-allocated index
//! - `GET /consumer/consume` read a committed record
//! - `GET /size` committed length per hosted partition
//! - `GET /metrics`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use super::BrokerNode;
use crate::api::{
    ApiJson, BrokerConsumeRequest, BrokerConsumeResponse, BrokerProduceRequest,
    BrokerProduceResponse, BrokerSizeRequest, CreatePartitionRequest, MessageResponse,
    STATUS_SUCCESS, SizesResponse, StatusResponse, metrics_handler, success,
};
use crate::error::Result;

pub fn router(node: Arc<BrokerNode>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/topics", post(create_partition))
        .route("/producer/produce", post(produce))
        .route("/consumer/consume", get(consume))
        .route("/size", get(size))
        .route("/metrics", get(metrics_handler))
        .with_state(node)
}

async fn liveness(State(node): State<Arc<BrokerNode>>) -> Json<MessageResponse> {
    Json(MessageResponse {
        status: STATUS_SUCCESS.to_string(),
        message: format!("Broker {} is running", node.advertised_addr()),
    })
}

async fn create_partition(
    State(node): State<Arc<BrokerNode>>,
    ApiJson(request): ApiJson<CreatePartitionRequest>,
) -> Result<Json<StatusResponse>> {
    node.create_partition(&request).await?;
    Ok(success())
}

async fn produce(
    State(node): State<Arc<BrokerNode>>,
    ApiJson(request): ApiJson<BrokerProduceRequest>,
) -> Result<Json<BrokerProduceResponse>> {
    let log_index = node
        .append(
            &request.topic,
            request.partition_index,
            request.log_index,
            &request.producer_id,
            &request.message,
        )
        .await?;
    debug!(
        topic = %request.topic,
        partition = request.partition_index,
        log_index,
        "Record replicated"
    );
    Ok(Json(BrokerProduceResponse {
        status: STATUS_SUCCESS.to_string(),
        log_index,
    }))
}

async fn consume(
    State(node): State<Arc<BrokerNode>>,
    ApiJson(request): ApiJson<BrokerConsumeRequest>,
) -> Result<Json<BrokerConsumeResponse>> {
    let record = node
        .read(&request.topic, request.partition_index, request.log_index)
        .await?;
    Ok(Json(BrokerConsumeResponse {
        status: STATUS_SUCCESS.to_string(),
        message: record.message,
        producer_id: record.producer_id,
        partition_read: request.partition_index,
        log_index: record.index,
        timestamp_ms: record.timestamp_ms,
    }))
}

async fn size(
    State(node): State<Arc<BrokerNode>>,
    ApiJson(request): ApiJson<BrokerSizeRequest>,
) -> Result<Json<SizesResponse>> {
    let sizes = node.size(&request.topic, request.partition_index).await?;
    Ok(Json(SizesResponse {
        status: STATUS_SUCCESS.to_string(),
        sizes,
    }))
}
