//! HTTP API of a read-only manager.
//!
//! - `GET /topics`
//! - `GET /consumer/consume`, `GET /size`
//! - `POST /sync/topics`, `POST /sync/consumer/register`,
//!   `POST /sync/broker/{add,remove,activate,deactivate}` cache pushes from the primary
//! - `GET /metrics`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::ReadonlyManager;
use crate::api::{
    ApiJson, ConsumeRequest, ConsumeResponse, STATUS_SUCCESS, SizesResponse, StatusResponse,
    SyncBrokerRequest, SyncConsumerRequest, SyncTopicRequest, TopicsResponse, metrics_handler,
    success,
};
use crate::client::BrokerChange;
use crate::error::Result;

pub fn router(manager: Arc<ReadonlyManager>) -> Router {
    Router::new()
        .route("/topics", get(list_topics))
        .route("/consumer/consume", get(consume))
        .route("/size", get(size))
        .route("/sync/topics", post(sync_topic))
        .route("/sync/consumer/register", post(sync_consumer))
        .route("/sync/broker/:change", post(sync_broker))
        .route("/metrics", get(metrics_handler))
        .with_state(manager)
}

async fn list_topics(State(manager): State<Arc<ReadonlyManager>>) -> Json<TopicsResponse> {
    Json(TopicsResponse {
        status: STATUS_SUCCESS.to_string(),
        topics: manager.get_topics(),
    })
}

async fn consume(
    State(manager): State<Arc<ReadonlyManager>>,
    ApiJson(request): ApiJson<ConsumeRequest>,
) -> Result<Json<ConsumeResponse>> {
    let outcome = manager
        .consume(&request.topic, &request.consumer_id, request.partition_index)
        .await?;
    Ok(Json(ConsumeResponse {
        status: STATUS_SUCCESS.to_string(),
        message: outcome.message().map(str::to_string),
        partition_read: outcome.partition(),
    }))
}

async fn size(
    State(manager): State<Arc<ReadonlyManager>>,
    ApiJson(request): ApiJson<ConsumeRequest>,
) -> Result<Json<SizesResponse>> {
    let sizes = manager
        .size(&request.topic, &request.consumer_id, request.partition_index)
        .await?;
    Ok(Json(SizesResponse {
        status: STATUS_SUCCESS.to_string(),
        sizes,
    }))
}

async fn sync_topic(
    State(manager): State<Arc<ReadonlyManager>>,
    ApiJson(request): ApiJson<SyncTopicRequest>,
) -> Result<Json<StatusResponse>> {
    manager.sync_topic(request)?;
    Ok(success())
}

async fn sync_consumer(
    State(manager): State<Arc<ReadonlyManager>>,
    ApiJson(request): ApiJson<SyncConsumerRequest>,
) -> Json<StatusResponse> {
    manager.sync_consumer(&request.topic, &request.consumer_id);
    success()
}

async fn sync_broker(
    State(manager): State<Arc<ReadonlyManager>>,
    Path(change): Path<String>,
    ApiJson(request): ApiJson<SyncBrokerRequest>,
) -> Result<Json<StatusResponse>> {
    let change: BrokerChange = change.parse()?;
    manager.sync_broker(change, &request.broker_host);
    Ok(success())
}
