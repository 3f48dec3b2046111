//! Client-facing HTTP API of the primary manager.
//!
//! - `POST /topics`, `GET /topics`
//! - `POST /producer/register`, `POST /consumer/register`
//! - `POST /producer/produce`
//! - `POST /admin/broker/{add,remove,activate,deactivate}` (token protected)
//! - `POST /metadata` internal metadata command endpoint for read-only managers
//! - `GET /metrics`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, warn};

use super::DataManager;
use crate::api::{
    AdminBrokerRequest, ApiJson, CreateTopicRequest, MessageResponse, ProduceRequest,
    RegisterConsumerResponse, RegisterProducerResponse, RegisterRequest, STATUS_SUCCESS,
    StatusResponse, TopicsResponse, metrics_handler, success,
};
use crate::client::BrokerChange;
use crate::error::{Error, Result};
use crate::metadata::{MetadataCommand, MetadataResponse, dispatch};

pub struct PrimaryState {
    pub manager: Arc<DataManager>,
    pub admin_token: String,
}

impl PrimaryState {
    pub fn new(manager: Arc<DataManager>, admin_token: impl Into<String>) -> Self {
        Self {
            manager,
            admin_token: admin_token.into(),
        }
    }
}

pub fn router(state: Arc<PrimaryState>) -> Router {
    Router::new()
        .route("/topics", post(create_topic).get(list_topics))
        .route("/producer/register", post(register_producer))
        .route("/consumer/register", post(register_consumer))
        .route("/producer/produce", post(produce))
        .route("/admin/broker/:change", post(admin_broker))
        .route("/metadata", post(metadata))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn create_topic(
    State(state): State<Arc<PrimaryState>>,
    ApiJson(request): ApiJson<CreateTopicRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .manager
        .create_topic(&request.name, request.number_of_partitions)
        .await?;
    Ok(Json(MessageResponse {
        status: STATUS_SUCCESS.to_string(),
        message: format!("Topic '{}' created successfully.", request.name),
    }))
}

async fn list_topics(State(state): State<Arc<PrimaryState>>) -> Result<Json<TopicsResponse>> {
    let topics = state.manager.list_topics().await?;
    Ok(Json(TopicsResponse {
        status: STATUS_SUCCESS.to_string(),
        topics,
    }))
}

async fn register_producer(
    State(state): State<Arc<PrimaryState>>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterProducerResponse>> {
    let (producer_id, partition_count) = state.manager.register_producer(&request.topic).await?;
    Ok(Json(RegisterProducerResponse {
        status: STATUS_SUCCESS.to_string(),
        producer_id,
        partition_count,
    }))
}

async fn register_consumer(
    State(state): State<Arc<PrimaryState>>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterConsumerResponse>> {
    let (consumer_id, partition_count) = state.manager.add_consumer(&request.topic).await?;
    Ok(Json(RegisterConsumerResponse {
        status: STATUS_SUCCESS.to_string(),
        consumer_id,
        partition_count,
    }))
}

async fn produce(
    State(state): State<Arc<PrimaryState>>,
    ApiJson(request): ApiJson<ProduceRequest>,
) -> Result<Json<StatusResponse>> {
    state
        .manager
        .produce(
            &request.topic,
            &request.producer_id,
            &request.message,
            request.partition_index,
        )
        .await?;
    Ok(success())
}

async fn admin_broker(
    State(state): State<Arc<PrimaryState>>,
    Path(change): Path<String>,
    ApiJson(request): ApiJson<AdminBrokerRequest>,
) -> Result<Json<StatusResponse>> {
    if request.token != state.admin_token {
        warn!(broker = %request.broker_host, change = %change, "Rejected admin request with bad token");
        return Err(Error::AuthenticationFailed);
    }
    let change: BrokerChange = change.parse()?;
    let broker = request.broker_host.as_str();
    match change {
        BrokerChange::Add => state.manager.add_broker(broker).await?,
        BrokerChange::Remove => state.manager.remove_broker(broker).await?,
        BrokerChange::Activate => state.manager.activate_broker(broker).await?,
        BrokerChange::Deactivate => state.manager.deactivate_broker(broker).await?,
    }
    info!(broker, change = change.as_str(), "Admin broker change applied");
    Ok(success())
}

/// Executes one metadata command. Store errors travel inside the body so the
/// remote caller sees the same variant a local store returns.
async fn metadata(
    State(state): State<Arc<PrimaryState>>,
    ApiJson(command): ApiJson<MetadataCommand>,
) -> Json<std::result::Result<MetadataResponse, Error>> {
    Json(dispatch(state.manager.store().as_ref(), command).await)
}
