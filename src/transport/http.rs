use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::de::DeserializeOwned;
use tracing::{error, info};

use crate::broker::Broker;
use crate::transport::message::{
    AckRequest, IdResponse, PublishConfirm, PublishRequestDto, PullRequest, PullResponse,
    SubscriberRequest, SubscribersResponse, SubscriptionRequest, Success, TopicRequest,
    TopicsQuery, TopicsResponse,
};
use crate::utils::error::BrokerError;

type Shared = State<Arc<Broker>>;
type ApiResult<T> = Result<Json<T>, BrokerError>;

/// Builds the HTTP API over `broker`.
pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/publish", post(publish))
        .route("/pull", get(pull).post(pull))
        .route("/ack", post(acknowledge))
        .route(
            "/topics",
            get(list_topics).post(create_topic).delete(delete_topic),
        )
        .route(
            "/subscribers",
            get(list_subscribers)
                .post(add_subscriber)
                .delete(remove_subscriber),
        )
        .route("/subscriptions", post(subscribe).delete(unsubscribe))
        .route("/generate", get(generate))
        .with_state(broker)
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            info!(reason = %self, "request rejected");
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %self, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.to_string()).into_response()
    }
}

fn parse_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, BrokerError> {
    if body.is_empty() {
        return Err(BrokerError::validation("Request has no body"));
    }
    serde_json::from_slice(body).map_err(|_| BrokerError::validation("Error when parsing JSON"))
}

fn parse_optional<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, BrokerError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    parse_required(body)
}

async fn publish(State(broker): Shared, body: Bytes) -> ApiResult<PublishConfirm> {
    let request: PublishRequestDto = parse_required(&body)?;
    let receipt = broker.publish(request.into())?;
    Ok(Json(receipt.into()))
}

async fn pull(State(broker): Shared, body: Bytes) -> ApiResult<PullResponse> {
    let request: PullRequest = parse_required(&body)?;
    let messages = broker.pull(&request.endpoint, &request.topics)?;
    Ok(Json(PullResponse { messages }))
}

async fn acknowledge(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: AckRequest = parse_required(&body)?;
    let Some(id) = request.message_id else {
        return Err(BrokerError::validation("Acknowledgement JSON is incomplete"));
    };
    broker.acknowledge(&request.endpoint, &id)?;
    Ok(Json(Success::ok()))
}

async fn list_topics(State(broker): Shared, body: Bytes) -> ApiResult<TopicsResponse> {
    let query: TopicsQuery = parse_optional(&body)?;
    let topics = match query.endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => broker.topics_for(endpoint)?,
        _ => broker.list_topics()?,
    };
    Ok(Json(TopicsResponse { topics }))
}

async fn create_topic(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: TopicRequest = parse_required(&body)?;
    broker.create_topic(&request.topic)?;
    Ok(Json(Success::ok()))
}

async fn delete_topic(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: TopicRequest = parse_required(&body)?;
    broker.delete_topic(&request.topic)?;
    Ok(Json(Success::ok()))
}

async fn list_subscribers(State(broker): Shared) -> ApiResult<SubscribersResponse> {
    let subscribers = broker.list_subscribers()?;
    Ok(Json(SubscribersResponse { subscribers }))
}

async fn add_subscriber(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: SubscriberRequest = parse_required(&body)?;
    broker.add_subscriber(&request.endpoint)?;
    Ok(Json(Success::ok()))
}

async fn remove_subscriber(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: SubscriberRequest = parse_required(&body)?;
    broker.remove_subscriber(&request.endpoint)?;
    Ok(Json(Success::ok()))
}

async fn subscribe(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: SubscriptionRequest = parse_required(&body)?;
    broker.subscribe(&request.endpoint, &request.topic)?;
    Ok(Json(Success::ok()))
}

async fn unsubscribe(State(broker): Shared, body: Bytes) -> ApiResult<Success> {
    let request: SubscriptionRequest = parse_required(&body)?;
    broker.unsubscribe(&request.endpoint, &request.topic)?;
    Ok(Json(Success::ok()))
}

async fn generate(State(broker): Shared) -> ApiResult<IdResponse> {
    Ok(Json(IdResponse {
        id: broker.generate_id(),
    }))
}
