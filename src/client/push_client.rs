use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::broker::message::MessageView;

/// A failed delivery to a single endpoint. The push loop logs it and moves on.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("could not build push client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} responded with {status}")]
    Status { endpoint: String, status: StatusCode },
    #[error("{endpoint} refused the message")]
    Refused { endpoint: String },
}

/// Sends one message to one subscriber endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, endpoint: &str, message: &MessageView) -> Result<(), DeliveryError>;
}

/// Push transport that POSTs the message view as JSON.
///
/// The response body is ignored: receipt is confirmed through `/ack`, not
/// through the push response.
#[derive(Debug, Clone)]
pub struct HttpPushClient {
    client: reqwest::Client,
}

impl HttpPushClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushTransport for HttpPushClient {
    async fn deliver(&self, endpoint: &str, message: &MessageView) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(endpoint)
            .json(message)
            .send()
            .await
            .map_err(|source| DeliveryError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        debug!(endpoint, message_id = %message.id, "message posted to subscriber");
        Ok(())
    }
}
