//! Wire DTOs of the HTTP API.
//!
//! Every request field defaults when absent so that an incomplete request is
//! reported by the broker with its own reason instead of a parse failure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::message::MessageView;
use crate::broker::{PublishReceipt, PublishRequest};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PublishRequestDto {
    pub id: Option<Uuid>,
    pub topic: String,
    pub attributes: Vec<String>,
    pub data: Vec<u8>,
    #[serde(alias = "receivedTS")]
    pub timestamp: Option<i64>,
}

impl From<PublishRequestDto> for PublishRequest {
    fn from(dto: PublishRequestDto) -> Self {
        Self {
            id: dto.id,
            topic: dto.topic,
            attributes: dto.attributes,
            data: dto.data,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfirm {
    pub id: Uuid,
    pub timestamp: i64,
    pub subscribers: usize,
}

impl From<PublishReceipt> for PublishConfirm {
    fn from(receipt: PublishReceipt) -> Self {
        Self {
            id: receipt.id,
            timestamp: receipt.timestamp,
            subscribers: receipt.subscribers,
        }
    }
}

/// An empty `topics` list means every topic.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PullRequest {
    pub endpoint: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullResponse {
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AckRequest {
    pub endpoint: String,
    #[serde(rename = "messageId", alias = "id")]
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TopicRequest {
    pub topic: String,
}

/// Body of `GET /topics`; with an endpoint only its subscriptions are listed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TopicsQuery {
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicsResponse {
    pub topics: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubscriberRequest {
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribersResponse {
    #[serde(rename = "endpoints")]
    pub subscribers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionRequest {
    pub endpoint: String,
    pub topic: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Success {
    pub success: bool,
}

impl Success {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: Uuid,
}
