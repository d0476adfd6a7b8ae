use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::topic::SubscriberId;

pub type MessageId = Uuid;

/// Represents a published message in the broker.
///
/// A message lives until every subscriber it was fanned out to has
/// acknowledged it, or until it expires or is evicted. The persisted JSON
/// keeps the field names clients already see on the wire (`receivedTS`,
/// `lastSentTS`).
///
/// # Fields
///
/// - `id` - Unique identifier, assigned by the broker unless the publisher supplied one.
/// - `topic` - The channel this message was published to.
/// - `attributes` - Ordered publisher-defined attributes.
/// - `data` - Opaque payload.
/// - `received_ts` - Unix timestamp (seconds) the broker admitted the message.
/// - `last_sent_ts` - Unix timestamp (seconds) of the last delivery attempt, `0` if none.
/// - `pending_acks` - Endpoints that still owe an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(rename = "receivedTS")]
    pub received_ts: i64,
    #[serde(rename = "lastSentTS", default)]
    pub last_sent_ts: i64,
    #[serde(rename = "pendingAcks", default)]
    pub pending_acks: Vec<SubscriberId>,
}

impl Message {
    pub fn is_pending_for(&self, endpoint: &str) -> bool {
        self.pending_acks.iter().any(|e| e == endpoint)
    }

    /// Drop `endpoint` from the pending-ack set. Returns `false` if it was not pending.
    pub fn remove_pending(&mut self, endpoint: &str) -> bool {
        match self.pending_acks.iter().position(|e| e == endpoint) {
            Some(idx) => {
                self.pending_acks.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.pending_acks.is_empty()
    }

    /// Whether `lifetime_secs` has passed since the message was received.
    pub fn has_expired(&self, lifetime_secs: Option<u64>, now: i64) -> bool {
        lifetime_secs.is_some_and(|lifetime| now > self.received_ts.saturating_add(secs(lifetime)))
    }

    /// Whether an acknowledgement arriving at `now` falls outside the window.
    pub fn ack_window_closed(&self, window_secs: Option<u64>, now: i64) -> bool {
        window_secs.is_some_and(|window| now > self.last_sent_ts.saturating_add(secs(window)))
    }

    /// The subscriber-facing projection used for pull responses and push bodies.
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id,
            topic: self.topic.clone(),
            attributes: self.attributes.clone(),
            received_ts: self.received_ts,
            data: self.data.clone(),
        }
    }
}

/// A duration in seconds as a timestamp offset, saturating at `i64::MAX`.
pub(crate) fn secs(duration: u64) -> i64 {
    i64::try_from(duration).unwrap_or(i64::MAX)
}

/// What a subscriber sees of a message. Delivery bookkeeping stays internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub topic: String,
    pub attributes: Vec<String>,
    #[serde(rename = "receivedTS")]
    pub received_ts: i64,
    pub data: Vec<u8>,
}
