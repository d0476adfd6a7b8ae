//! Channel (topic) entity
//!
//! A `Channel` holds the queue of message ids still outstanding for a topic
//! and the endpoints subscribed to it. Both collections keep insertion order;
//! duplicate subscriptions are a no-op.
//!
//! Invariant: every id in `message_queue` refers to a stored `Message` whose
//! topic is this channel's topic.

use serde::{Deserialize, Serialize};

use crate::broker::message::MessageId;

pub type SubscriberId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub topic: String,
    #[serde(rename = "messageQueue", default)]
    pub message_queue: Vec<MessageId>,
    #[serde(default)]
    pub subscribers: Vec<SubscriberId>,
}

impl Channel {
    /// Create a new channel with the given topic name.
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            message_queue: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn has_subscriber(&self, endpoint: &str) -> bool {
        self.subscribers.iter().any(|s| s == endpoint)
    }

    /// Add a subscriber to the channel. Duplicate adds are ignored.
    pub fn subscribe(&mut self, endpoint: SubscriberId) {
        if !self.has_subscriber(&endpoint) {
            self.subscribers.push(endpoint);
        }
    }

    /// Remove a subscriber from the channel. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, endpoint: &str) -> bool {
        super::remove_item(&mut self.subscribers, endpoint)
    }

    pub fn enqueue(&mut self, id: MessageId) {
        self.message_queue.push(id);
    }

    /// Remove a message id from the queue. Returns `false` if it was not queued.
    pub fn dequeue(&mut self, id: &MessageId) -> bool {
        super::remove_item(&mut self.message_queue, id)
    }
}
