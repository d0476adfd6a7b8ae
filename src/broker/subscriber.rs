use serde::{Deserialize, Serialize};

use crate::broker::message::MessageId;

/// A registered delivery endpoint.
///
/// `message_queue` holds the ids this subscriber still owes an
/// acknowledgement for; every one of them must name the endpoint in its
/// pending-ack set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub endpoint: String,
    #[serde(rename = "subscribedTopics", default)]
    pub subscribed_topics: Vec<String>,
    #[serde(rename = "messageQueue", default)]
    pub message_queue: Vec<MessageId>,
}

impl Subscriber {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn is_subscribed_to(&self, topic: &str) -> bool {
        self.subscribed_topics.iter().any(|t| t == topic)
    }

    pub fn add_topic(&mut self, topic: &str) {
        if !self.is_subscribed_to(topic) {
            self.subscribed_topics.push(topic.to_string());
        }
    }

    pub fn remove_topic(&mut self, topic: &str) -> bool {
        super::remove_item(&mut self.subscribed_topics, topic)
    }

    pub fn enqueue(&mut self, id: MessageId) {
        self.message_queue.push(id);
    }

    pub fn dequeue(&mut self, id: &MessageId) -> bool {
        super::remove_item(&mut self.message_queue, id)
    }
}
