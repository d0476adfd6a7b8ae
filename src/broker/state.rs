use serde::{Deserialize, Serialize};

/// Process-wide counters, persisted after every state-changing operation so
/// a restart resumes with the same numbers instead of rescanning the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(rename = "topicCount")]
    pub topic_count: usize,
    #[serde(rename = "subCount")]
    pub subscriber_count: usize,
    #[serde(rename = "messageCount")]
    pub message_count: usize,
}
