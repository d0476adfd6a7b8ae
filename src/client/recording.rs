//! In-memory push transport for tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeliveryError, PushTransport};
use crate::broker::message::{MessageId, MessageView};

#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<(String, MessageId)>>,
    refusing: Mutex<HashSet<String>>,
    latency: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every delivery takes `latency` to complete.
    pub fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make every delivery to `endpoint` fail from now on.
    pub fn refuse(&self, endpoint: &str) {
        self.refusing.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn deliveries(&self) -> Vec<(String, MessageId)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn count_for(&self, endpoint: &str, id: &MessageId) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(ep, mid)| ep == endpoint && mid == id)
            .count()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn deliver(&self, endpoint: &str, message: &MessageView) -> Result<(), DeliveryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((endpoint.to_string(), message.id));
        if self.refusing.lock().unwrap().contains(endpoint) {
            return Err(DeliveryError::Refused {
                endpoint: endpoint.to_string(),
            });
        }
        Ok(())
    }
}
