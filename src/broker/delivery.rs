//! Delivery pipeline.
//!
//! In push mode every outstanding message owns a retry loop that stamps the
//! last-sent time, POSTs the message to each endpoint still owing an
//! acknowledgement and sleeps for the configured delay. The loop ends when the message is
//! gone, fully acknowledged or past its lifetime. In pull mode subscribers
//! fetch their own queue and the message owns a one-shot expiry timer
//! instead.

use std::sync::Weak;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::broker::message::{Message, MessageId, MessageView, secs};
use crate::broker::{Broker, now_secs};
use crate::config::DeliveryMode;
use crate::utils::error::{BrokerError, BrokerResult};

/// Outcome of one push activation.
#[derive(Debug)]
pub(crate) enum PushStep {
    Deliver {
        view: MessageView,
        endpoints: Vec<String>,
    },
    Finished,
}

impl Broker {
    /// Returns the messages owed to `endpoint`, optionally restricted to `topics`.
    ///
    /// Pulling does not remove anything: a message stays in the subscriber's
    /// queue until it is acknowledged. With an acknowledgement window
    /// configured, every returned message has its last-sent time stamped.
    pub fn pull(&self, endpoint: &str, topics: &[String]) -> BrokerResult<Vec<MessageView>> {
        if self.settings.delivery_mode == DeliveryMode::Push {
            return Err(BrokerError::Mode("Cannot pull. System is set to push".into()));
        }
        if endpoint.is_empty() {
            return Err(BrokerError::validation("Endpoint not provided"));
        }

        let _state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(subscriber) = uow.subscriber(endpoint)? else {
            return Err(BrokerError::not_found("Subscriber does not exist"));
        };

        let stamp = self.settings.ack_window_secs.is_some();
        let now = now_secs();
        let mut views = Vec::new();
        for id in &subscriber.message_queue {
            let Some(mut message) = uow.message(id)? else {
                warn!(endpoint, message_id = %id, "subscriber queue references a missing message");
                continue;
            };
            if !topics.is_empty() && !topics.contains(&message.topic) {
                continue;
            }
            views.push(message.view());
            if stamp {
                message.last_sent_ts = now;
                uow.put_message(message);
            }
        }
        uow.commit()?;

        debug!(endpoint, messages = views.len(), "messages pulled");
        Ok(views)
    }

    /// Starts the background task that delivers or expires `message`.
    pub(crate) fn schedule_delivery(&self, message: &Message) {
        match self.settings.delivery_mode {
            DeliveryMode::Push => {
                let delay = Duration::from_millis(self.settings.push_delay_ms);
                self.tasks
                    .spawn(message.id, push_loop(self.this.clone(), message.id, delay));
            }
            DeliveryMode::Pull => {
                let Some(lifetime) = self.settings.message_lifetime_secs else {
                    return;
                };
                let expires_at = message.received_ts.saturating_add(secs(lifetime));
                let remaining = expires_at.saturating_sub(now_secs()).max(0) as u64;
                self.tasks.spawn(
                    message.id,
                    expiry_timer(self.this.clone(), message.id, Duration::from_secs(remaining)),
                );
            }
        }
    }

    /// Decides what one push activation should do, expiring the message if
    /// its lifetime has passed. A delivery attempt is stamped before any
    /// request goes out, so the acknowledgement window is already open while
    /// the subscriber handles the push.
    pub(crate) fn begin_push(&self, id: &MessageId) -> BrokerResult<PushStep> {
        let state = self.lock()?;
        let Some(message) = self.repo.fetch_message(id)? else {
            self.tasks.release(id);
            return Ok(PushStep::Finished);
        };

        if message.has_expired(self.settings.message_lifetime_secs, now_secs()) {
            info!(message_id = %id, "message passed its lifetime");
            self.tasks.release(id);
            drop(state);
            self.expire_message(id)?;
            return Ok(PushStep::Finished);
        }
        if message.is_fully_acknowledged() {
            self.tasks.release(id);
            return Ok(PushStep::Finished);
        }

        let view = message.view();
        let endpoints = message.pending_acks.clone();
        let mut uow = self.repo.begin();
        uow.put_message(Message {
            last_sent_ts: now_secs(),
            ..message
        });
        uow.commit()?;

        Ok(PushStep::Deliver { view, endpoints })
    }

    /// POSTs `view` to every endpoint concurrently. Failures are logged only.
    pub(crate) async fn deliver_all(&self, view: &MessageView, endpoints: &[String]) {
        let attempts = endpoints
            .iter()
            .map(|endpoint| self.transport.deliver(endpoint, view));
        let results = join_all(attempts).await;

        for (endpoint, result) in endpoints.iter().zip(results) {
            match result {
                Ok(()) => debug!(endpoint, message_id = %view.id, "message pushed"),
                Err(err) => warn!(endpoint, message_id = %view.id, error = %err, "push delivery failed"),
            }
        }
    }
}

async fn push_loop(broker: Weak<Broker>, id: MessageId, delay: Duration) {
    loop {
        let Some(this) = broker.upgrade() else {
            return;
        };

        match this.begin_push(&id) {
            Ok(PushStep::Finished) => {
                debug!(message_id = %id, "push loop finished");
                return;
            }
            Ok(PushStep::Deliver { view, endpoints }) => {
                this.deliver_all(&view, &endpoints).await;
            }
            Err(err) => {
                error!(message_id = %id, error = %err, "push activation failed");
            }
        }

        drop(this);
        tokio::time::sleep(delay).await;
    }
}

async fn expiry_timer(broker: Weak<Broker>, id: MessageId, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(this) = broker.upgrade() else {
        return;
    };

    this.tasks.release(&id);
    match this.expire_message(&id) {
        Ok(true) => info!(message_id = %id, "message expired"),
        Ok(false) => debug!(message_id = %id, "expired message was already gone"),
        Err(err) => error!(message_id = %id, error = %err, "failed to expire message"),
    }
}
