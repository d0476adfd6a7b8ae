//! Acknowledgement and garbage collection.
//!
//! A message is removed by one of two purges that share
//! [`Broker::purge_message`]: the conditional one when its last pending
//! acknowledgement arrives, and the unconditional one on expiry or eviction,
//! which strips it from every subscriber that still owed an ack.

use tracing::{debug, info, warn};

use crate::broker::message::{Message, MessageId};
use crate::broker::state::SystemState;
use crate::broker::{Broker, now_secs};
use crate::persistence::UnitOfWork;
use crate::utils::error::{BrokerError, BrokerResult};

/// Result of an accepted acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Subscribers that still owe an acknowledgement.
    pub remaining: usize,
    /// Whether this acknowledgement removed the message.
    pub removed: bool,
}

impl Broker {
    pub fn acknowledge(&self, endpoint: &str, id: &MessageId) -> BrokerResult<AckOutcome> {
        if endpoint.is_empty() {
            return Err(BrokerError::validation("Acknowledgement JSON is incomplete"));
        }

        let mut state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(mut subscriber) = uow.subscriber(endpoint)? else {
            return Err(BrokerError::not_found("Subscriber does not exist"));
        };
        let Some(mut message) = uow.message(id)? else {
            return Err(BrokerError::not_found("Message does not exist"));
        };

        if message.ack_window_closed(self.settings.ack_window_secs, now_secs()) {
            info!(endpoint, message_id = %id, "late acknowledgement refused");
            return Err(BrokerError::Window(
                "Acknowledgement is outside of window".into(),
            ));
        }
        if !subscriber.dequeue(id) {
            return Err(BrokerError::not_found("Subscriber cannot acknowledge message"));
        }
        if !message.remove_pending(endpoint) {
            return Err(BrokerError::not_found(
                "Message cannot be acknowledged by subscriber",
            ));
        }

        let outcome = AckOutcome {
            remaining: message.pending_acks.len(),
            removed: message.is_fully_acknowledged(),
        };
        uow.put_subscriber(subscriber);
        uow.put_message(message);

        let mut next = *state;
        if outcome.removed {
            self.purge_message(&mut uow, &mut next, id)?;
            uow.put_state(next);
        }
        uow.commit()?;
        *state = next;
        drop(state);

        if outcome.removed {
            self.tasks.cancel(id);
            info!(message_id = %id, messages = next.message_count, "message fully acknowledged");
        } else {
            debug!(endpoint, message_id = %id, remaining = outcome.remaining, "message acknowledged");
        }
        Ok(outcome)
    }

    /// Removes a message regardless of pending acknowledgements. Returns
    /// `false` if it no longer exists.
    pub fn expire_message(&self, id: &MessageId) -> BrokerResult<bool> {
        let mut state = self.lock()?;
        let mut uow = self.repo.begin();
        let mut next = *state;

        let purged = self.purge_message(&mut uow, &mut next, id)?;
        if let Some(message) = &purged {
            uow.put_state(next);
            uow.commit()?;
            *state = next;
            info!(
                message_id = %id,
                topic = %message.topic,
                unacknowledged = message.pending_acks.len(),
                "message removed"
            );
        }
        drop(state);

        self.tasks.cancel(id);
        Ok(purged.is_some())
    }

    /// Stages the removal of message `id` from its channel, from the queue of
    /// every subscriber still pending and from the store, and decrements the
    /// message counter in `state`. Returns the removed message.
    pub(crate) fn purge_message(
        &self,
        uow: &mut UnitOfWork<'_>,
        state: &mut SystemState,
        id: &MessageId,
    ) -> BrokerResult<Option<Message>> {
        let Some(message) = uow.message(id)? else {
            debug!(message_id = %id, "message does not exist in system");
            return Ok(None);
        };

        match uow.channel(&message.topic)? {
            Some(mut channel) => {
                if !channel.dequeue(id) {
                    warn!(message_id = %id, topic = %message.topic, "channel does not contain message");
                }
                uow.put_channel(channel);
            }
            None => warn!(message_id = %id, topic = %message.topic, "message channel does not exist"),
        }

        for endpoint in &message.pending_acks {
            if let Some(mut subscriber) = uow.subscriber(endpoint)? {
                subscriber.dequeue(id);
                uow.put_subscriber(subscriber);
            }
        }

        uow.delete_message(*id);
        state.message_count = state.message_count.saturating_sub(1);
        Ok(Some(message))
    }
}
