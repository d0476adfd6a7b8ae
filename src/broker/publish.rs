//! Publish pipeline: validation, duplicate detection, capacity enforcement
//! and fan-out.

use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::message::{Message, MessageId};
use crate::broker::{Broker, now_secs};
use crate::config::OverflowPolicy;
use crate::persistence::UnitOfWork;
use crate::utils::error::{BrokerError, BrokerResult};

/// A message as submitted by a publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    /// Caller-chosen id. `None` or the nil UUID lets the broker assign one.
    pub id: Option<MessageId>,
    pub topic: String,
    pub attributes: Vec<String>,
    pub data: Vec<u8>,
    /// Received timestamp override, in Unix seconds. `0` counts as absent.
    pub timestamp: Option<i64>,
}

/// What the publisher is told about an admitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: MessageId,
    pub timestamp: i64,
    pub subscribers: usize,
}

impl Broker {
    /// Admits a message and fans it out to the topic's current subscribers.
    ///
    /// Every check that can reject the request runs before anything is
    /// evicted, so a rejected publish has no side effects. A topic with no
    /// subscribers accepts the message without storing it, unless the global
    /// cap is full under the reject policy.
    pub fn publish(&self, request: PublishRequest) -> BrokerResult<PublishReceipt> {
        let PublishRequest {
            id,
            topic,
            attributes,
            data,
            timestamp,
        } = request;

        if topic.is_empty() {
            return Err(BrokerError::validation("No topic for message"));
        }
        if self
            .settings
            .max_message_size
            .is_some_and(|max| data.len() > max)
        {
            info!(topic, size = data.len(), "publish rejected: payload too large");
            return Err(BrokerError::capacity("Message payload too large"));
        }
        if self
            .settings
            .max_attribute_count
            .is_some_and(|max| attributes.len() > max)
        {
            info!(topic, attributes = attributes.len(), "publish rejected: too many attributes");
            return Err(BrokerError::capacity("Message has too many attributes"));
        }

        let mut state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(channel) = uow.channel(&topic)? else {
            return Err(BrokerError::not_found("Provided topic does not exist"));
        };

        let id = match id.filter(|id| !id.is_nil()) {
            Some(id) => {
                if uow.message(&id)?.is_some() {
                    return Err(BrokerError::validation(
                        "Duplicate message. UUID already exists in system",
                    ));
                }
                id
            }
            None => Uuid::new_v4(),
        };
        let timestamp = timestamp.filter(|ts| *ts != 0).unwrap_or_else(now_secs);

        let mut pending = Vec::with_capacity(channel.subscribers.len());
        for endpoint in &channel.subscribers {
            if uow.subscriber(endpoint)?.is_some() {
                pending.push(endpoint.clone());
            }
        }
        if pending.is_empty() {
            let full = self
                .settings
                .max_messages
                .is_some_and(|max| state.message_count >= max);
            if full && self.settings.overflow_policy == OverflowPolicy::Reject {
                info!(topic, "publish rejected: message cap reached");
                return Err(BrokerError::capacity(
                    "Maximum number of messages in system reached",
                ));
            }
            info!(message_id = %id, topic, "message published to a topic without subscribers");
            return Ok(PublishReceipt {
                id,
                timestamp,
                subscribers: 0,
            });
        }

        let mut next = *state;
        let mut evicted = Vec::new();

        if let Some(max) = self.settings.max_messages {
            while next.message_count >= max {
                let candidates: Vec<MessageId> = uow
                    .channels()?
                    .into_iter()
                    .flat_map(|channel| channel.message_queue)
                    .collect();
                let victim = match self.settings.overflow_policy {
                    OverflowPolicy::Reject => None,
                    OverflowPolicy::EvictOldest => oldest_message(&uow, &candidates)?,
                };
                let Some(victim) = victim else {
                    info!(topic, "publish rejected: message cap reached");
                    return Err(BrokerError::capacity(
                        "Maximum number of messages in system reached",
                    ));
                };
                self.purge_message(&mut uow, &mut next, &victim)?;
                evicted.push(victim);
            }
        }

        if let Some(max) = self.settings.max_messages_per_topic {
            loop {
                let queued = match uow.channel(&topic)? {
                    Some(channel) => channel.message_queue,
                    None => Vec::new(),
                };
                if queued.len() < max {
                    break;
                }
                let victim = match self.settings.overflow_policy {
                    OverflowPolicy::Reject => None,
                    OverflowPolicy::EvictOldest => oldest_message(&uow, &queued)?,
                };
                let Some(victim) = victim else {
                    info!(topic, "publish rejected: topic message cap reached");
                    return Err(BrokerError::capacity(
                        "Topic already has maximum number of messages",
                    ));
                };
                self.purge_message(&mut uow, &mut next, &victim)?;
                evicted.push(victim);
            }
        }

        let message = Message {
            id,
            topic: topic.clone(),
            attributes,
            data,
            received_ts: timestamp,
            last_sent_ts: 0,
            pending_acks: pending,
        };

        for endpoint in &message.pending_acks {
            if let Some(mut subscriber) = uow.subscriber(endpoint)? {
                subscriber.enqueue(id);
                uow.put_subscriber(subscriber);
            }
        }
        if let Some(mut channel) = uow.channel(&topic)? {
            channel.enqueue(id);
            uow.put_channel(channel);
        }
        uow.put_message(message.clone());
        next.message_count += 1;
        uow.put_state(next);
        uow.commit()?;
        *state = next;
        drop(state);

        for victim in &evicted {
            self.tasks.cancel(victim);
            info!(message_id = %victim, "evicted oldest message");
        }
        self.schedule_delivery(&message);

        let subscribers = message.pending_acks.len();
        debug!(message_id = %id, topic, subscribers, messages = next.message_count, "message published");
        Ok(PublishReceipt {
            id,
            timestamp,
            subscribers,
        })
    }
}

/// The candidate with the smallest received timestamp. Ties go to the
/// earliest candidate.
fn oldest_message(
    uow: &UnitOfWork<'_>,
    candidates: &[MessageId],
) -> BrokerResult<Option<MessageId>> {
    let mut oldest: Option<(MessageId, i64)> = None;
    for id in candidates {
        let Some(message) = uow.message(id)? else {
            continue;
        };
        if oldest.is_none_or(|(_, ts)| message.received_ts < ts) {
            oldest = Some((*id, message.received_ts));
        }
    }
    Ok(oldest.map(|(id, _)| id))
}
