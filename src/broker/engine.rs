use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::MessageId;
use crate::broker::state::SystemState;
use crate::broker::subscriber::Subscriber;
use crate::broker::tasks::TaskRegistry;
use crate::broker::topic::Channel;
use crate::client::PushTransport;
use crate::config::BrokerSettings;
use crate::persistence::Repository;
use crate::utils::error::{BrokerError, BrokerResult};

/// The message lifecycle engine.
///
/// The broker owns the repository and the system counters. Every operation
/// that mutates entities takes the state lock, stages its writes in a unit of
/// work and commits them in one store transaction; the in-memory counters are
/// replaced only after the commit succeeds. Background delivery tasks hold a
/// weak reference and upgrade it on each activation, so dropping the last
/// `Arc<Broker>` stops them.
pub struct Broker {
    pub(crate) settings: BrokerSettings,
    pub(crate) repo: Repository,
    pub(crate) state: Mutex<SystemState>,
    pub(crate) tasks: TaskRegistry,
    pub(crate) transport: Arc<dyn PushTransport>,
    pub(crate) this: Weak<Broker>,
}

impl Broker {
    /// Creates a broker over `repo`, restoring the counters persisted by a previous run.
    pub fn open(
        settings: BrokerSettings,
        repo: Repository,
        transport: Arc<dyn PushTransport>,
    ) -> BrokerResult<Arc<Self>> {
        let state = repo.fetch_state()?;
        info!(
            topics = state.topic_count,
            subscribers = state.subscriber_count,
            messages = state.message_count,
            "system state restored"
        );

        Ok(Arc::new_cyclic(|this| Self {
            settings,
            repo,
            state: Mutex::new(state),
            tasks: TaskRegistry::new(),
            transport,
            this: this.clone(),
        }))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// A copy of the current counters.
    pub fn state(&self) -> BrokerResult<SystemState> {
        Ok(*self.lock()?)
    }

    pub(crate) fn lock(&self) -> BrokerResult<MutexGuard<'_, SystemState>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Internal("broker state lock poisoned".into()))
    }

    /// A fresh message id, as handed out by `/generate`.
    pub fn generate_id(&self) -> MessageId {
        Uuid::new_v4()
    }

    // ---------------------------------------------------------------------
    // Topics
    // ---------------------------------------------------------------------

    pub fn create_topic(&self, topic: &str) -> BrokerResult<()> {
        if topic.is_empty() {
            return Err(BrokerError::validation("Topic not provided"));
        }

        let mut state = self.lock()?;
        if let Some(max) = self.settings.max_topics {
            if state.topic_count >= max {
                info!(topic, "topic rejected: topic cap reached");
                return Err(BrokerError::capacity("Maximum number of topics reached"));
            }
        }

        let mut uow = self.repo.begin();
        if uow.channel(topic)?.is_some() {
            return Err(BrokerError::conflict("Channel already exists"));
        }

        let mut next = *state;
        next.topic_count += 1;
        uow.put_channel(Channel::new(topic));
        uow.put_state(next);
        uow.commit()?;
        *state = next;

        self.repo.store().create_topic_bucket(topic)?;
        info!(topic, topics = next.topic_count, "topic created");
        Ok(())
    }

    /// Deletes a topic, purging its outstanding messages and every subscription to it.
    pub fn delete_topic(&self, topic: &str) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(channel) = uow.channel(topic)? else {
            return Err(BrokerError::not_found("Channel does not exist"));
        };

        let mut next = *state;
        let mut purged = Vec::with_capacity(channel.message_queue.len());
        for id in &channel.message_queue {
            if self.purge_message(&mut uow, &mut next, id)?.is_some() {
                purged.push(*id);
            }
        }
        for endpoint in &channel.subscribers {
            if let Some(mut subscriber) = uow.subscriber(endpoint)? {
                subscriber.remove_topic(topic);
                uow.put_subscriber(subscriber);
            }
        }
        uow.delete_channel(topic);
        next.topic_count = next.topic_count.saturating_sub(1);
        uow.put_state(next);
        uow.commit()?;
        *state = next;

        for id in &purged {
            self.tasks.cancel(id);
        }
        self.repo.store().drop_topic_bucket(topic)?;
        info!(
            topic,
            purged = purged.len(),
            topics = next.topic_count,
            "topic deleted"
        );
        Ok(())
    }

    /// All topic names, in name order.
    pub fn list_topics(&self) -> BrokerResult<Vec<String>> {
        Ok(self
            .repo
            .all_channels()?
            .into_iter()
            .map(|channel| channel.topic)
            .collect())
    }

    /// The topics `endpoint` is subscribed to, in subscription order.
    pub fn topics_for(&self, endpoint: &str) -> BrokerResult<Vec<String>> {
        let _state = self.lock()?;
        match self.repo.fetch_subscriber(endpoint)? {
            Some(subscriber) => Ok(subscriber.subscribed_topics),
            None => Err(BrokerError::not_found("Subscriber does not exist")),
        }
    }

    // ---------------------------------------------------------------------
    // Subscribers
    // ---------------------------------------------------------------------

    pub fn add_subscriber(&self, endpoint: &str) -> BrokerResult<()> {
        if endpoint.is_empty() {
            return Err(BrokerError::validation("Endpoint not provided"));
        }

        let mut state = self.lock()?;
        if let Some(max) = self.settings.max_subscribers {
            if state.subscriber_count >= max {
                info!(endpoint, "subscriber rejected: subscriber cap reached");
                return Err(BrokerError::capacity(
                    "Maximum subscriber count already reached",
                ));
            }
        }

        let mut uow = self.repo.begin();
        if uow.subscriber(endpoint)?.is_some() {
            return Err(BrokerError::conflict("Subscriber already exists"));
        }

        let mut next = *state;
        next.subscriber_count += 1;
        uow.put_subscriber(Subscriber::new(endpoint));
        uow.put_state(next);
        uow.commit()?;
        *state = next;

        info!(
            endpoint,
            subscribers = next.subscriber_count,
            "subscriber registered"
        );
        Ok(())
    }

    /// Removes a subscriber from every channel and every pending-ack set it
    /// was in. Messages left with nobody to acknowledge them are removed.
    pub fn remove_subscriber(&self, endpoint: &str) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(subscriber) = uow.subscriber(endpoint)? else {
            return Err(BrokerError::not_found("Subscriber does not exist"));
        };

        let mut next = *state;
        for topic in &subscriber.subscribed_topics {
            if let Some(mut channel) = uow.channel(topic)? {
                channel.unsubscribe(endpoint);
                uow.put_channel(channel);
            }
        }

        let mut emptied = Vec::new();
        for id in &subscriber.message_queue {
            let Some(mut message) = uow.message(id)? else {
                warn!(endpoint, message_id = %id, "subscriber queue references a missing message");
                continue;
            };
            message.remove_pending(endpoint);
            if message.is_fully_acknowledged() {
                emptied.push(*id);
            }
            uow.put_message(message);
        }
        uow.delete_subscriber(endpoint);
        for id in &emptied {
            self.purge_message(&mut uow, &mut next, id)?;
        }

        next.subscriber_count = next.subscriber_count.saturating_sub(1);
        uow.put_state(next);
        uow.commit()?;
        *state = next;

        for id in &emptied {
            self.tasks.cancel(id);
        }
        info!(
            endpoint,
            released = emptied.len(),
            subscribers = next.subscriber_count,
            "subscriber removed"
        );
        Ok(())
    }

    /// All subscriber endpoints, in endpoint order.
    pub fn list_subscribers(&self) -> BrokerResult<Vec<String>> {
        Ok(self
            .repo
            .all_subscribers()?
            .into_iter()
            .map(|subscriber| subscriber.endpoint)
            .collect())
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Subscribes `endpoint` to `topic`. Only messages published afterwards are owed to it.
    pub fn subscribe(&self, endpoint: &str, topic: &str) -> BrokerResult<()> {
        if endpoint.is_empty() || topic.is_empty() {
            return Err(BrokerError::validation("Subscription description incomplete"));
        }

        let _state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(mut subscriber) = uow.subscriber(endpoint)? else {
            return Err(BrokerError::not_found("Subscriber does not exist"));
        };
        if let Some(max) = self.settings.max_topics_per_subscriber {
            if subscriber.subscribed_topics.len() >= max {
                return Err(BrokerError::capacity(
                    "Subscriber already subscribed to maximum number of topics",
                ));
            }
        }

        let Some(mut channel) = uow.channel(topic)? else {
            return Err(BrokerError::not_found("Topic channel does not exist"));
        };
        if let Some(max) = self.settings.max_subscribers_per_topic {
            if channel.subscribers.len() >= max {
                return Err(BrokerError::capacity(
                    "Topic already has maximum number of subscribers",
                ));
            }
        }
        if channel.has_subscriber(endpoint) || subscriber.is_subscribed_to(topic) {
            return Err(BrokerError::conflict("Subscription already exists"));
        }

        channel.subscribe(endpoint.to_string());
        subscriber.add_topic(topic);
        uow.put_channel(channel);
        uow.put_subscriber(subscriber);
        uow.commit()?;

        info!(endpoint, topic, "subscription created");
        Ok(())
    }

    /// Ends a subscription. Messages already owed to the subscriber stay owed.
    pub fn unsubscribe(&self, endpoint: &str, topic: &str) -> BrokerResult<()> {
        if endpoint.is_empty() || topic.is_empty() {
            return Err(BrokerError::validation("Subscription description incomplete"));
        }

        let _state = self.lock()?;
        let mut uow = self.repo.begin();
        let Some(mut subscriber) = uow.subscriber(endpoint)? else {
            return Err(BrokerError::not_found("Subscriber does not exist"));
        };
        let Some(mut channel) = uow.channel(topic)? else {
            return Err(BrokerError::not_found("Topic channel does not exist"));
        };

        let was_subscribed = subscriber.remove_topic(topic);
        let was_listed = channel.unsubscribe(endpoint);
        if !was_subscribed && !was_listed {
            return Err(BrokerError::not_found("Subscription does not exist"));
        }

        uow.put_channel(channel);
        uow.put_subscriber(subscriber);
        uow.commit()?;

        info!(endpoint, topic, "subscription removed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Re-arms delivery for every message still outstanding in a channel
    /// queue, e.g. after a restart. Returns how many tasks were scheduled.
    pub fn resume(&self) -> BrokerResult<usize> {
        let state = self.lock()?;
        let mut outstanding = Vec::new();
        for channel in self.repo.all_channels()? {
            for id in &channel.message_queue {
                match self.repo.fetch_message(id)? {
                    Some(message) => outstanding.push(message),
                    None => {
                        warn!(topic = %channel.topic, message_id = %id, "channel queue references a missing message");
                    }
                }
            }
        }
        drop(state);

        for message in &outstanding {
            self.schedule_delivery(message);
        }
        let scheduled = outstanding.len();
        debug!(scheduled, "outstanding messages re-armed");
        Ok(scheduled)
    }

    /// Stops every background task and flushes the store.
    pub fn shutdown(&self) -> BrokerResult<()> {
        self.tasks.shutdown();
        self.repo.flush()?;
        info!("broker shut down");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    #[cfg(test)]
    pub(crate) fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("settings", &self.settings)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
