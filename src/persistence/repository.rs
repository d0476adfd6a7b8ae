//! Cache-backed repository for broker entities.
//!
//! Reads probe the entity cache first and fall back to the store on a miss,
//! populating the cache with what they find. A record that does not exist is
//! reported as `Ok(None)`; a record that exists but cannot be decoded is an
//! error, never an empty entity.
//!
//! Writes go through a [`UnitOfWork`]: entities are staged in memory, read
//! back through the staging area by later steps of the same operation, and
//! committed in one store transaction. The cache is updated only after the
//! transaction succeeds (write-through).

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::StoreError;
use super::cache::EntityCache;
use super::sled_store::{Bucket, Store, WriteOp};
use crate::broker::message::{Message, MessageId};
use crate::broker::state::SystemState;
use crate::broker::subscriber::Subscriber;
use crate::broker::topic::Channel;

const SYSTEM_STATE_KEY: &str = "system_state";

#[derive(Debug)]
pub struct Repository {
    store: Store,
    messages: EntityCache<MessageId, Message>,
    channels: EntityCache<String, Channel>,
    subscribers: EntityCache<String, Subscriber>,
}

impl Repository {
    pub fn new(store: Store, cache_capacity: Option<usize>) -> Self {
        Self {
            store,
            messages: EntityCache::new(cache_capacity),
            channels: EntityCache::new(cache_capacity),
            subscribers: EntityCache::new(cache_capacity),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fetch_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        fetch(&self.store, &self.messages, Bucket::Messages, id, &id.to_string())
    }

    pub fn fetch_channel(&self, topic: &str) -> Result<Option<Channel>, StoreError> {
        fetch(&self.store, &self.channels, Bucket::Channels, &topic.to_string(), topic)
    }

    pub fn fetch_subscriber(&self, endpoint: &str) -> Result<Option<Subscriber>, StoreError> {
        fetch(
            &self.store,
            &self.subscribers,
            Bucket::Subscribers,
            &endpoint.to_string(),
            endpoint,
        )
    }

    /// Counters as last persisted, or zeroes on a fresh database.
    pub fn fetch_state(&self) -> Result<SystemState, StoreError> {
        match self.store.get(Bucket::Program, SYSTEM_STATE_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(SystemState::default()),
        }
    }

    /// Every channel in the store, in topic order. Bypasses the cache.
    pub fn all_channels(&self) -> Result<Vec<Channel>, StoreError> {
        decode_all(&self.store, Bucket::Channels)
    }

    /// Every subscriber in the store, in endpoint order. Bypasses the cache.
    pub fn all_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        decode_all(&self.store, Bucket::Subscribers)
    }

    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            repo: self,
            messages: HashMap::new(),
            channels: HashMap::new(),
            subscribers: HashMap::new(),
            state: None,
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    #[cfg(test)]
    pub(crate) fn is_cached_message(&self, id: &MessageId) -> bool {
        self.messages.contains(id)
    }
}

fn fetch<K, V>(
    store: &Store,
    cache: &EntityCache<K, V>,
    bucket: Bucket,
    key: &K,
    raw_key: &str,
) -> Result<Option<V>, StoreError>
where
    K: Eq + Hash + Clone,
    V: Clone + DeserializeOwned,
{
    if let Some(hit) = cache.get(key) {
        return Ok(Some(hit));
    }

    let Some(bytes) = store.get(bucket, raw_key)? else {
        return Ok(None);
    };
    let value: V = serde_json::from_slice(&bytes)?;
    cache.fill(key.clone(), value.clone());
    Ok(Some(value))
}

fn decode_all<V: DeserializeOwned>(store: &Store, bucket: Bucket) -> Result<Vec<V>, StoreError> {
    store
        .values(bucket)?
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
        .collect()
}

fn put_op<V: Serialize>(bucket: Bucket, key: String, value: &V) -> Result<WriteOp, StoreError> {
    Ok(WriteOp::Put {
        bucket,
        key,
        value: serde_json::to_vec(value)?,
    })
}

/// Staged changes of one broker operation.
///
/// `None` in a staging map marks a deletion. Dropping a unit of work without
/// calling [`UnitOfWork::commit`] discards every staged change.
pub struct UnitOfWork<'a> {
    repo: &'a Repository,
    messages: HashMap<MessageId, Option<Message>>,
    channels: HashMap<String, Option<Channel>>,
    subscribers: HashMap<String, Option<Subscriber>>,
    state: Option<SystemState>,
}

impl UnitOfWork<'_> {
    pub fn message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        match self.messages.get(id) {
            Some(staged) => Ok(staged.clone()),
            None => self.repo.fetch_message(id),
        }
    }

    pub fn channel(&self, topic: &str) -> Result<Option<Channel>, StoreError> {
        match self.channels.get(topic) {
            Some(staged) => Ok(staged.clone()),
            None => self.repo.fetch_channel(topic),
        }
    }

    pub fn subscriber(&self, endpoint: &str) -> Result<Option<Subscriber>, StoreError> {
        match self.subscribers.get(endpoint) {
            Some(staged) => Ok(staged.clone()),
            None => self.repo.fetch_subscriber(endpoint),
        }
    }

    /// Every channel, with staged changes applied over the stored ones.
    pub fn channels(&self) -> Result<Vec<Channel>, StoreError> {
        let mut merged: Vec<Channel> = Vec::new();
        for stored in self.repo.all_channels()? {
            match self.channels.get(&stored.topic) {
                Some(Some(staged)) => merged.push(staged.clone()),
                Some(None) => {}
                None => merged.push(stored),
            }
        }
        for (topic, staged) in &self.channels {
            if let Some(channel) = staged {
                if !merged.iter().any(|c| &c.topic == topic) {
                    merged.push(channel.clone());
                }
            }
        }
        Ok(merged)
    }

    pub fn put_message(&mut self, message: Message) {
        self.messages.insert(message.id, Some(message));
    }

    pub fn delete_message(&mut self, id: MessageId) {
        self.messages.insert(id, None);
    }

    pub fn put_channel(&mut self, channel: Channel) {
        self.channels.insert(channel.topic.clone(), Some(channel));
    }

    pub fn delete_channel(&mut self, topic: &str) {
        self.channels.insert(topic.to_string(), None);
    }

    pub fn put_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers
            .insert(subscriber.endpoint.clone(), Some(subscriber));
    }

    pub fn delete_subscriber(&mut self, endpoint: &str) {
        self.subscribers.insert(endpoint.to_string(), None);
    }

    pub fn put_state(&mut self, state: SystemState) {
        self.state = Some(state);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.channels.is_empty()
            && self.subscribers.is_empty()
            && self.state.is_none()
    }

    fn ops(&self) -> Result<Vec<WriteOp>, StoreError> {
        let mut ops = Vec::new();
        for (id, staged) in &self.messages {
            let key = id.to_string();
            ops.push(match staged {
                Some(message) => put_op(Bucket::Messages, key, message)?,
                None => WriteOp::Delete {
                    bucket: Bucket::Messages,
                    key,
                },
            });
        }
        for (topic, staged) in &self.channels {
            ops.push(match staged {
                Some(channel) => put_op(Bucket::Channels, topic.clone(), channel)?,
                None => WriteOp::Delete {
                    bucket: Bucket::Channels,
                    key: topic.clone(),
                },
            });
        }
        for (endpoint, staged) in &self.subscribers {
            ops.push(match staged {
                Some(subscriber) => put_op(Bucket::Subscribers, endpoint.clone(), subscriber)?,
                None => WriteOp::Delete {
                    bucket: Bucket::Subscribers,
                    key: endpoint.clone(),
                },
            });
        }
        if let Some(state) = &self.state {
            ops.push(put_op(Bucket::Program, SYSTEM_STATE_KEY.to_string(), state)?);
        }
        Ok(ops)
    }

    /// Persist every staged change in one transaction, then refresh the cache.
    pub fn commit(self) -> Result<(), StoreError> {
        if self.is_empty() {
            return Ok(());
        }

        let ops = self.ops()?;
        self.repo.store.apply(&ops)?;

        for (id, staged) in self.messages {
            match staged {
                Some(message) => self.repo.messages.insert(id, message),
                None => self.repo.messages.remove(&id),
            }
        }
        for (topic, staged) in self.channels {
            match staged {
                Some(channel) => self.repo.channels.insert(topic, channel),
                None => self.repo.channels.remove(&topic),
            }
        }
        for (endpoint, staged) in self.subscribers {
            match staged {
                Some(subscriber) => self.repo.subscribers.insert(endpoint, subscriber),
                None => self.repo.subscribers.remove(&endpoint),
            }
        }

        debug!(writes = ops.len(), "unit of work committed");
        Ok(())
    }
}
