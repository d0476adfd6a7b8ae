//! Registry of per-message background tasks.
//!
//! Each outstanding message owns at most one task: a push-retry loop in push
//! mode or an expiry timer in pull mode. Any path that removes a message
//! cancels its task through the registry.

use std::future::Future;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::broker::message::MessageId;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    handles: DashMap<MessageId, AbortHandle>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` for message `id`, aborting any task it replaces.
    ///
    /// The entry stays locked until the handle is stored, so a task that
    /// finishes immediately cannot release itself before it is registered.
    pub fn spawn<F>(&self, id: MessageId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.handles.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.get().abort();
                entry.insert(tokio::spawn(task).abort_handle());
            }
            Entry::Vacant(entry) => {
                entry.insert(tokio::spawn(task).abort_handle());
            }
        }
    }

    /// Forget the task for `id` without aborting it. Called by a task that is
    /// about to finish on its own.
    pub fn release(&self, id: &MessageId) {
        self.handles.remove(id);
    }

    /// Abort the task for `id`, if any.
    pub fn cancel(&self, id: &MessageId) -> bool {
        match self.handles.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(message_id = %id, "cancelled delivery task");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every registered task.
    pub fn shutdown(&self) {
        self.handles.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
