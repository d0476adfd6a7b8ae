//! The `broker` module holds the message lifecycle engine.
//!
//! [`Broker`] owns the repository, the in-memory counters and the registry of
//! per-message background tasks. Its operations are split by pipeline:
//! `engine` (topics, subscribers, subscriptions, restart recovery), `publish`,
//! `delivery` (push loop, pull, expiry timers) and `ack` (acknowledgement and
//! purge).

pub mod ack;
pub mod delivery;
pub mod engine;
pub mod message;
pub mod publish;
pub mod state;
pub mod subscriber;
pub mod tasks;
pub mod topic;

pub use ack::AckOutcome;
pub use engine::Broker;
pub use publish::{PublishReceipt, PublishRequest};

/// Remove the first occurrence of `item`. Returns `false` if it was absent.
pub(crate) fn remove_item<T, Q>(items: &mut Vec<T>, item: &Q) -> bool
where
    T: PartialEq<Q>,
    Q: ?Sized,
{
    match items.iter().position(|existing| existing == item) {
        Some(idx) => {
            items.remove(idx);
            true
        }
        None => false,
    }
}

/// Current Unix time in seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests;
