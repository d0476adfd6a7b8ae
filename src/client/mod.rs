//! The `client` module is the broker's side of push delivery.
//!
//! It defines the [`PushTransport`] seam the delivery pipeline sends through
//! and [`HttpPushClient`], which POSTs each message as JSON to the
//! subscriber's endpoint.

pub mod push_client;
pub use push_client::{DeliveryError, HttpPushClient, PushTransport};

#[cfg(test)]
pub(crate) mod recording;
