//! # RelayMQ
//!
//! `relaymq` is a single-node publish/subscribe broker with local
//! persistence. Publishers post messages to named topics over HTTP;
//! subscribers either receive them by push (the broker POSTs to their
//! endpoint until they acknowledge) or fetch them by pull. Every message is
//! tracked until each subscriber it was fanned out to has acknowledged it,
//! or until it expires or is evicted.
//!
//! ## Core Modules
//!
//! - `broker`: The message lifecycle engine: publish, delivery, acknowledgement and purge.
//! - `client`: The push client used to reach subscriber endpoints.
//! - `config`: Handles loading and layering of server configuration.
//! - `persistence`: A sled-backed store with a write-through entity cache and atomic multi-key commits.
//! - `transport`: The JSON-over-HTTP API.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
