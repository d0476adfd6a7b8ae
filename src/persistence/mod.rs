//! The `persistence` module stores broker entities durably.
//!
//! It is layered: `sled_store` wraps the embedded `sled` database and its
//! fixed buckets, `cache` holds one in-process map per entity kind, and
//! `repository` combines the two into write-through reads and atomic
//! multi-entity commits.

pub mod cache;
pub mod repository;
pub mod sled_store;

use thiserror::Error;

pub use cache::EntityCache;
pub use repository::{Repository, UnitOfWork};
pub use sled_store::{Bucket, Store, WriteOp};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("corrupt record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transaction failed: {0}")]
    Transaction(String),
}
