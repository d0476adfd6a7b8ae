//! Persistence layer backed by `sled`
//!
//! The broker keeps its entities in four fixed buckets, each a `sled` tree:
//! messages (keyed by message id), channels (keyed by topic), subscribers
//! (keyed by endpoint) and program state (a single counters record).
//!
//! Single-key reads and writes go straight to the tree. Multi-key updates are
//! expressed as a list of [`WriteOp`]s and applied with [`Store::apply`] in one
//! `sled` transaction spanning all four buckets, so a crash can never leave a
//! channel pointing at a message that was deleted in the same operation.
//!
//! Every topic additionally gets its own `topic:<name>` tree when it is
//! created. Nothing is written there yet; it is dropped with the topic.

use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use tracing::debug;

use super::StoreError;

const TOPIC_BUCKET_PREFIX: &str = "topic:";

/// The fixed buckets of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Messages,
    Channels,
    Subscribers,
    Program,
}

impl Bucket {
    pub fn name(self) -> &'static str {
        match self {
            Bucket::Messages => "messages",
            Bucket::Channels => "channels",
            Bucket::Subscribers => "subscribers",
            Bucket::Program => "program",
        }
    }
}

/// One mutation inside a multi-key commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        bucket: Bucket,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        bucket: Bucket,
        key: String,
    },
}

impl WriteOp {
    pub fn bucket(&self) -> Bucket {
        match self {
            WriteOp::Put { bucket, .. } | WriteOp::Delete { bucket, .. } => *bucket,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    messages: Tree,
    channels: Tree,
    subscribers: Tree,
    program: Tree,
}

impl Store {
    /// Open or create a sled database at `path` and make sure every bucket exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// An in-memory store that disappears when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree(Bucket::Messages.name())?,
            channels: db.open_tree(Bucket::Channels.name())?,
            subscribers: db.open_tree(Bucket::Subscribers.name())?,
            program: db.open_tree(Bucket::Program.name())?,
            db,
        })
    }

    fn tree(&self, bucket: Bucket) -> &Tree {
        match bucket {
            Bucket::Messages => &self.messages,
            Bucket::Channels => &self.channels,
            Bucket::Subscribers => &self.subscribers,
            Bucket::Program => &self.program,
        }
    }

    pub fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree(bucket).get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put(&self, bucket: Bucket, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.tree(bucket).insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError> {
        self.tree(bucket).remove(key.as_bytes())?;
        Ok(())
    }

    /// All values of a bucket in key order.
    pub fn values(&self, bucket: Bucket) -> Result<Vec<Vec<u8>>, StoreError> {
        self.tree(bucket)
            .iter()
            .values()
            .map(|res| res.map(|v| v.to_vec()).map_err(StoreError::from))
            .collect()
    }

    pub fn len(&self, bucket: Bucket) -> usize {
        self.tree(bucket).len()
    }

    /// Apply every op atomically. Later ops on the same key win.
    pub fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let result: TransactionResult<()> =
            (&self.messages, &self.channels, &self.subscribers, &self.program).transaction(
                |(messages, channels, subscribers, program)| {
                    for op in ops {
                        let tree = match op.bucket() {
                            Bucket::Messages => messages,
                            Bucket::Channels => channels,
                            Bucket::Subscribers => subscribers,
                            Bucket::Program => program,
                        };
                        match op {
                            WriteOp::Put { key, value, .. } => {
                                tree.insert(key.as_bytes(), value.as_slice())?;
                            }
                            WriteOp::Delete { key, .. } => {
                                tree.remove(key.as_bytes())?;
                            }
                        }
                    }
                    Ok::<(), ConflictableTransactionError<()>>(())
                },
            );

        result.map_err(|err| match err {
            TransactionError::Abort(()) => StoreError::Transaction("transaction aborted".into()),
            TransactionError::Storage(e) => StoreError::Sled(e),
        })?;

        debug!(ops = ops.len(), "committed multi-key transaction");
        Ok(())
    }

    pub fn create_topic_bucket(&self, topic: &str) -> Result<(), StoreError> {
        self.db.open_tree(topic_bucket_name(topic))?;
        Ok(())
    }

    pub fn drop_topic_bucket(&self, topic: &str) -> Result<bool, StoreError> {
        Ok(self.db.drop_tree(topic_bucket_name(topic))?)
    }

    pub fn has_topic_bucket(&self, topic: &str) -> bool {
        let name = topic_bucket_name(topic);
        self.db
            .tree_names()
            .iter()
            .any(|existing| &existing[..] == name.as_bytes())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn topic_bucket_name(topic: &str) -> String {
    format!("{TOPIC_BUCKET_PREFIX}{topic}")
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("db", &"sled::Db").finish()
    }
}
