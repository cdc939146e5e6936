//! Journal backed by `sled`
//!
//! Layout, one tree per concern:
//!
//! - `meta.exchanges`: exchange name -> `ExchangeRecord`
//! - `meta.queues`: queue name -> `QueueRecord`
//! - `meta.bindings`: encoded `BindingRecord` -> same record
//! - `messages`: message id -> `Message`
//! - `queue.<name>`: message id -> `EntryRecord`, one tree per durable queue
//!
//! Values are JSON. Entry sequence numbers come from `Db::generate_id`, so a
//! queue's entries sort back into enqueue order on recovery.

use std::collections::HashSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use crate::broker::exchange::{BindingArguments, ExchangeKind, ExchangeOptions};
use crate::broker::message::{Message, MessageId};
use crate::broker::queue::{QueueOptions, QueuedMessage};

const EXCHANGES: &str = "meta.exchanges";
const QUEUES: &str = "meta.queues";
const BINDINGS: &str = "meta.bindings";
const MESSAGES: &str = "messages";
const QUEUE_PREFIX: &str = "queue.";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub name: String,
    pub options: QueueOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BindingRecord {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub arguments: BindingArguments,
}

/// A persistent message waiting in a durable queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub message_id: MessageId,
    pub seq: u64,
    pub enqueued_at: i64,
    pub expires_at: Option<i64>,
    pub redelivery_count: u32,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn save_exchange(&self, record: &ExchangeRecord) -> PersistenceResult<()> {
        let tree = self.db.open_tree(EXCHANGES)?;
        tree.insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Forget an exchange together with its bindings.
    pub fn remove_exchange(&self, name: &str) -> PersistenceResult<()> {
        self.db.open_tree(EXCHANGES)?.remove(name.as_bytes())?;
        self.remove_bindings_where(|b| b.exchange == name)
    }

    pub fn load_exchanges(&self) -> PersistenceResult<Vec<ExchangeRecord>> {
        decode_all(&self.db.open_tree(EXCHANGES)?)
    }

    pub fn save_queue(&self, record: &QueueRecord) -> PersistenceResult<()> {
        let tree = self.db.open_tree(QUEUES)?;
        tree.insert(record.name.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Forget a queue, its entries and its bindings. Message records are
    /// left to `prune_messages`.
    pub fn remove_queue(&self, name: &str) -> PersistenceResult<()> {
        self.db.open_tree(QUEUES)?.remove(name.as_bytes())?;
        self.db.drop_tree(queue_tree_name(name))?;
        self.remove_bindings_where(|b| b.queue == name)
    }

    pub fn load_queues(&self) -> PersistenceResult<Vec<QueueRecord>> {
        decode_all(&self.db.open_tree(QUEUES)?)
    }

    pub fn save_binding(&self, record: &BindingRecord) -> PersistenceResult<()> {
        let key = serde_json::to_vec(record)?;
        self.db.open_tree(BINDINGS)?.insert(key.clone(), key)?;
        Ok(())
    }

    pub fn remove_binding(&self, record: &BindingRecord) -> PersistenceResult<()> {
        let key = serde_json::to_vec(record)?;
        self.db.open_tree(BINDINGS)?.remove(key)?;
        Ok(())
    }

    pub fn load_bindings(&self) -> PersistenceResult<Vec<BindingRecord>> {
        decode_all(&self.db.open_tree(BINDINGS)?)
    }

    pub fn save_message(&self, message: &Message) -> PersistenceResult<()> {
        let tree = self.db.open_tree(MESSAGES)?;
        tree.insert(message.id.as_bytes(), serde_json::to_vec(message)?)?;
        Ok(())
    }

    pub fn remove_message(&self, id: &MessageId) -> PersistenceResult<()> {
        self.db.open_tree(MESSAGES)?.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn load_message(&self, id: &MessageId) -> PersistenceResult<Option<Message>> {
        match self.db.open_tree(MESSAGES)?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn message_count(&self) -> PersistenceResult<usize> {
        Ok(self.db.open_tree(MESSAGES)?.len())
    }

    /// Delete every message record whose id is not in `keep`.
    pub fn prune_messages(&self, keep: &HashSet<MessageId>) -> PersistenceResult<usize> {
        let tree = self.db.open_tree(MESSAGES)?;
        let mut stale = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            let message: Message = serde_json::from_slice(&value)?;
            if !keep.contains(&message.id) {
                stale.push(key);
            }
        }
        for key in &stale {
            tree.remove(key)?;
        }
        Ok(stale.len())
    }

    /// Record that `entry` now waits in the durable queue `queue`.
    pub fn save_entry(&self, queue: &str, entry: &QueuedMessage) -> PersistenceResult<()> {
        let record = EntryRecord {
            message_id: entry.message.id,
            seq: self.db.generate_id()?,
            enqueued_at: entry.enqueued_at,
            expires_at: entry.expires_at,
            redelivery_count: entry.redelivery_count,
        };
        let tree = self.db.open_tree(queue_tree_name(queue))?;
        tree.insert(record.message_id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    pub fn update_redelivery(
        &self,
        queue: &str,
        id: &MessageId,
        redelivery_count: u32,
    ) -> PersistenceResult<()> {
        let tree = self.db.open_tree(queue_tree_name(queue))?;
        let Some(bytes) = tree.get(id.as_bytes())? else {
            return Ok(());
        };
        let mut record: EntryRecord = serde_json::from_slice(&bytes)?;
        record.redelivery_count = redelivery_count;
        tree.insert(id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    pub fn remove_entry(&self, queue: &str, id: &MessageId) -> PersistenceResult<()> {
        self.db
            .open_tree(queue_tree_name(queue))?
            .remove(id.as_bytes())?;
        Ok(())
    }

    /// Entries of `queue` in the order they were enqueued.
    pub fn load_entries(&self, queue: &str) -> PersistenceResult<Vec<EntryRecord>> {
        let tree = self.db.open_tree(queue_tree_name(queue))?;
        let mut entries: Vec<EntryRecord> = decode_all(&tree)?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    pub fn flush(&self) -> PersistenceResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn remove_bindings_where(
        &self,
        pred: impl Fn(&BindingRecord) -> bool,
    ) -> PersistenceResult<()> {
        let tree = self.db.open_tree(BINDINGS)?;
        for item in tree.iter() {
            let (key, value) = item?;
            let record: BindingRecord = serde_json::from_slice(&value)?;
            if pred(&record) {
                tree.remove(key)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}

fn queue_tree_name(queue: &str) -> String {
    format!("{QUEUE_PREFIX}{queue}")
}

fn decode_all<T: DeserializeOwned>(tree: &Tree) -> PersistenceResult<Vec<T>> {
    tree.iter()
        .values()
        .map(|value| Ok(serde_json::from_slice(&value?)?))
        .collect()
}
