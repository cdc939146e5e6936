//! Queues
//!
//! A `Queue` is an ordered buffer of message references. Entries are kept in
//! a `BTreeMap` keyed by (priority descending, class, sequence):
//!
//! - higher priorities come first;
//! - within a priority band, requeued entries (class 0) sit ahead of fresh
//!   ones (class 1);
//! - the sequence number keeps FIFO order inside a class, so a redelivery
//!   lands behind earlier redeliveries of the same priority.
//!
//! The queue is plain data. The engine serializes access to it with one
//! mutex per queue, together with its `DeliveryManager`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::events::{BrokerEvent, DeadLetter, Effects, Released};
use crate::broker::message::{DeadLetterReason, Message, MessageId};
use crate::broker::router::DEFAULT_EXCHANGE;
use crate::utils::{BrokerError, BrokerResult};

pub const DEFAULT_MAX_PRIORITY: u8 = u8::MAX;

/// Where dead-lettered messages are republished.
///
/// `routing_key: None` keeps the routing key the message was published with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterTarget {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl DeadLetterTarget {
    /// Deliver straight to a queue through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: Some(name.into()),
        }
    }

    pub fn exchange(name: impl Into<String>) -> Self {
        Self {
            exchange: name.into(),
            routing_key: None,
        }
    }
}

/// What happens when an enqueue would exceed `max_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest lowest-priority entry.
    #[default]
    DropHead,
    /// Refuse the new message; publish fails with `QUEUE_FULL`.
    RejectPublish,
}

fn default_max_priority() -> u8 {
    DEFAULT_MAX_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterTarget>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: false,
            auto_delete: false,
            max_length: None,
            message_ttl_ms: None,
            dead_letter: None,
            overflow: OverflowPolicy::DropHead,
            max_priority: DEFAULT_MAX_PRIORITY,
        }
    }
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn dead_letter(mut self, target: DeadLetterTarget) -> Self {
        self.dead_letter = Some(target);
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = max;
        self
    }
}

/// A message reference waiting in (or delivered from) a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Arc<Message>,
    pub enqueued_at: i64,
    pub expires_at: Option<i64>,
    pub redelivery_count: u32,
}

impl QueuedMessage {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    priority: Reverse<u8>,
    class: u8,
    seq: u64,
}

const CLASS_REQUEUED: u8 = 0;
const CLASS_FRESH: u8 = 1;

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    entries: BTreeMap<SlotKey, QueuedMessage>,
    index: HashMap<MessageId, SlotKey>,
    next_seq: u64,
}

impl Queue {
    pub fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Add a freshly routed message.
    ///
    /// Returns the entries evicted to respect `max_length`. Under the
    /// reject-publish policy a full queue refuses the message instead.
    pub fn enqueue(
        &mut self,
        message: Arc<Message>,
        now: i64,
    ) -> BrokerResult<Vec<QueuedMessage>> {
        if let Some(max) = self.options.max_length {
            if self.options.overflow == OverflowPolicy::RejectPublish && self.len() >= max {
                return Err(BrokerError::QueueFull {
                    queue: self.name.clone(),
                });
            }
        }

        let expires_at = self.expiry_for(&message, now);
        let entry = QueuedMessage {
            message,
            enqueued_at: now,
            expires_at,
            redelivery_count: 0,
        };
        self.insert(entry, CLASS_FRESH);

        let mut evicted = Vec::new();
        if let Some(max) = self.options.max_length {
            while self.len() > max {
                match self.evict_one() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        Ok(evicted)
    }

    /// Put a previously delivered entry back ahead of fresh messages of the
    /// same priority.
    pub fn requeue(&mut self, entry: QueuedMessage) {
        self.insert(entry, CLASS_REQUEUED);
    }

    /// Re-insert an entry loaded from the journal, keeping its history.
    pub fn restore(&mut self, entry: QueuedMessage) {
        let class = if entry.redelivery_count > 0 {
            CLASS_REQUEUED
        } else {
            CLASS_FRESH
        };
        self.insert(entry, class);
    }

    /// Pop the head entry. Expired entries met on the way are moved to
    /// `expired`.
    pub fn dequeue(
        &mut self,
        now: i64,
        expired: &mut Vec<QueuedMessage>,
    ) -> Option<QueuedMessage> {
        while let Some((_, entry)) = self.entries.pop_first() {
            self.index.remove(&entry.message.id);
            if entry.is_expired(now) {
                expired.push(entry);
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// The entry the next `dequeue` would return.
    pub fn peek(&self, now: i64) -> Option<&QueuedMessage> {
        self.entries.values().find(|e| !e.is_expired(now))
    }

    pub fn get(&self, id: &MessageId) -> Option<&QueuedMessage> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<QueuedMessage> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    /// Remove every expired entry, wherever it sits.
    pub fn take_expired(&mut self, now: i64) -> Vec<QueuedMessage> {
        let keys: Vec<SlotKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();

        let mut expired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.index.remove(&entry.message.id);
                expired.push(entry);
            }
        }
        expired
    }

    pub fn purge(&mut self) -> Vec<QueuedMessage> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Record that this queue gave up `entry` for `reason`, routing it to the
    /// dead-letter target when one is configured.
    pub(crate) fn discard(
        &self,
        entry: QueuedMessage,
        reason: DeadLetterReason,
        effects: &mut Effects,
    ) {
        let dead_lettered = self.options.dead_letter.is_some();
        effects.events.push(BrokerEvent::Discarded {
            queue: self.name.clone(),
            message_id: entry.message.id,
            reason,
            dead_lettered,
        });
        if let Some(target) = &self.options.dead_letter {
            effects.dead_letters.push(DeadLetter {
                message: entry.message.clone(),
                queue: self.name.clone(),
                reason,
                target: target.clone(),
            });
        }
        effects.released.push(Released {
            queue: self.name.clone(),
            message: entry.message,
        });
    }

    fn expiry_for(&self, message: &Message, now: i64) -> Option<i64> {
        let ttl = match (message.ttl_ms, self.options.message_ttl_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some(now.saturating_add(ttl as i64))
    }

    fn insert(&mut self, entry: QueuedMessage, class: u8) {
        let key = SlotKey {
            priority: Reverse(entry.message.priority.min(self.options.max_priority)),
            class,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(entry.message.id, key);
        self.entries.insert(key, entry);
    }

    /// Oldest entry of the lowest priority band present.
    fn evict_one(&mut self) -> Option<QueuedMessage> {
        let lowest = self.entries.last_key_value()?.0.priority;
        let start = SlotKey {
            priority: lowest,
            class: CLASS_REQUEUED,
            seq: 0,
        };
        let key = *self.entries.range(start..).next()?.0;
        let entry = self.entries.remove(&key)?;
        self.index.remove(&entry.message.id);
        Some(entry)
    }
}
