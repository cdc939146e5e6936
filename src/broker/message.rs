//! Message definitions for the broker
//!
//! A `Message` is immutable once published: the broker shares it between
//! queues as `Arc<Message>` and never touches the payload again. Dead-lettering
//! produces a *new* message that reuses the same payload bytes and carries
//! `x-death-*` headers describing why it was rerouted.
//!
//! Notes on fields:
//! - `payload`: opaque body, reference counted (`bytes::Bytes`)
//! - `headers`: scalar values used by headers exchanges and by consumers
//! - `priority`: 0 (default) .. 255, clamped per queue
//! - `ttl_ms`: optional per-message time-to-live in milliseconds
//! - `timestamp`: milliseconds since UNIX epoch, set on publish
//! - `exchange` / `routing_key`: filled in by the broker on publish

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = Uuid;

pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";
pub const DEATH_EXCHANGE_HEADER: &str = "x-death-exchange";
pub const DEATH_ROUTING_KEY_HEADER: &str = "x-death-routing-key";
pub const DEATH_COUNT_HEADER: &str = "x-death-count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Why a message left its queue for the dead-letter target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    /// Nacked without requeue, or requeued past the redelivery limit.
    Rejected,
    /// TTL elapsed while the message was waiting in the queue.
    Expired,
    /// Evicted to make room under the queue's max length.
    MaxLen,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Rejected => "rejected",
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::MaxLen => "maxlen",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub headers: Headers,
    pub persistent: bool,
    pub priority: u8,
    pub ttl_ms: Option<u64>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange: String::new(),
            routing_key: String::new(),
            payload: payload.into(),
            headers: Headers::new(),
            persistent: false,
            priority: 0,
            ttl_ms: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Stamp the routing information the message was published with.
    pub(crate) fn routed(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_string();
        self.routing_key = routing_key.to_string();
        self
    }

    pub fn death_reason(&self) -> Option<&str> {
        self.headers
            .get(DEATH_REASON_HEADER)
            .and_then(HeaderValue::as_str)
    }

    pub fn death_count(&self) -> i64 {
        self.headers
            .get(DEATH_COUNT_HEADER)
            .and_then(HeaderValue::as_int)
            .unwrap_or(0)
    }

    /// Build the message that is republished to a dead-letter target.
    ///
    /// The payload is shared, the id is fresh and the per-message TTL is
    /// dropped so the copy does not expire again on arrival.
    pub(crate) fn dead_lettered(&self, queue: &str, reason: DeadLetterReason, now: i64) -> Self {
        let mut headers = self.headers.clone();
        let count = self.death_count() + 1;
        headers.insert(DEATH_REASON_HEADER.into(), reason.as_str().into());
        headers.insert(DEATH_QUEUE_HEADER.into(), queue.into());
        headers.insert(DEATH_EXCHANGE_HEADER.into(), self.exchange.clone().into());
        headers.insert(
            DEATH_ROUTING_KEY_HEADER.into(),
            self.routing_key.clone().into(),
        );
        headers.insert(DEATH_COUNT_HEADER.into(), count.into());

        Self {
            id: Uuid::new_v4(),
            exchange: String::new(),
            routing_key: String::new(),
            payload: self.payload.clone(),
            headers,
            persistent: self.persistent,
            priority: self.priority,
            ttl_ms: None,
            timestamp: now,
        }
    }
}
