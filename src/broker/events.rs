//! Policy outcomes
//!
//! Eviction, expiry, dead-lettering, ack timeouts and lost connections are
//! steady-state behaviour under load, not failures. The broker reports them
//! as `BrokerEvent`s on a broadcast channel (see `Broker::subscribe_events`)
//! and in the log.
//!
//! `Effects` is the scratch list a queue operation fills while the queue lock
//! is held; the engine applies it once the lock is released.

use std::sync::Arc;

use crate::broker::delivery::{ConsumerTag, DeliveryTag};
use crate::broker::message::{DeadLetterReason, Message, MessageId};
use crate::broker::queue::DeadLetterTarget;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// A publish matched no binding and was dropped.
    Unroutable {
        exchange: String,
        routing_key: String,
        message_id: MessageId,
    },
    /// A message left its queue without being acknowledged.
    Discarded {
        queue: String,
        message_id: MessageId,
        reason: DeadLetterReason,
        dead_lettered: bool,
    },
    /// A dead-lettered copy was routed to at least one queue.
    DeadLettered {
        queue: String,
        message_id: MessageId,
        dead_letter_id: MessageId,
        reason: DeadLetterReason,
    },
    /// The dead-letter target did not route the copy anywhere.
    DeadLetterDropped {
        queue: String,
        message_id: MessageId,
        reason: DeadLetterReason,
    },
    /// A consumer held a delivery past the acknowledgment timeout.
    DeliveryTimeout {
        queue: String,
        consumer_tag: Option<ConsumerTag>,
        delivery_tag: DeliveryTag,
    },
    MaxRedeliveriesExceeded {
        queue: String,
        message_id: MessageId,
        redeliveries: u32,
    },
    ConnectionLost {
        connection: u64,
        requeued: usize,
    },
    QueueDeleted {
        queue: String,
    },
}

/// A message that must be rerouted through its queue's dead-letter target.
#[derive(Debug, Clone)]
pub(crate) struct DeadLetter {
    pub message: Arc<Message>,
    pub queue: String,
    pub reason: DeadLetterReason,
    pub target: DeadLetterTarget,
}

/// A queue dropped its reference to a message.
#[derive(Debug, Clone)]
pub(crate) struct Released {
    pub queue: String,
    pub message: Arc<Message>,
}

/// A message went back to its queue with a new redelivery count.
#[derive(Debug, Clone)]
pub(crate) struct Requeued {
    pub queue: String,
    pub message_id: MessageId,
    pub redelivery_count: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub released: Vec<Released>,
    pub requeued: Vec<Requeued>,
    pub dead_letters: Vec<DeadLetter>,
    pub events: Vec<BrokerEvent>,
}
