//! Delivery manager
//!
//! Each queue owns one `DeliveryManager`, guarded by the same mutex as the
//! queue buffer. It knows the queue's consumers and every delivery handed out
//! from the queue that has not been settled yet.
//!
//! Delivery lifecycle:
//!
//! ```text
//! PENDING (in queue) -> DELIVERED -> ACKED
//!                                 -> REQUEUED -> PENDING (redelivery_count + 1)
//!                                 -> DEAD_LETTERED / DISCARDED
//! ```
//!
//! Consumers are pushed deliveries through an unbounded `mpsc` channel, but
//! never more than their prefetch limit of unacknowledged ones, so the channel
//! itself stays bounded by prefetch for manual-ack consumers. Auto-ack
//! consumers settle at hand-off.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::broker::events::{BrokerEvent, Effects, Released, Requeued};
use crate::broker::message::{DeadLetterReason, Message, MessageId};
use crate::broker::queue::{Queue, QueuedMessage};
use crate::utils::sync::lock;
use crate::utils::{BrokerError, BrokerResult};

pub type DeliveryTag = u64;
pub type ConsumerTag = String;
/// (connection id, channel id)
pub type ChannelKey = (u64, u16);

/// Broker-wide map from an unacknowledged delivery tag to the queue and
/// channel holding it. Entries are written before the delivery is sent.
pub(crate) type TagIndex = Arc<Mutex<BTreeMap<DeliveryTag, (String, ChannelKey)>>>;

/// Settled tags remembered per queue for `state_of`.
const SETTLED_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Settled as soon as it is handed to the consumer.
    Auto,
    #[default]
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Requeued and waiting in the queue for its next delivery.
    Pending,
    Delivered,
    Acked,
    Requeued,
    DeadLettered,
    /// Rejected with no dead-letter target configured.
    Discarded,
}

/// How one delivery ended up after ack/nack/timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: DeliveryTag,
    pub state: DeliveryState,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    /// `None` for deliveries fetched with `get`.
    pub consumer_tag: Option<ConsumerTag>,
    pub queue: String,
    pub message: Arc<Message>,
    pub redelivery_count: u32,
    pub delivered_at: i64,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.redelivery_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    Empty,
    PrefetchLimit,
    NoSuchConsumer,
    ConsumerGone,
}

#[derive(Debug, Clone)]
pub enum DeliverOutcome {
    Delivered(Delivery),
    Blocked(Blocked),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryLimits {
    /// Requeues allowed before a message is dead-lettered as `rejected`.
    pub max_redeliveries: u32,
    /// Unacknowledged deliveries older than this are requeued.
    pub consumer_timeout_ms: Option<u64>,
}

#[derive(Debug)]
struct ConsumerState {
    tag: ConsumerTag,
    channel: ChannelKey,
    prefetch: u16,
    ack_mode: AckMode,
    outstanding: usize,
    sender: UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.ack_mode == AckMode::Auto
            || self.prefetch == 0
            || self.outstanding < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct InFlight {
    entry: QueuedMessage,
    consumer: Option<ConsumerTag>,
    channel: ChannelKey,
    delivered_at: i64,
}

impl InFlight {
    fn held_by(&self, channel: ChannelKey, tag: &str) -> bool {
        self.channel == channel && self.consumer.as_deref() == Some(tag)
    }
}

#[derive(Debug)]
pub struct DeliveryManager {
    limits: DeliveryLimits,
    tags: Arc<AtomicU64>,
    index: TagIndex,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    unacked: BTreeMap<DeliveryTag, InFlight>,
    settled: BTreeMap<DeliveryTag, (MessageId, DeliveryState)>,
}

impl DeliveryManager {
    /// `tags` and `index` are shared broker-wide so delivery tags are unique
    /// across queues.
    pub(crate) fn new(limits: DeliveryLimits, tags: Arc<AtomicU64>, index: TagIndex) -> Self {
        Self {
            limits,
            tags,
            index,
            consumers: Vec::new(),
            cursor: 0,
            unacked: BTreeMap::new(),
            settled: BTreeMap::new(),
        }
    }

    pub fn add_consumer(
        &mut self,
        tag: ConsumerTag,
        channel: ChannelKey,
        prefetch: u16,
        ack_mode: AckMode,
        sender: UnboundedSender<Delivery>,
    ) {
        self.consumers.push(ConsumerState {
            tag,
            channel,
            prefetch,
            ack_mode,
            outstanding: 0,
            sender,
        });
    }

    pub fn has_consumer(&self, channel: ChannelKey, tag: &str) -> bool {
        self.position(channel, tag).is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Unacknowledged deliveries currently held by the consumer `tag` of
    /// `channel`.
    pub fn outstanding(&self, channel: ChannelKey, tag: &str) -> Option<usize> {
        self.position(channel, tag)
            .map(|idx| self.consumers[idx].outstanding)
    }

    /// Where the delivery `tag` stands. A requeued delivery reads `Pending`
    /// while its message waits in `queue`, `Requeued` once it has been handed
    /// out again under a new tag. Settled tags are only remembered for the
    /// most recent settlements.
    pub fn state_of(&self, queue: &Queue, tag: DeliveryTag) -> Option<DeliveryState> {
        if self.unacked.contains_key(&tag) {
            return Some(DeliveryState::Delivered);
        }
        let (id, state) = self.settled.get(&tag)?;
        match state {
            DeliveryState::Requeued if queue.contains(id) => Some(DeliveryState::Pending),
            state => Some(*state),
        }
    }

    /// Cancel a consumer and requeue everything it still holds.
    pub fn remove_consumer(
        &mut self,
        queue: &mut Queue,
        channel: ChannelKey,
        tag: &str,
        effects: &mut Effects,
    ) -> bool {
        let Some(pos) = self.position(channel, tag) else {
            return false;
        };
        self.consumers.remove(pos);
        if self.cursor > pos {
            self.cursor -= 1;
        }

        let held: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, f)| f.held_by(channel, tag))
            .map(|(t, _)| *t)
            .collect();
        for delivery_tag in held {
            if let Some(in_flight) = self.unacked.remove(&delivery_tag) {
                self.forget(delivery_tag);
                self.settle_requeued(queue, delivery_tag, in_flight.entry, effects);
            }
        }
        debug!(queue = %queue.name, consumer = tag, "consumer removed");
        true
    }

    /// Drop every consumer of `channel` and requeue all of the channel's
    /// unacknowledged deliveries. Returns the number requeued.
    pub fn release_channel(
        &mut self,
        queue: &mut Queue,
        channel: ChannelKey,
        effects: &mut Effects,
    ) -> usize {
        self.consumers.retain(|c| c.channel != channel);
        self.cursor = 0;

        let held: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, f)| f.channel == channel)
            .map(|(t, _)| *t)
            .collect();
        let count = held.len();
        for delivery_tag in held {
            if let Some(in_flight) = self.unacked.remove(&delivery_tag) {
                self.forget(delivery_tag);
                self.settle_requeued(queue, delivery_tag, in_flight.entry, effects);
            }
        }
        count
    }

    /// Consumer tags registered by `channel`.
    pub fn consumers_of(&self, channel: ChannelKey) -> Vec<ConsumerTag> {
        self.consumers
            .iter()
            .filter(|c| c.channel == channel)
            .map(|c| c.tag.clone())
            .collect()
    }

    /// Hand the next message to one specific consumer.
    pub fn deliver(
        &mut self,
        queue: &mut Queue,
        channel: ChannelKey,
        consumer_tag: &str,
        now: i64,
        effects: &mut Effects,
    ) -> DeliverOutcome {
        match self.position(channel, consumer_tag) {
            Some(idx) => self.deliver_to(idx, queue, now, effects),
            None => DeliverOutcome::Blocked(Blocked::NoSuchConsumer),
        }
    }

    /// Push messages round-robin to consumers with spare capacity until the
    /// queue is empty or every consumer is at its prefetch limit.
    pub fn dispatch(&mut self, queue: &mut Queue, now: i64, effects: &mut Effects) -> usize {
        let mut delivered = 0;
        while !queue.is_empty() {
            let Some(idx) = self.next_ready_consumer() else {
                break;
            };
            match self.deliver_to(idx, queue, now, effects) {
                DeliverOutcome::Delivered(_) => delivered += 1,
                DeliverOutcome::Blocked(Blocked::Empty) => break,
                DeliverOutcome::Blocked(_) => {}
            }
        }
        delivered
    }

    /// Pull one message outside of any subscription.
    pub fn get(
        &mut self,
        queue: &mut Queue,
        channel: ChannelKey,
        ack_mode: AckMode,
        now: i64,
        effects: &mut Effects,
    ) -> Option<Delivery> {
        let entry = self.next_entry(queue, now, effects)?;
        let delivery_tag = self.next_tag();
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: None,
            queue: queue.name.clone(),
            message: entry.message.clone(),
            redelivery_count: entry.redelivery_count,
            delivered_at: now,
        };
        if ack_mode == AckMode::Manual {
            self.record(queue, delivery_tag, channel);
        }
        self.track(queue, delivery_tag, entry, None, channel, ack_mode, now, effects);
        Some(delivery)
    }

    pub fn ack(
        &mut self,
        queue: &Queue,
        channel: ChannelKey,
        delivery_tag: DeliveryTag,
        multiple: bool,
        effects: &mut Effects,
    ) -> BrokerResult<Vec<Settlement>> {
        let tags = self.select(channel, delivery_tag, multiple)?;
        let mut settled = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(in_flight) = self.unacked.remove(&tag) {
                self.credit(&in_flight);
                self.forget(tag);
                self.remember(tag, in_flight.entry.message.id, DeliveryState::Acked);
                effects.released.push(Released {
                    queue: queue.name.clone(),
                    message: in_flight.entry.message,
                });
                settled.push(Settlement {
                    delivery_tag: tag,
                    state: DeliveryState::Acked,
                });
            }
        }
        Ok(settled)
    }

    pub fn nack(
        &mut self,
        queue: &mut Queue,
        channel: ChannelKey,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
        effects: &mut Effects,
    ) -> BrokerResult<Vec<Settlement>> {
        let tags = self.select(channel, delivery_tag, multiple)?;
        let mut settled = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(in_flight) = self.unacked.remove(&tag) {
                self.credit(&in_flight);
                self.forget(tag);
                let id = in_flight.entry.message.id;
                let state = if requeue {
                    self.requeue_or_dead_letter(queue, in_flight.entry, effects)
                } else {
                    Self::reject(queue, in_flight.entry, effects)
                };
                self.remember(tag, id, state);
                settled.push(Settlement {
                    delivery_tag: tag,
                    state,
                });
            }
        }
        Ok(settled)
    }

    /// Requeue deliveries held longer than the consumer timeout.
    pub fn expire_stale(&mut self, queue: &mut Queue, now: i64, effects: &mut Effects) -> usize {
        let Some(timeout) = self.limits.consumer_timeout_ms else {
            return 0;
        };
        let deadline = now.saturating_sub(timeout as i64);
        let stale: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, f)| f.delivered_at <= deadline)
            .map(|(t, _)| *t)
            .collect();

        let count = stale.len();
        for delivery_tag in stale {
            if let Some(in_flight) = self.unacked.remove(&delivery_tag) {
                warn!(
                    queue = %queue.name,
                    delivery_tag,
                    consumer = ?in_flight.consumer,
                    "delivery not acknowledged in time, requeueing"
                );
                self.credit(&in_flight);
                self.forget(delivery_tag);
                effects.events.push(BrokerEvent::DeliveryTimeout {
                    queue: queue.name.clone(),
                    consumer_tag: in_flight.consumer,
                    delivery_tag,
                });
                self.settle_requeued(queue, delivery_tag, in_flight.entry, effects);
            }
        }
        count
    }

    /// Drop all consumers and return every unsettled entry (queue deletion).
    pub fn clear(&mut self) -> Vec<QueuedMessage> {
        self.consumers.clear();
        self.cursor = 0;
        let unacked = std::mem::take(&mut self.unacked);
        let mut index = lock(&self.index);
        unacked
            .into_iter()
            .map(|(tag, in_flight)| {
                index.remove(&tag);
                in_flight.entry
            })
            .collect()
    }

    fn deliver_to(
        &mut self,
        idx: usize,
        queue: &mut Queue,
        now: i64,
        effects: &mut Effects,
    ) -> DeliverOutcome {
        if !self.consumers[idx].has_capacity() {
            return DeliverOutcome::Blocked(Blocked::PrefetchLimit);
        }
        let Some(entry) = self.next_entry(queue, now, effects) else {
            return DeliverOutcome::Blocked(Blocked::Empty);
        };

        let delivery_tag = self.next_tag();
        let consumer = &self.consumers[idx];
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: Some(consumer.tag.clone()),
            queue: queue.name.clone(),
            message: entry.message.clone(),
            redelivery_count: entry.redelivery_count,
            delivered_at: now,
        };

        let (tag, channel, ack_mode) = (consumer.tag.clone(), consumer.channel, consumer.ack_mode);
        if ack_mode == AckMode::Manual {
            self.record(queue, delivery_tag, channel);
        }

        if self.consumers[idx].sender.send(delivery.clone()).is_err() {
            // receiver dropped: the message never left, put it back as it was
            self.forget(delivery_tag);
            queue.requeue(entry);
            self.remove_consumer(queue, channel, &tag, effects);
            return DeliverOutcome::Blocked(Blocked::ConsumerGone);
        }

        if ack_mode == AckMode::Manual {
            self.consumers[idx].outstanding += 1;
        }
        self.track(queue, delivery_tag, entry, Some(tag), channel, ack_mode, now, effects);
        DeliverOutcome::Delivered(delivery)
    }

    #[allow(clippy::too_many_arguments)]
    fn track(
        &mut self,
        queue: &Queue,
        delivery_tag: DeliveryTag,
        entry: QueuedMessage,
        consumer: Option<ConsumerTag>,
        channel: ChannelKey,
        ack_mode: AckMode,
        now: i64,
        effects: &mut Effects,
    ) {
        match ack_mode {
            AckMode::Auto => {
                self.remember(delivery_tag, entry.message.id, DeliveryState::Acked);
                effects.released.push(Released {
                    queue: queue.name.clone(),
                    message: entry.message,
                });
            }
            AckMode::Manual => {
                self.unacked.insert(
                    delivery_tag,
                    InFlight {
                        entry,
                        consumer,
                        channel,
                        delivered_at: now,
                    },
                );
            }
        }
    }

    fn next_entry(
        &mut self,
        queue: &mut Queue,
        now: i64,
        effects: &mut Effects,
    ) -> Option<QueuedMessage> {
        let mut expired = Vec::new();
        let entry = queue.dequeue(now, &mut expired);
        for e in expired {
            queue.discard(e, DeadLetterReason::Expired, effects);
        }
        entry
    }

    fn requeue_or_dead_letter(
        &self,
        queue: &mut Queue,
        mut entry: QueuedMessage,
        effects: &mut Effects,
    ) -> DeliveryState {
        let count = entry.redelivery_count + 1;
        if count > self.limits.max_redeliveries {
            effects.events.push(BrokerEvent::MaxRedeliveriesExceeded {
                queue: queue.name.clone(),
                message_id: entry.message.id,
                redeliveries: entry.redelivery_count,
            });
            return Self::reject(queue, entry, effects);
        }

        entry.redelivery_count = count;
        effects.requeued.push(Requeued {
            queue: queue.name.clone(),
            message_id: entry.message.id,
            redelivery_count: count,
        });
        queue.requeue(entry);
        DeliveryState::Requeued
    }

    fn settle_requeued(
        &mut self,
        queue: &mut Queue,
        delivery_tag: DeliveryTag,
        entry: QueuedMessage,
        effects: &mut Effects,
    ) {
        let id = entry.message.id;
        let state = self.requeue_or_dead_letter(queue, entry, effects);
        self.remember(delivery_tag, id, state);
    }

    fn remember(&mut self, delivery_tag: DeliveryTag, id: MessageId, state: DeliveryState) {
        self.settled.insert(delivery_tag, (id, state));
        if self.settled.len() > SETTLED_HISTORY {
            self.settled.pop_first();
        }
    }

    fn reject(queue: &mut Queue, entry: QueuedMessage, effects: &mut Effects) -> DeliveryState {
        let state = if queue.options.dead_letter.is_some() {
            DeliveryState::DeadLettered
        } else {
            DeliveryState::Discarded
        };
        queue.discard(entry, DeadLetterReason::Rejected, effects);
        state
    }

    fn select(
        &self,
        channel: ChannelKey,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> BrokerResult<Vec<DeliveryTag>> {
        if multiple {
            return Ok(self
                .unacked
                .range(..=delivery_tag)
                .filter(|(_, f)| f.channel == channel)
                .map(|(t, _)| *t)
                .collect());
        }
        match self.unacked.get(&delivery_tag) {
            Some(f) if f.channel == channel => Ok(vec![delivery_tag]),
            _ => Err(BrokerError::PreconditionFailed(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    fn credit(&mut self, in_flight: &InFlight) {
        let Some(tag) = in_flight.consumer.as_deref() else {
            return;
        };
        if let Some(idx) = self.position(in_flight.channel, tag) {
            let state = &mut self.consumers[idx];
            state.outstanding = state.outstanding.saturating_sub(1);
        }
    }

    fn next_ready_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn record(&self, queue: &Queue, delivery_tag: DeliveryTag, channel: ChannelKey) {
        lock(&self.index).insert(delivery_tag, (queue.name.clone(), channel));
    }

    fn forget(&self, delivery_tag: DeliveryTag) {
        lock(&self.index).remove(&delivery_tag);
    }

    fn position(&self, channel: ChannelKey, tag: &str) -> Option<usize> {
        self.consumers
            .iter()
            .position(|c| c.channel == channel && c.tag == tag)
    }

    fn next_tag(&self) -> DeliveryTag {
        self.tags.fetch_add(1, Ordering::Relaxed) + 1
    }
}
