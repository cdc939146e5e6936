//! Connections and channels
//!
//! A `Connection` is one authenticated session; it multiplexes any number of
//! `Channel`s. Every broker operation goes through a channel, which applies
//! the error scope rules:
//!
//! - operation errors (`UNROUTABLE`, `QUEUE_FULL`) are returned and the
//!   channel stays usable;
//! - channel errors (`PRECONDITION_FAILED`, `NOT_FOUND`, ...) close the
//!   channel; its later operations fail with `CHANNEL_CLOSED`;
//! - connection errors close the whole connection.
//!
//! Closing a channel or a connection requeues its unacknowledged deliveries.
//! Dropping a `Connection` without closing it counts as a lost connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::broker::delivery::{AckMode, ChannelKey, Delivery, DeliveryTag, Settlement};
use crate::broker::engine::{Broker, ConsumeOptions, Consumer, PublishOutcome, QueueDeclared};
use crate::broker::exchange::{BindingArguments, ExchangeKind, ExchangeOptions};
use crate::broker::message::Message;
use crate::broker::queue::QueueOptions;
use crate::utils::sync::lock;
use crate::utils::{BrokerError, BrokerResult, ErrorScope};

#[derive(Debug, Default)]
struct ChannelStatus {
    closed: Mutex<Option<String>>,
}

impl ChannelStatus {
    /// Returns `false` if the channel was already closed.
    fn close(&self, reason: &str) -> bool {
        let mut closed = lock(&self.closed);
        if closed.is_some() {
            return false;
        }
        *closed = Some(reason.to_string());
        true
    }

    fn reason(&self) -> Option<String> {
        lock(&self.closed).clone()
    }
}

#[derive(Debug)]
struct ConnectionInner {
    id: u64,
    user: String,
    broker: Arc<Broker>,
    closed: AtomicBool,
    next_channel: AtomicU16,
    channels: Mutex<HashMap<u16, Arc<ChannelStatus>>>,
}

impl ConnectionInner {
    fn shutdown(&self, lost: bool) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let channels: Vec<(u16, Arc<ChannelStatus>)> = lock(&self.channels).drain().collect();
        let mut requeued = 0;
        for (id, status) in channels {
            status.close("connection closed");
            requeued += self.broker.release_channel((self.id, id));
        }
        self.broker.connection_closed(self.id, requeued, lost);
        requeued
    }
}

#[derive(Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(broker: Arc<Broker>, id: u64, user: &str) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                user: user.to_string(),
                broker,
                closed: AtomicBool::new(false),
                next_channel: AtomicU16::new(0),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn open_channel(&self) -> BrokerResult<Channel> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed(self.inner.id));
        }
        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 {
            return Err(BrokerError::AccessRefused("channel ids exhausted".into()));
        }
        let status = Arc::new(ChannelStatus::default());
        lock(&self.inner.channels).insert(id, status.clone());
        debug!(connection = self.inner.id, channel = id, "channel opened");
        Ok(Channel {
            conn: self.inner.clone(),
            id,
            status,
        })
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Closes every channel. Returns the number of deliveries requeued.
    pub fn close(&self) -> usize {
        self.inner.shutdown(false)
    }

    /// Tears the connection down as lost, e.g. after a transport failure.
    pub fn abort(&self) -> usize {
        self.inner.shutdown(true)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.shutdown(true);
    }
}

/// A session on a connection. Consumers and unacknowledged deliveries belong
/// to the channel that created them.
#[derive(Debug)]
pub struct Channel {
    conn: Arc<ConnectionInner>,
    id: u16,
    status: Arc<ChannelStatus>,
}

impl Channel {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn key(&self) -> ChannelKey {
        (self.conn.id, self.id)
    }

    pub fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    /// Closes the channel. Returns the number of deliveries requeued.
    pub fn close(&self) -> BrokerResult<usize> {
        self.ensure_open()?;
        Ok(self.shut("closed by client"))
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        self.guard(|b| b.declare_exchange(name, kind, options))
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> BrokerResult<()> {
        self.guard(|b| b.delete_exchange(name, if_unused))
    }

    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueDeclared> {
        self.guard(|b| b.declare_queue(name, options))
    }

    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> BrokerResult<usize> {
        self.guard(|b| b.delete_queue(name, if_unused, if_empty))
    }

    pub fn purge_queue(&self, name: &str) -> BrokerResult<usize> {
        self.guard(|b| b.purge_queue(name))
    }

    pub fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: BindingArguments,
    ) -> BrokerResult<()> {
        self.guard(|b| b.bind(queue, exchange, routing_key, arguments))
    }

    pub fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: BindingArguments,
    ) -> BrokerResult<()> {
        self.guard(|b| b.unbind(queue, exchange, routing_key, arguments))
    }

    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        mandatory: bool,
    ) -> BrokerResult<PublishOutcome> {
        self.guard(|b| b.publish(exchange, routing_key, message, mandatory))
    }

    pub fn consume(&self, queue: &str, prefetch: u16, ack_mode: AckMode) -> BrokerResult<Consumer> {
        self.consume_with(queue, ConsumeOptions::new(prefetch, ack_mode))
    }

    pub fn consume_with(&self, queue: &str, options: ConsumeOptions) -> BrokerResult<Consumer> {
        let key = self.key();
        self.guard(|b| b.consume(key, queue, options))
    }

    pub fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let key = self.key();
        self.guard(|b| b.cancel(key, consumer_tag))
    }

    pub fn get(&self, queue: &str, ack_mode: AckMode) -> BrokerResult<Option<Delivery>> {
        let key = self.key();
        self.guard(|b| b.get(key, queue, ack_mode))
    }

    pub fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> BrokerResult<Vec<Settlement>> {
        let key = self.key();
        self.guard(|b| b.ack(key, delivery_tag, multiple))
    }

    pub fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> BrokerResult<Vec<Settlement>> {
        let key = self.key();
        self.guard(|b| b.nack(key, delivery_tag, multiple, requeue))
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.conn.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed(self.conn.id));
        }
        match self.status.reason() {
            Some(reason) => Err(BrokerError::ChannelClosed {
                channel: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }

    fn guard<T>(&self, op: impl FnOnce(&Broker) -> BrokerResult<T>) -> BrokerResult<T> {
        self.ensure_open()?;
        let result = op(&self.conn.broker);
        if let Err(err) = &result {
            match err.scope() {
                ErrorScope::Operation => {}
                ErrorScope::Channel => {
                    warn!(
                        connection = self.conn.id,
                        channel = self.id,
                        code = err.code(),
                        error = %err,
                        "closing channel"
                    );
                    self.shut(&err.to_string());
                }
                ErrorScope::Connection => {
                    warn!(
                        connection = self.conn.id,
                        code = err.code(),
                        error = %err,
                        "closing connection"
                    );
                    self.conn.shutdown(false);
                }
            }
        }
        result
    }

    fn shut(&self, reason: &str) -> usize {
        if !self.status.close(reason) {
            return 0;
        }
        lock(&self.conn.channels).remove(&self.id);
        let requeued = self.conn.broker.release_channel(self.key());
        debug!(connection = self.conn.id, channel = self.id, requeued, reason, "channel closed");
        requeued
    }
}
