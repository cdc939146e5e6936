use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::connection::Connection;
use crate::broker::delivery::{
    AckMode, ChannelKey, ConsumerTag, Delivery, DeliveryLimits, DeliveryManager, DeliveryState,
    DeliveryTag, Settlement, TagIndex,
};
use crate::broker::events::{BrokerEvent, Effects, Released};
use crate::broker::exchange::{
    Binding, BindingArguments, Exchange, ExchangeKind, ExchangeOptions,
};
use crate::broker::message::{DeadLetterReason, Message, MessageId};
use crate::broker::queue::{Queue, QueueOptions, QueuedMessage};
use crate::broker::router::ExchangeRouter;
use crate::broker::store::MessageStore;
use crate::config::BrokerSettings;
use crate::persistence::{
    BindingRecord, ExchangeRecord, Persistence, PersistenceResult, QueueRecord,
};
use crate::utils::sync::{lock, read, write};
use crate::utils::{BrokerError, BrokerResult};

/// A dead-lettered message that has already been dead-lettered this many
/// times is dropped instead of rerouted again.
pub const MAX_DEAD_LETTER_HOPS: i64 = 16;

/// Milliseconds since the UNIX epoch; the broker's clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub message_id: MessageId,
    /// Queues that took a reference; empty for an unroutable,
    /// non-mandatory publish.
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclared {
    pub queue: String,
    pub messages: usize,
    pub consumers: usize,
}

/// Snapshot of one queue for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub messages: usize,
    pub consumers: usize,
    pub unacked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Generated when absent.
    pub tag: Option<ConsumerTag>,
    pub prefetch: u16,
    pub ack_mode: AckMode,
}

impl ConsumeOptions {
    pub fn new(prefetch: u16, ack_mode: AckMode) -> Self {
        Self {
            tag: None,
            prefetch,
            ack_mode,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<ConsumerTag>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// A subscription. Deliveries arrive on `recv` while the consumer has spare
/// prefetch capacity; `recv` yields `None` once the subscription ends.
#[derive(Debug)]
pub struct Consumer {
    pub tag: ConsumerTag,
    pub queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

/// Counts of the work done by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub timed_out: usize,
    pub auto_deleted: usize,
}

#[derive(Debug)]
struct QueueState {
    queue: Queue,
    deliveries: DeliveryManager,
    had_consumer: bool,
}

impl QueueState {
    fn unused(&self) -> bool {
        self.queue.options.auto_delete
            && self.had_consumer
            && self.deliveries.consumer_count() == 0
            && self.deliveries.unacked_count() == 0
            && self.queue.is_empty()
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.queue.name.clone(),
            durable: self.queue.options.durable,
            messages: self.queue.len(),
            consumers: self.deliveries.consumer_count(),
            unacked: self.deliveries.unacked_count(),
        }
    }
}

/// The broker core: exchanges, queues, the message store and every consumer.
///
/// Lock order is queue map, then one queue mutex, then the delivery tag
/// index. Dead letters and events produced under a queue mutex are applied
/// after it is released.
#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    router: RwLock<ExchangeRouter>,
    queues: RwLock<HashMap<String, Arc<Mutex<QueueState>>>>,
    store: MessageStore,
    persistence: Option<Persistence>,
    tags: Arc<AtomicU64>,
    delivery_index: TagIndex,
    consumer_index: Mutex<HashMap<(ChannelKey, ConsumerTag), String>>,
    next_consumer: AtomicU64,
    next_connection: AtomicU64,
    connections: AtomicUsize,
    events: broadcast::Sender<BrokerEvent>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// Creates an in-memory broker.
    pub fn new(settings: BrokerSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            settings,
            router: RwLock::new(ExchangeRouter::new()),
            queues: RwLock::new(HashMap::new()),
            store: MessageStore::new(),
            persistence: None,
            tags: Arc::new(AtomicU64::new(0)),
            delivery_index: Arc::new(Mutex::new(BTreeMap::new())),
            consumer_index: Mutex::new(HashMap::new()),
            next_consumer: AtomicU64::new(0),
            next_connection: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
            events,
        }
    }

    /// Creates a broker journaling to `persistence` and replays whatever the
    /// journal holds: durable exchanges, queues and bindings, then the
    /// persistent messages still waiting in durable queues.
    pub fn with_persistence(
        settings: BrokerSettings,
        persistence: Persistence,
    ) -> BrokerResult<Self> {
        let mut broker = Self::new(settings);
        broker.recover(&persistence)?;
        broker.persistence = Some(persistence);
        Ok(broker)
    }

    /// Builds the broker described by `settings`, opening the journal when
    /// `data_dir` is set.
    pub fn open(settings: BrokerSettings) -> BrokerResult<Self> {
        match settings.data_dir.clone() {
            Some(dir) => {
                let persistence = Persistence::open(&dir)?;
                info!(data_dir = %dir, "journal opened");
                Self::with_persistence(settings, persistence)
            }
            None => Ok(Self::new(settings)),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Policy outcomes: evictions, expiries, dead letters, timeouts.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Opens a connection for an already authenticated `user`.
    pub fn connect(self: &Arc<Self>, user: &str) -> BrokerResult<Connection> {
        let active = self.connections.fetch_add(1, Ordering::SeqCst);
        if active >= self.settings.max_connections {
            self.connections.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::AccessRefused(format!(
                "connection limit of {} reached",
                self.settings.max_connections
            )));
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        info!(connection = id, user, "connection opened");
        Ok(Connection::new(self.clone(), id, user))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_closed(&self, connection: u64, requeued: usize, lost: bool) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
        if lost {
            warn!(connection, requeued, "connection lost");
            self.emit(BrokerEvent::ConnectionLost {
                connection,
                requeued,
            });
        } else {
            info!(connection, requeued, "connection closed");
        }
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        let created = write(&self.router).declare_exchange(name, kind, options.clone())?;
        if created && options.durable {
            if let Some(p) = &self.persistence {
                p.save_exchange(&ExchangeRecord {
                    name: name.to_string(),
                    kind,
                    options,
                })?;
            }
        }
        Ok(())
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> BrokerResult<()> {
        let exchange = write(&self.router).delete_exchange(name, if_unused)?;
        if exchange.options.durable {
            if let Some(p) = &self.persistence {
                p.remove_exchange(name)?;
            }
        }
        debug!(exchange = name, "exchange deleted");
        Ok(())
    }

    /// Declares a queue; an empty name asks for a generated one. Declaring an
    /// existing queue with the same options is a no-op.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueDeclared> {
        if name.starts_with("amq.") {
            return Err(BrokerError::AccessRefused(format!(
                "queue name '{name}' is reserved"
            )));
        }
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        {
            let mut queues = write(&self.queues);
            if let Some(existing) = queues.get(&name) {
                let state = lock(existing);
                if state.queue.options != options {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "queue '{name}' already declared with different options"
                    )));
                }
                return Ok(QueueDeclared {
                    queue: name,
                    messages: state.queue.len(),
                    consumers: state.deliveries.consumer_count(),
                });
            }
            let state = self.new_state(&name, options.clone());
            queues.insert(name.clone(), Arc::new(Mutex::new(state)));
        }
        write(&self.router).register_queue(&name);

        if options.durable {
            if let Some(p) = &self.persistence {
                p.save_queue(&QueueRecord {
                    name: name.clone(),
                    options,
                })?;
            }
        }
        debug!(queue = %name, "queue declared");
        Ok(QueueDeclared {
            queue: name,
            messages: 0,
            consumers: 0,
        })
    }

    /// Deletes a queue, dropping its messages and cancelling its consumers.
    /// Returns the number of messages that were waiting.
    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> BrokerResult<usize> {
        let mut effects = Effects::default();
        let (dropped, durable) = {
            let mut queues = write(&self.queues);
            let state = queues
                .get(name)
                .cloned()
                .ok_or_else(|| BrokerError::not_found("queue", name))?;
            let mut guard = lock(&state);
            let st = &mut *guard;
            if if_unused && st.deliveries.consumer_count() > 0 {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{name}' has consumers"
                )));
            }
            if if_empty && !st.queue.is_empty() {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{name}' is not empty"
                )));
            }
            queues.remove(name);

            let mut entries = st.queue.purge();
            let dropped = entries.len();
            entries.extend(st.deliveries.clear());
            for entry in entries {
                effects.released.push(Released {
                    queue: name.to_string(),
                    message: entry.message,
                });
            }
            self.commit(&st.queue, &mut effects);
            (dropped, st.queue.options.durable)
        };

        let auto_deleted = {
            let mut router = write(&self.router);
            router.unregister_queue(name);
            router.take_auto_deleted()
        };
        self.forget_exchanges(auto_deleted)?;
        lock(&self.consumer_index).retain(|_, queue| queue != name);
        if durable {
            if let Some(p) = &self.persistence {
                p.remove_queue(name)?;
            }
        }

        info!(queue = name, dropped, "queue deleted");
        effects.events.push(BrokerEvent::QueueDeleted {
            queue: name.to_string(),
        });
        self.finish(effects);
        Ok(dropped)
    }

    /// Drops every waiting message. Unacknowledged deliveries are kept.
    pub fn purge_queue(&self, name: &str) -> BrokerResult<usize> {
        let state = self.queue_state(name)?;
        let mut effects = Effects::default();
        let purged = {
            let mut guard = lock(&state);
            let entries = guard.queue.purge();
            let purged = entries.len();
            for entry in entries {
                effects.released.push(Released {
                    queue: name.to_string(),
                    message: entry.message,
                });
            }
            self.commit(&guard.queue, &mut effects);
            purged
        };
        self.finish(effects);
        Ok(purged)
    }

    /// Binds `queue` to `exchange`. An undeclared queue is created with
    /// default options.
    pub fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: BindingArguments,
    ) -> BrokerResult<()> {
        if !read(&self.queues).contains_key(queue) {
            self.declare_queue(queue, QueueOptions::default())?;
        }
        let binding = Binding::new(queue, routing_key).with_arguments(arguments.clone());
        let created = write(&self.router).bind(exchange, binding)?;
        if created && self.binding_is_durable(exchange, queue) {
            if let Some(p) = &self.persistence {
                p.save_binding(&BindingRecord {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                    arguments,
                })?;
            }
        }
        debug!(queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    pub fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: BindingArguments,
    ) -> BrokerResult<()> {
        let durable = self.binding_is_durable(exchange, queue);
        let (removed, auto_deleted) = {
            let mut router = write(&self.router);
            let removed = router.unbind(exchange, queue, routing_key, &arguments)?;
            (removed, router.take_auto_deleted())
        };
        if removed && durable {
            if let Some(p) = &self.persistence {
                p.remove_binding(&BindingRecord {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                    arguments,
                })?;
            }
        }
        self.forget_exchanges(auto_deleted)
    }

    /// Routes `message` through `exchange` and enqueues a reference in every
    /// matching queue.
    ///
    /// An unroutable message is dropped; with `mandatory` the publish fails
    /// with `UNROUTABLE`. A reject-publish queue that is full refuses its
    /// copy and the publish fails with `QUEUE_FULL` after the other queues
    /// took theirs.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        mandatory: bool,
    ) -> BrokerResult<PublishOutcome> {
        let message = Arc::new(message.routed(exchange, routing_key));
        let routes = read(&self.router).route(exchange, &message, routing_key)?;

        if routes.is_empty() {
            debug!(exchange, routing_key, mandatory, "message unroutable");
            self.emit(BrokerEvent::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message_id: message.id,
            });
            if mandatory {
                return Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            return Ok(PublishOutcome {
                message_id: message.id,
                queues: Vec::new(),
            });
        }

        let names: Vec<String> = routes.into_iter().map(|r| r.queue).collect();
        let mut effects = Effects::default();
        let (queues, refused) = self.enqueue_routed(&message, &names, now_ms(), &mut effects);
        self.finish(effects);

        match refused {
            Some(err) => Err(err),
            None => Ok(PublishOutcome {
                message_id: message.id,
                queues,
            }),
        }
    }

    pub fn consume(
        &self,
        channel: ChannelKey,
        queue: &str,
        options: ConsumeOptions,
    ) -> BrokerResult<Consumer> {
        let state = self.queue_state(queue)?;
        let tag = options.tag.unwrap_or_else(|| {
            format!("ctag-{}", self.next_consumer.fetch_add(1, Ordering::Relaxed) + 1)
        });
        {
            let mut index = lock(&self.consumer_index);
            let key = (channel, tag.clone());
            if index.contains_key(&key) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "consumer tag '{tag}' already in use on this channel"
                )));
            }
            index.insert(key, queue.to_string());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut effects = Effects::default();
        {
            let mut guard = lock(&state);
            let st = &mut *guard;
            st.deliveries
                .add_consumer(tag.clone(), channel, options.prefetch, options.ack_mode, sender);
            st.had_consumer = true;
            st.deliveries.dispatch(&mut st.queue, now_ms(), &mut effects);
            self.commit(&st.queue, &mut effects);
        }
        self.finish(effects);

        debug!(queue, consumer = %tag, prefetch = options.prefetch, "consumer registered");
        Ok(Consumer {
            tag,
            queue: queue.to_string(),
            receiver,
        })
    }

    /// Cancels a consumer and requeues everything it still holds.
    pub fn cancel(&self, channel: ChannelKey, tag: &str) -> BrokerResult<()> {
        let queue = lock(&self.consumer_index)
            .remove(&(channel, tag.to_string()))
            .ok_or_else(|| BrokerError::not_found("consumer", tag))?;
        let Some(state) = read(&self.queues).get(&queue).cloned() else {
            return Ok(());
        };

        let mut effects = Effects::default();
        let unused = {
            let mut guard = lock(&state);
            let st = &mut *guard;
            st.deliveries
                .remove_consumer(&mut st.queue, channel, tag, &mut effects);
            st.deliveries.dispatch(&mut st.queue, now_ms(), &mut effects);
            self.commit(&st.queue, &mut effects);
            st.unused()
        };
        self.finish(effects);
        if unused {
            self.auto_delete(&queue);
        }
        Ok(())
    }

    /// Pulls one message without a subscription.
    pub fn get(
        &self,
        channel: ChannelKey,
        queue: &str,
        ack_mode: AckMode,
    ) -> BrokerResult<Option<Delivery>> {
        let state = self.queue_state(queue)?;
        let mut effects = Effects::default();
        let delivery = {
            let mut guard = lock(&state);
            let st = &mut *guard;
            let delivery = st
                .deliveries
                .get(&mut st.queue, channel, ack_mode, now_ms(), &mut effects);
            self.commit(&st.queue, &mut effects);
            delivery
        };
        self.finish(effects);
        Ok(delivery)
    }

    /// Acknowledges `tag`, or with `multiple` every delivery of the channel
    /// up to and including `tag`.
    pub fn ack(
        &self,
        channel: ChannelKey,
        tag: DeliveryTag,
        multiple: bool,
    ) -> BrokerResult<Vec<Settlement>> {
        self.settle(channel, tag, multiple, |st, effects| {
            st.deliveries
                .ack(&st.queue, channel, tag, multiple, effects)
        })
    }

    /// Negatively acknowledges. With `requeue` the message goes back to the
    /// front of its priority band until it runs out of redeliveries; without
    /// it the message is dead-lettered as `rejected` or dropped.
    pub fn nack(
        &self,
        channel: ChannelKey,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> BrokerResult<Vec<Settlement>> {
        self.settle(channel, tag, multiple, |st, effects| {
            st.deliveries
                .nack(&mut st.queue, channel, tag, multiple, requeue, effects)
        })
    }

    /// Cancels the channel's consumers and requeues all of its
    /// unacknowledged deliveries. Returns the number requeued.
    pub fn release_channel(&self, channel: ChannelKey) -> usize {
        lock(&self.consumer_index).retain(|(ch, _), _| *ch != channel);

        let states: Vec<Arc<Mutex<QueueState>>> = read(&self.queues).values().cloned().collect();
        let mut effects = Effects::default();
        let mut requeued = 0;
        let mut unused = Vec::new();
        for state in states {
            let mut guard = lock(&state);
            let st = &mut *guard;
            let before = st.deliveries.consumer_count();
            let released = st
                .deliveries
                .release_channel(&mut st.queue, channel, &mut effects);
            if released == 0 && before == st.deliveries.consumer_count() {
                continue;
            }
            requeued += released;
            st.deliveries.dispatch(&mut st.queue, now_ms(), &mut effects);
            self.commit(&st.queue, &mut effects);
            if st.unused() {
                unused.push(st.queue.name.clone());
            }
        }
        self.finish(effects);
        for name in unused {
            self.auto_delete(&name);
        }
        requeued
    }

    /// Removes expired messages from every queue, dead-lettering them as
    /// `expired` where configured.
    pub fn sweep_expired(&self, now: i64) -> usize {
        self.for_each_queue(|st, effects| {
            let expired = st.queue.take_expired(now);
            let count = expired.len();
            for entry in expired {
                st.queue.discard(entry, DeadLetterReason::Expired, effects);
            }
            count
        })
    }

    /// Requeues deliveries held past the acknowledgment timeout.
    pub fn expire_stale_deliveries(&self, now: i64) -> usize {
        self.for_each_queue(|st, effects| {
            let count = st.deliveries.expire_stale(&mut st.queue, now, effects);
            if count > 0 {
                st.deliveries.dispatch(&mut st.queue, now, effects);
            }
            count
        })
    }

    /// One pass of the periodic housekeeping.
    pub fn run_maintenance(&self, now: i64) -> MaintenanceReport {
        let expired = self.sweep_expired(now);
        let timed_out = self.expire_stale_deliveries(now);

        let unused: Vec<String> = read(&self.queues)
            .values()
            .filter_map(|state| {
                let st = lock(state);
                st.unused().then(|| st.queue.name.clone())
            })
            .collect();
        let auto_deleted = unused.iter().filter(|name| self.auto_delete(name)).count();

        MaintenanceReport {
            expired,
            timed_out,
            auto_deleted,
        }
    }

    /// Runs `run_maintenance` every `sweep_interval_ms`.
    pub async fn start_maintenance_loop(broker: Arc<Broker>) {
        let period = Duration::from_millis(broker.settings.sweep_interval_ms.max(1));
        loop {
            tokio::time::sleep(period).await;
            let report = broker.run_maintenance(now_ms());
            if report != MaintenanceReport::default() {
                debug!(?report, "maintenance pass");
            }
        }
    }

    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        let state = read(&self.queues).get(name).cloned()?;
        let info = lock(&state).info();
        Some(info)
    }

    /// State of a delivery tag handed out from `queue`.
    pub fn delivery_state(&self, queue: &str, tag: DeliveryTag) -> Option<DeliveryState> {
        let state = read(&self.queues).get(queue).cloned()?;
        let st = lock(&state);
        st.deliveries.state_of(&st.queue, tag)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.queues).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        read(&self.router).has_exchange(name)
    }

    /// Messages held by the store, whatever the number of queues sharing them.
    pub fn stored_messages(&self) -> usize {
        self.store.len()
    }

    /// Flushes the journal, if any.
    pub fn flush(&self) -> BrokerResult<()> {
        if let Some(p) = &self.persistence {
            p.flush()?;
        }
        Ok(())
    }

    fn new_state(&self, name: &str, options: QueueOptions) -> QueueState {
        QueueState {
            queue: Queue::new(name, options),
            deliveries: DeliveryManager::new(
                self.limits(),
                self.tags.clone(),
                self.delivery_index.clone(),
            ),
            had_consumer: false,
        }
    }

    fn limits(&self) -> DeliveryLimits {
        DeliveryLimits {
            max_redeliveries: self.settings.max_redeliveries,
            consumer_timeout_ms: self.settings.consumer_timeout(),
        }
    }

    fn queue_state(&self, name: &str) -> BrokerResult<Arc<Mutex<QueueState>>> {
        read(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("queue", name))
    }

    /// Drops the journal records of exchanges the router auto-deleted.
    fn forget_exchanges(&self, exchanges: Vec<Exchange>) -> BrokerResult<()> {
        for exchange in exchanges {
            if exchange.options.durable {
                if let Some(p) = &self.persistence {
                    p.remove_exchange(&exchange.name)?;
                }
            }
            info!(exchange = %exchange.name, "exchange auto-deleted");
        }
        Ok(())
    }

    fn binding_is_durable(&self, exchange: &str, queue: &str) -> bool {
        let exchange_durable = read(&self.router)
            .exchange(exchange)
            .is_some_and(|ex| ex.options.durable);
        let queue_durable = read(&self.queues)
            .get(queue)
            .is_some_and(|state| lock(state).queue.options.durable);
        exchange_durable && queue_durable
    }

    /// Enqueue `message` into each named queue. Returns the queues that
    /// accepted it and the first refusal.
    fn enqueue_routed(
        &self,
        message: &Arc<Message>,
        names: &[String],
        now: i64,
        effects: &mut Effects,
    ) -> (Vec<String>, Option<BrokerError>) {
        let queues = read(&self.queues);
        let mut accepted = Vec::with_capacity(names.len());
        let mut refused = None;

        for name in names {
            let Some(state) = queues.get(name) else {
                continue;
            };
            let mut guard = lock(state);
            let st = &mut *guard;

            self.store.retain(message, 1);
            match st.queue.enqueue(message.clone(), now) {
                Ok(evicted) => {
                    self.journal_enqueue(&st.queue, message);
                    for entry in evicted {
                        debug!(
                            queue = %name,
                            message_id = %entry.message.id,
                            "evicted by max length"
                        );
                        st.queue.discard(entry, DeadLetterReason::MaxLen, effects);
                    }
                    st.deliveries.dispatch(&mut st.queue, now, effects);
                    self.commit(&st.queue, effects);
                    accepted.push(name.clone());
                }
                Err(err) => {
                    self.store.release(&message.id);
                    debug!(queue = %name, "queue full, publish refused");
                    refused.get_or_insert(err);
                }
            }
        }
        (accepted, refused)
    }

    fn settle(
        &self,
        channel: ChannelKey,
        tag: DeliveryTag,
        multiple: bool,
        op: impl Fn(&mut QueueState, &mut Effects) -> BrokerResult<Vec<Settlement>>,
    ) -> BrokerResult<Vec<Settlement>> {
        let queues: Vec<String> = {
            let index = lock(&self.delivery_index);
            if multiple {
                let names: HashSet<&String> = index
                    .range(..=tag)
                    .filter(|(_, (_, ch))| *ch == channel)
                    .map(|(_, (queue, _))| queue)
                    .collect();
                names.into_iter().cloned().collect()
            } else {
                match index.get(&tag) {
                    Some((queue, ch)) if *ch == channel => vec![queue.clone()],
                    _ => {
                        return Err(BrokerError::PreconditionFailed(format!(
                            "unknown delivery tag {tag}"
                        )));
                    }
                }
            }
        };

        let mut effects = Effects::default();
        let mut settled = Vec::new();
        let mut failure = None;
        for name in queues {
            let Some(state) = read(&self.queues).get(&name).cloned() else {
                continue;
            };
            let mut guard = lock(&state);
            let st = &mut *guard;
            match op(st, &mut effects) {
                Ok(done) => settled.extend(done),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
            st.deliveries.dispatch(&mut st.queue, now_ms(), &mut effects);
            self.commit(&st.queue, &mut effects);
        }
        self.finish(effects);

        match failure {
            Some(err) => Err(err),
            None => {
                settled.sort_by_key(|s| s.delivery_tag);
                Ok(settled)
            }
        }
    }

    fn for_each_queue(
        &self,
        mut op: impl FnMut(&mut QueueState, &mut Effects) -> usize,
    ) -> usize {
        let states: Vec<Arc<Mutex<QueueState>>> = read(&self.queues).values().cloned().collect();
        let mut effects = Effects::default();
        let mut total = 0;
        for state in states {
            let mut guard = lock(&state);
            let st = &mut *guard;
            total += op(st, &mut effects);
            self.commit(&st.queue, &mut effects);
        }
        self.finish(effects);
        total
    }

    fn auto_delete(&self, name: &str) -> bool {
        match self.delete_queue(name, true, true) {
            Ok(_) => {
                info!(queue = name, "auto-delete queue removed");
                true
            }
            Err(err) => {
                debug!(queue = name, error = %err, "auto-delete skipped");
                false
            }
        }
    }

    /// Applies the parts of `effects` that must happen under the queue lock:
    /// store references and the journal.
    fn commit(&self, queue: &Queue, effects: &mut Effects) {
        let journal = self.persistence.as_ref().filter(|_| queue.options.durable);
        for requeued in effects.requeued.drain(..) {
            if let Some(p) = journal {
                journaled(p.update_redelivery(
                    &requeued.queue,
                    &requeued.message_id,
                    requeued.redelivery_count,
                ));
            }
        }
        for released in effects.released.drain(..) {
            let id = released.message.id;
            if let Some(p) = journal {
                journaled(p.remove_entry(&released.queue, &id));
            }
            if let Some(message) = self.store.release(&id) {
                if let (Some(p), true) = (&self.persistence, message.persistent) {
                    journaled(p.remove_message(&id));
                }
            }
        }
    }

    fn journal_enqueue(&self, queue: &Queue, message: &Arc<Message>) {
        let Some(p) = &self.persistence else {
            return;
        };
        if !(message.persistent && queue.options.durable) {
            return;
        }
        if let Some(entry) = queue.get(&message.id) {
            journaled(p.save_message(message));
            journaled(p.save_entry(&queue.name, entry));
        }
    }

    /// Applies what `commit` left: dead letters are republished (which may
    /// produce further dead letters) and events are broadcast.
    fn finish(&self, mut effects: Effects) {
        let mut pending: VecDeque<_> = effects.dead_letters.drain(..).collect();
        let mut events = std::mem::take(&mut effects.events);

        while let Some(dead) = pending.pop_front() {
            if dead.message.death_count() >= MAX_DEAD_LETTER_HOPS {
                warn!(
                    queue = %dead.queue,
                    message_id = %dead.message.id,
                    "dead-letter hop limit reached, dropping"
                );
                events.push(BrokerEvent::DeadLetterDropped {
                    queue: dead.queue,
                    message_id: dead.message.id,
                    reason: dead.reason,
                });
                continue;
            }

            let now = now_ms();
            let routing_key = dead
                .target
                .routing_key
                .clone()
                .unwrap_or_else(|| dead.message.routing_key.clone());
            let copy = Arc::new(
                dead.message
                    .dead_lettered(&dead.queue, dead.reason, now)
                    .routed(&dead.target.exchange, &routing_key),
            );

            let routed = read(&self.router).route(&dead.target.exchange, &copy, &routing_key);
            let routes = match routed {
                Ok(routes) => routes,
                Err(err) => {
                    warn!(queue = %dead.queue, error = %err, "dead-letter target unavailable");
                    Vec::new()
                }
            };
            let names: Vec<String> = routes.into_iter().map(|r| r.queue).collect();

            let mut inner = Effects::default();
            let (accepted, _) = self.enqueue_routed(&copy, &names, now, &mut inner);
            if accepted.is_empty() {
                warn!(
                    queue = %dead.queue,
                    message_id = %dead.message.id,
                    reason = %dead.reason,
                    "dead letter dropped"
                );
                events.push(BrokerEvent::DeadLetterDropped {
                    queue: dead.queue,
                    message_id: dead.message.id,
                    reason: dead.reason,
                });
            } else {
                debug!(
                    queue = %dead.queue,
                    message_id = %dead.message.id,
                    reason = %dead.reason,
                    "message dead-lettered"
                );
                events.push(BrokerEvent::DeadLettered {
                    queue: dead.queue,
                    message_id: dead.message.id,
                    dead_letter_id: copy.id,
                    reason: dead.reason,
                });
            }
            pending.extend(inner.dead_letters);
            events.extend(inner.events);
        }

        for event in events {
            self.emit(event);
        }
    }

    fn emit(&self, event: BrokerEvent) {
        debug!(?event, "broker event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn recover(&mut self, persistence: &Persistence) -> BrokerResult<()> {
        let limits = self.limits();
        let router = self.router.get_mut().unwrap_or_else(PoisonError::into_inner);
        for record in persistence.load_exchanges()? {
            router.declare_exchange(&record.name, record.kind, record.options)?;
        }

        let mut keep = HashSet::new();
        let mut restored = 0;
        let queues = self.queues.get_mut().unwrap_or_else(PoisonError::into_inner);
        for record in persistence.load_queues()? {
            let mut queue = Queue::new(&record.name, record.options);
            for entry in persistence.load_entries(&record.name)? {
                // a message routed to several queues is loaded once and shared
                let message = match self.store.get(&entry.message_id) {
                    Some(message) => message,
                    None => match persistence.load_message(&entry.message_id)? {
                        Some(message) => Arc::new(message),
                        None => continue,
                    },
                };
                self.store.retain(&message, 1);
                keep.insert(message.id);
                queue.restore(QueuedMessage {
                    message,
                    enqueued_at: entry.enqueued_at,
                    expires_at: entry.expires_at,
                    redelivery_count: entry.redelivery_count,
                });
                restored += 1;
            }
            router.register_queue(&record.name);
            let state = QueueState {
                queue,
                deliveries: DeliveryManager::new(
                    limits,
                    self.tags.clone(),
                    self.delivery_index.clone(),
                ),
                had_consumer: false,
            };
            queues.insert(record.name, Arc::new(Mutex::new(state)));
        }

        for record in persistence.load_bindings()? {
            let binding =
                Binding::new(&record.queue, &record.routing_key).with_arguments(record.arguments);
            if let Err(err) = router.bind(&record.exchange, binding) {
                warn!(
                    exchange = %record.exchange,
                    queue = %record.queue,
                    error = %err,
                    "stale binding skipped"
                );
            }
        }

        let pruned = persistence.prune_messages(&keep)?;
        info!(
            exchanges = router.exchanges().count(),
            queues = queues.len(),
            messages = restored,
            pruned,
            "journal replayed"
        );
        Ok(())
    }
}

fn journaled(result: PersistenceResult<()>) {
    if let Err(err) = result {
        warn!(error = %err, "journal write failed");
    }
}
