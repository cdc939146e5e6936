use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::{broadcast, mpsc};

use super::connection::{Channel, Connection};
use super::delivery::{
    AckMode, Blocked, DeliverOutcome, Delivery, DeliveryLimits, DeliveryManager, DeliveryState,
    TagIndex,
};
use super::engine::{Broker, ConsumeOptions, now_ms};
use super::events::{BrokerEvent, Effects};
use super::exchange::{Binding, BindingArguments, ExchangeKind, ExchangeOptions, MatchMode};
use super::message::{
    DEATH_COUNT_HEADER, DEATH_QUEUE_HEADER, DeadLetterReason, HeaderValue, Headers, Message,
};
use super::queue::{DeadLetterTarget, OverflowPolicy, Queue, QueueOptions};
use super::router::ExchangeRouter;
use super::store::MessageStore;
use super::topic::{TopicPattern, topic_matches};
use crate::config::BrokerSettings;
use crate::persistence::Persistence;

fn settings() -> BrokerSettings {
    BrokerSettings {
        max_redeliveries: 3,
        consumer_timeout_ms: 1000,
        ..BrokerSettings::default()
    }
}

fn broker() -> Arc<Broker> {
    Arc::new(Broker::new(settings()))
}

fn open(broker: &Arc<Broker>) -> (Connection, Channel) {
    let conn = broker.connect("tester").unwrap();
    let ch = conn.open_channel().unwrap();
    (conn, ch)
}

fn text(delivery: &Delivery) -> &str {
    std::str::from_utf8(&delivery.message.payload).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<BrokerEvent>) -> Vec<BrokerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), HeaderValue::from(*v)))
        .collect()
}

#[test]
fn test_topic_pattern_matching() {
    let pattern = TopicPattern::new("logs.*.error");
    assert!(pattern.matches("logs.auth.error"));
    assert!(!pattern.matches("logs.auth.warn.error"));
    assert!(!pattern.matches("logs.error"));

    assert!(topic_matches("logs.#", "logs"));
    assert!(topic_matches("logs.#", "logs.a.b.c"));
    assert!(topic_matches("#", ""));
    assert!(topic_matches("a.#.b", "a.b"));
    assert!(topic_matches("a.#.b", "a.x.y.b"));
    assert!(!topic_matches("a.#.b", "a.x.y"));
    assert!(!topic_matches("*", ""));
}

#[test]
fn test_topic_many_hashes_match_quickly() {
    let pattern = TopicPattern::new("#.a.#.a.#.a.#.a.#.a.#.a.#.a.#.b");
    let key = vec!["a"; 200].join(".");

    let started = std::time::Instant::now();
    assert!(!pattern.matches(&key));
    assert!(pattern.matches(&format!("{key}.b")));
    assert!(pattern.matches("a.a.a.a.a.a.a.b"));
    assert!(!pattern.matches("a.a.a.a.a.a.b"));
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
}

#[test]
fn test_topic_routing_selects_matching_key_only() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("logs", ExchangeKind::Topic, ExchangeOptions::default())
        .unwrap();
    ch.declare_queue("errors", QueueOptions::default()).unwrap();
    ch.bind("errors", "logs", "logs.*.error", BindingArguments::default())
        .unwrap();

    for key in ["logs.auth.error", "logs.auth.warn.error", "logs.error"] {
        ch.publish("logs", key, Message::new(key), false).unwrap();
    }

    assert_eq!(broker.queue_info("errors").unwrap().messages, 1);
    let d = ch.get("errors", AckMode::Auto).unwrap().unwrap();
    assert_eq!(d.message.routing_key, "logs.auth.error");
}

#[test]
fn test_direct_routing() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("tasks", ExchangeKind::Direct, ExchangeOptions::default())
        .unwrap();
    ch.declare_queue("emails", QueueOptions::default()).unwrap();
    ch.bind("emails", "tasks", "email", BindingArguments::default())
        .unwrap();

    let outcome = ch.publish("tasks", "email", Message::new("hi"), false).unwrap();
    assert_eq!(outcome.queues, vec!["emails".to_string()]);

    let outcome = ch.publish("tasks", "sms", Message::new("hi"), false).unwrap();
    assert!(outcome.queues.is_empty());
    assert!(ch.is_open());
}

#[test]
fn test_fanout_gives_independent_references() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("events", ExchangeKind::Fanout, ExchangeOptions::default())
        .unwrap();
    for q in ["a", "b", "c"] {
        ch.declare_queue(q, QueueOptions::default()).unwrap();
        ch.bind(q, "events", "", BindingArguments::default()).unwrap();
    }

    let outcome = ch
        .publish("events", "ignored", Message::new("tick"), false)
        .unwrap();
    assert_eq!(outcome.queues.len(), 3);
    assert_eq!(broker.stored_messages(), 1);

    let deliveries: Vec<Delivery> = ["a", "b", "c"]
        .iter()
        .map(|q| ch.get(q, AckMode::Manual).unwrap().unwrap())
        .collect();
    let tags: HashSet<u64> = deliveries.iter().map(|d| d.delivery_tag).collect();
    assert_eq!(tags.len(), 3);

    ch.ack(deliveries[0].delivery_tag, false).unwrap();
    ch.ack(deliveries[1].delivery_tag, false).unwrap();
    assert_eq!(broker.stored_messages(), 1);
    assert_eq!(broker.queue_info("c").unwrap().unacked, 1);

    let settled = ch.ack(deliveries[2].delivery_tag, false).unwrap();
    assert_eq!(settled[0].state, DeliveryState::Acked);
    assert_eq!(broker.stored_messages(), 0);
}

#[test]
fn test_headers_exchange_all_and_any() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("docs", ExchangeKind::Headers, ExchangeOptions::default())
        .unwrap();
    ch.declare_queue("reports", QueueOptions::default()).unwrap();
    ch.declare_queue("either", QueueOptions::default()).unwrap();

    let mut all = headers(&[("format", "pdf"), ("type", "report")]);
    all.insert("x-note".into(), HeaderValue::from("ignored"));
    ch.bind(
        "reports",
        "docs",
        "",
        BindingArguments::headers(MatchMode::All, all),
    )
    .unwrap();
    ch.bind(
        "either",
        "docs",
        "",
        BindingArguments::headers(MatchMode::Any, headers(&[("format", "pdf"), ("type", "log")])),
    )
    .unwrap();

    let full = Message::new("1").with_headers(headers(&[("format", "pdf"), ("type", "report")]));
    let outcome = ch.publish("docs", "", full, false).unwrap();
    let routed: HashSet<String> = outcome.queues.into_iter().collect();
    assert_eq!(routed, HashSet::from(["reports".to_string(), "either".to_string()]));

    let partial = Message::new("2").with_header("format", "pdf");
    let outcome = ch.publish("docs", "", partial, false).unwrap();
    assert_eq!(outcome.queues, vec!["either".to_string()]);

    let other = Message::new("3").with_header("type", "log");
    let outcome = ch.publish("docs", "", other, false).unwrap();
    assert_eq!(outcome.queues, vec!["either".to_string()]);
}

#[test]
fn test_alternate_exchange_receives_unroutable() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("unrouted", ExchangeKind::Fanout, ExchangeOptions::default())
        .unwrap();
    ch.declare_exchange(
        "main",
        ExchangeKind::Direct,
        ExchangeOptions::default().with_alternate_exchange("unrouted"),
    )
    .unwrap();
    ch.declare_queue("lost", QueueOptions::default()).unwrap();
    ch.bind("lost", "unrouted", "", BindingArguments::default())
        .unwrap();

    let outcome = ch.publish("main", "nobody", Message::new("x"), true).unwrap();
    assert_eq!(outcome.queues, vec!["lost".to_string()]);
}

#[test]
fn test_mandatory_publish_unroutable() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    let mut events = broker.subscribe_events();
    ch.declare_exchange("void", ExchangeKind::Direct, ExchangeOptions::default())
        .unwrap();

    let err = ch.publish("void", "k", Message::new("x"), true).unwrap_err();
    assert_eq!(err.code(), "UNROUTABLE");
    assert!(ch.is_open());

    let outcome = ch.publish("void", "k", Message::new("x"), false).unwrap();
    assert!(outcome.queues.is_empty());

    let unroutable = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::Unroutable { .. }))
        .count();
    assert_eq!(unroutable, 2);
}

#[test]
fn test_priority_ordering() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("prio", QueueOptions::default()).unwrap();

    for p in [1u8, 5, 3] {
        let msg = Message::new(format!("p{p}")).with_priority(p);
        ch.publish("", "prio", msg, false).unwrap();
    }

    let order: Vec<String> = (0..3)
        .map(|_| text(&ch.get("prio", AckMode::Auto).unwrap().unwrap()).to_string())
        .collect();
    assert_eq!(order, vec!["p5", "p3", "p1"]);
}

#[test]
fn test_priority_clamped_to_queue_maximum() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("low", QueueOptions::default().max_priority(2))
        .unwrap();

    ch.publish("", "low", Message::new("first").with_priority(9), false)
        .unwrap();
    ch.publish("", "low", Message::new("second").with_priority(2), false)
        .unwrap();

    // both land in band 2, so FIFO decides
    let d = ch.get("low", AckMode::Auto).unwrap().unwrap();
    assert_eq!(text(&d), "first");
}

#[test]
fn test_max_length_dead_letters_oldest() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("DLQ", QueueOptions::default()).unwrap();
    ch.declare_queue(
        "Q",
        QueueOptions::default()
            .max_length(2)
            .dead_letter(DeadLetterTarget::queue("DLQ")),
    )
    .unwrap();

    for body in ["A", "B", "C"] {
        ch.publish("", "Q", Message::new(body), false).unwrap();
    }

    assert_eq!(broker.queue_info("Q").unwrap().messages, 2);
    let b = ch.get("Q", AckMode::Auto).unwrap().unwrap();
    let c = ch.get("Q", AckMode::Auto).unwrap().unwrap();
    assert_eq!((text(&b), text(&c)), ("B", "C"));

    let a = ch.get("DLQ", AckMode::Auto).unwrap().unwrap();
    assert_eq!(text(&a), "A");
    assert_eq!(a.message.death_reason(), Some("maxlen"));
    assert_eq!(
        a.message.headers.get(DEATH_QUEUE_HEADER),
        Some(&HeaderValue::from("Q"))
    );
    assert_eq!(a.message.death_count(), 1);
    assert!(ch.get("DLQ", AckMode::Auto).unwrap().is_none());
}

#[test]
fn test_reject_publish_overflow() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue(
        "strict",
        QueueOptions::default()
            .max_length(1)
            .overflow(OverflowPolicy::RejectPublish),
    )
    .unwrap();

    ch.publish("", "strict", Message::new("1"), false).unwrap();
    let err = ch.publish("", "strict", Message::new("2"), false).unwrap_err();
    assert_eq!(err.code(), "QUEUE_FULL");
    assert!(ch.is_open());
    assert_eq!(broker.queue_info("strict").unwrap().messages, 1);
    assert_eq!(broker.stored_messages(), 1);
}

#[test]
fn test_prefetch_one_withholds_second_delivery() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("work", QueueOptions::default()).unwrap();
    let mut consumer = ch.consume("work", 1, AckMode::Manual).unwrap();

    ch.publish("", "work", Message::new("one"), false).unwrap();
    ch.publish("", "work", Message::new("two"), false).unwrap();

    let first = consumer.try_recv().unwrap();
    assert_eq!(text(&first), "one");
    assert!(consumer.try_recv().is_none());
    assert_eq!(broker.queue_info("work").unwrap().messages, 1);

    ch.ack(first.delivery_tag, false).unwrap();
    let second = consumer.try_recv().unwrap();
    assert_eq!(text(&second), "two");
}

#[test]
fn test_same_consumer_tag_on_two_channels() {
    let broker = broker();
    let (conn, a) = open(&broker);
    let b = conn.open_channel().unwrap();
    a.declare_queue("jobs", QueueOptions::default()).unwrap();
    let options = ConsumeOptions::new(1, AckMode::Manual).with_tag("w");
    let mut on_a = a.consume_with("jobs", options.clone()).unwrap();
    let mut on_b = b.consume_with("jobs", options).unwrap();

    for body in ["m1", "m2", "m3", "m4"] {
        a.publish("", "jobs", Message::new(body), false).unwrap();
    }
    let m1 = on_a.try_recv().unwrap();
    assert_eq!(text(&m1), "m1");
    assert_eq!(text(&on_b.try_recv().unwrap()), "m2");

    a.ack(m1.delivery_tag, false).unwrap();
    let m3 = on_a.try_recv().unwrap();
    assert_eq!(text(&m3), "m3");

    // cancelling on b leaves a's consumer and its delivery alone
    b.cancel("w").unwrap();
    let info = broker.queue_info("jobs").unwrap();
    assert_eq!(info.consumers, 1);
    assert_eq!(info.unacked, 1);
    assert_eq!(info.messages, 2);
    assert!(on_a.try_recv().is_none());

    a.ack(m3.delivery_tag, false).unwrap();
    let m2 = on_a.try_recv().unwrap();
    assert_eq!(text(&m2), "m2");
    assert!(m2.redelivered());
    assert!(on_a.try_recv().is_none());

    a.ack(m2.delivery_tag, false).unwrap();
    let m4 = on_a.try_recv().unwrap();
    assert_eq!(text(&m4), "m4");
    a.ack(m4.delivery_tag, false).unwrap();
    assert_eq!(broker.queue_info("jobs").unwrap().messages, 0);
}

#[test]
fn test_delivery_state_follows_settlement() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("jobs", QueueOptions::default()).unwrap();
    ch.publish("", "jobs", Message::new("one"), false).unwrap();
    ch.publish("", "jobs", Message::new("two"), false).unwrap();

    let first = ch.get("jobs", AckMode::Manual).unwrap().unwrap();
    assert_eq!(
        broker.delivery_state("jobs", first.delivery_tag),
        Some(DeliveryState::Delivered)
    );

    ch.nack(first.delivery_tag, false, true).unwrap();
    assert_eq!(
        broker.delivery_state("jobs", first.delivery_tag),
        Some(DeliveryState::Pending)
    );

    // handed out again under a new tag
    let again = ch.get("jobs", AckMode::Manual).unwrap().unwrap();
    assert_eq!(again.message.id, first.message.id);
    assert_eq!(
        broker.delivery_state("jobs", first.delivery_tag),
        Some(DeliveryState::Requeued)
    );

    ch.ack(again.delivery_tag, false).unwrap();
    assert_eq!(
        broker.delivery_state("jobs", again.delivery_tag),
        Some(DeliveryState::Acked)
    );

    let second = ch.get("jobs", AckMode::Manual).unwrap().unwrap();
    ch.nack(second.delivery_tag, false, false).unwrap();
    assert_eq!(
        broker.delivery_state("jobs", second.delivery_tag),
        Some(DeliveryState::Discarded)
    );
    assert_eq!(broker.delivery_state("jobs", 9999), None);
}

#[test]
fn test_nack_requeue_counts_then_dead_letters() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    let mut events = broker.subscribe_events();
    ch.declare_queue("DLQ", QueueOptions::default()).unwrap();
    ch.declare_queue(
        "jobs",
        QueueOptions::default().dead_letter(DeadLetterTarget::queue("DLQ")),
    )
    .unwrap();
    ch.publish("", "jobs", Message::new("flaky"), false).unwrap();

    for expected in 0..3 {
        let d = ch.get("jobs", AckMode::Manual).unwrap().unwrap();
        assert_eq!(d.redelivery_count, expected);
        assert_eq!(d.redelivered(), expected > 0);
        let settled = ch.nack(d.delivery_tag, false, true).unwrap();
        assert_eq!(settled[0].state, DeliveryState::Requeued);
    }

    let last = ch.get("jobs", AckMode::Manual).unwrap().unwrap();
    assert_eq!(last.redelivery_count, 3);
    let settled = ch.nack(last.delivery_tag, false, true).unwrap();
    assert_eq!(settled[0].state, DeliveryState::DeadLettered);

    assert!(ch.get("jobs", AckMode::Auto).unwrap().is_none());
    let dead = ch.get("DLQ", AckMode::Auto).unwrap().unwrap();
    assert_eq!(text(&dead), "flaky");
    assert_eq!(dead.message.death_reason(), Some("rejected"));
    assert!(ch.get("DLQ", AckMode::Auto).unwrap().is_none());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        BrokerEvent::MaxRedeliveriesExceeded { redeliveries: 3, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        BrokerEvent::DeadLettered {
            reason: DeadLetterReason::Rejected,
            ..
        }
    )));
}

#[test]
fn test_nack_without_requeue_discards_without_target() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("plain", QueueOptions::default()).unwrap();
    ch.publish("", "plain", Message::new("bad"), false).unwrap();

    let d = ch.get("plain", AckMode::Manual).unwrap().unwrap();
    let settled = ch.nack(d.delivery_tag, false, false).unwrap();
    assert_eq!(settled[0].state, DeliveryState::Discarded);
    assert_eq!(broker.queue_info("plain").unwrap().messages, 0);
    assert_eq!(broker.stored_messages(), 0);
}

#[test]
fn test_multiple_ack_settles_up_to_tag() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("batch", QueueOptions::default()).unwrap();
    for i in 0..3 {
        ch.publish("", "batch", Message::new(format!("{i}")), false)
            .unwrap();
    }
    let tags: Vec<u64> = (0..3)
        .map(|_| ch.get("batch", AckMode::Manual).unwrap().unwrap().delivery_tag)
        .collect();

    let settled = ch.ack(tags[1], true).unwrap();
    assert_eq!(settled.len(), 2);
    assert_eq!(broker.queue_info("batch").unwrap().unacked, 1);

    let settled = ch.nack(tags[2], true, true).unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(broker.queue_info("batch").unwrap().messages, 1);
}

#[test]
fn test_queue_ttl_sweep_dead_letters_expired() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("DLQ", QueueOptions::default()).unwrap();
    ch.declare_queue(
        "ttl",
        QueueOptions::default()
            .message_ttl(Duration::from_secs(60))
            .dead_letter(DeadLetterTarget::queue("DLQ")),
    )
    .unwrap();
    ch.publish("", "ttl", Message::new("old"), false).unwrap();

    assert_eq!(broker.sweep_expired(now_ms()), 0);
    assert_eq!(broker.sweep_expired(now_ms() + 120_000), 1);

    let dead = ch.get("DLQ", AckMode::Auto).unwrap().unwrap();
    assert_eq!(dead.message.death_reason(), Some("expired"));
    assert_eq!(dead.message.ttl_ms, None);
}

#[test]
fn test_message_ttl_expires_lazily() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("short", QueueOptions::default()).unwrap();
    ch.publish(
        "",
        "short",
        Message::new("gone").with_ttl(Duration::from_millis(1)),
        false,
    )
    .unwrap();
    ch.publish("", "short", Message::new("kept"), false).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    let d = ch.get("short", AckMode::Auto).unwrap().unwrap();
    assert_eq!(text(&d), "kept");
    assert_eq!(broker.stored_messages(), 0);
}

#[test]
fn test_ack_timeout_requeues_delivery() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    let mut events = broker.subscribe_events();
    ch.declare_queue("slow", QueueOptions::default()).unwrap();
    let mut consumer = ch.consume("slow", 1, AckMode::Manual).unwrap();
    ch.publish("", "slow", Message::new("job"), false).unwrap();

    let first = consumer.try_recv().unwrap();
    assert_eq!(broker.expire_stale_deliveries(now_ms()), 0);
    assert_eq!(broker.expire_stale_deliveries(now_ms() + 5_000), 1);

    let again = consumer.try_recv().unwrap();
    assert_eq!(again.message.id, first.message.id);
    assert_eq!(again.redelivery_count, 1);
    assert_ne!(again.delivery_tag, first.delivery_tag);

    // the stale tag is gone
    let err = ch.ack(first.delivery_tag, false).unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");

    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        BrokerEvent::DeliveryTimeout { delivery_tag, .. } if *delivery_tag == first.delivery_tag
    )));
}

#[test]
fn test_cancel_requeues_outstanding() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("q", QueueOptions::default()).unwrap();
    let mut consumer = ch.consume("q", 10, AckMode::Manual).unwrap();
    ch.publish("", "q", Message::new("m"), false).unwrap();
    assert!(consumer.try_recv().is_some());

    ch.cancel(&consumer.tag).unwrap();
    assert!(consumer.try_recv().is_none());

    let info = broker.queue_info("q").unwrap();
    assert_eq!((info.messages, info.consumers, info.unacked), (1, 0, 0));
    let d = ch.get("q", AckMode::Auto).unwrap().unwrap();
    assert!(d.redelivered());

    let err = ch.cancel("no-such-consumer").unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn test_round_robin_between_consumers() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("rr", QueueOptions::default()).unwrap();
    let mut first = ch.consume("rr", 0, AckMode::Auto).unwrap();
    let mut second = ch.consume("rr", 0, AckMode::Auto).unwrap();

    for i in 0..4 {
        ch.publish("", "rr", Message::new(format!("{i}")), false)
            .unwrap();
    }

    let mut got = (0, 0);
    while first.try_recv().is_some() {
        got.0 += 1;
    }
    while second.try_recv().is_some() {
        got.1 += 1;
    }
    assert_eq!(got, (2, 2));
    assert_eq!(broker.stored_messages(), 0);
}

#[test]
fn test_channel_close_requeues_and_rejects_later_operations() {
    let broker = broker();
    let conn = broker.connect("tester").unwrap();
    let ch1 = conn.open_channel().unwrap();
    let ch2 = conn.open_channel().unwrap();
    ch1.declare_queue("q", QueueOptions::default()).unwrap();
    ch1.publish("", "q", Message::new("m"), false).unwrap();
    ch1.get("q", AckMode::Manual).unwrap().unwrap();

    assert_eq!(ch1.close().unwrap(), 1);
    let err = ch1.publish("", "q", Message::new("x"), false).unwrap_err();
    assert_eq!(err.code(), "CHANNEL_CLOSED");

    let d = ch2.get("q", AckMode::Auto).unwrap().unwrap();
    assert_eq!(d.redelivery_count, 1);
    assert_eq!(conn.channel_count(), 1);
}

#[test]
fn test_connection_lost_requeues_deliveries() {
    let broker = broker();
    let mut events = broker.subscribe_events();
    let (conn, ch) = open(&broker);
    ch.declare_queue("q", QueueOptions::default()).unwrap();
    ch.publish("", "q", Message::new("m"), false).unwrap();
    ch.get("q", AckMode::Manual).unwrap().unwrap();
    assert_eq!(broker.connection_count(), 1);

    drop(conn);

    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.queue_info("q").unwrap().messages, 1);
    let err = ch.get("q", AckMode::Auto).unwrap_err();
    assert_eq!(err.code(), "CONNECTION_CLOSED");
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        BrokerEvent::ConnectionLost { requeued: 1, .. }
    )));
}

#[test]
fn test_connection_limit() {
    let broker = Arc::new(Broker::new(BrokerSettings {
        max_connections: 1,
        ..settings()
    }));
    let first = broker.connect("a").unwrap();
    let err = broker.connect("b").unwrap_err();
    assert_eq!(err.code(), "ACCESS_REFUSED");

    assert_eq!(first.close(), 0);
    assert!(broker.connect("b").is_ok());
}

#[test]
fn test_idempotent_and_conflicting_declarations() {
    let broker = broker();
    let (conn, ch) = open(&broker);

    ch.declare_exchange("ex", ExchangeKind::Topic, ExchangeOptions::durable())
        .unwrap();
    ch.declare_exchange("ex", ExchangeKind::Topic, ExchangeOptions::durable())
        .unwrap();
    ch.declare_queue("q", QueueOptions::default().max_length(5))
        .unwrap();
    let again = ch
        .declare_queue("q", QueueOptions::default().max_length(5))
        .unwrap();
    assert_eq!(again.queue, "q");

    let err = ch
        .declare_queue("q", QueueOptions::default().max_length(6))
        .unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");
    assert!(!ch.is_open());

    let later = ch.declare_queue("other", QueueOptions::default()).unwrap_err();
    assert_eq!(later.code(), "CHANNEL_CLOSED");
    assert!(later.to_string().contains("precondition failed"));

    // the connection survives
    assert!(conn.is_open());
    let ch2 = conn.open_channel().unwrap();
    let err = ch2
        .declare_exchange("ex", ExchangeKind::Fanout, ExchangeOptions::durable())
        .unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");
    let ch3 = conn.open_channel().unwrap();
    assert!(ch3.declare_queue("other", QueueOptions::default()).is_ok());
}

#[test]
fn test_unknown_delivery_tag_closes_channel() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    let err = ch.ack(999, false).unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");
    assert!(!ch.is_open());
}

#[test]
fn test_reserved_and_generated_names() {
    let broker = broker();
    let (conn, ch) = open(&broker);
    let declared = ch.declare_queue("", QueueOptions::default()).unwrap();
    assert!(declared.queue.starts_with("amq.gen-"));

    let err = ch
        .declare_exchange("amq.direct", ExchangeKind::Direct, ExchangeOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), "ACCESS_REFUSED");

    let ch = conn.open_channel().unwrap();
    let err = ch.publish("missing", "k", Message::new("x"), false).unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn test_bind_declares_missing_queue() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_exchange("ex", ExchangeKind::Direct, ExchangeOptions::default())
        .unwrap();
    ch.bind("implicit", "ex", "k", BindingArguments::default())
        .unwrap();
    assert!(broker.queue_info("implicit").is_some());

    ch.unbind("implicit", "ex", "k", BindingArguments::default())
        .unwrap();
    let outcome = ch.publish("ex", "k", Message::new("x"), false).unwrap();
    assert!(outcome.queues.is_empty());
}

#[test]
fn test_delete_and_purge() {
    let broker = broker();
    let (conn, ch) = open(&broker);
    ch.declare_exchange("ex", ExchangeKind::Fanout, ExchangeOptions::default())
        .unwrap();
    ch.declare_queue("q", QueueOptions::default()).unwrap();
    ch.bind("q", "ex", "", BindingArguments::default()).unwrap();
    ch.publish("ex", "", Message::new("1"), false).unwrap();
    ch.publish("ex", "", Message::new("2"), false).unwrap();

    let err = ch.delete_exchange("ex", true).unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");

    let ch = conn.open_channel().unwrap();
    let err = ch.delete_queue("q", false, true).unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");

    let ch = conn.open_channel().unwrap();
    assert_eq!(ch.purge_queue("q").unwrap(), 2);
    assert_eq!(broker.stored_messages(), 0);
    assert_eq!(ch.delete_queue("q", true, true).unwrap(), 0);
    assert!(broker.queue_info("q").is_none());
    ch.delete_exchange("ex", true).unwrap();
    assert!(!broker.has_exchange("ex"));
}

#[test]
fn test_auto_delete_queue_removed_after_last_consumer() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("tmp", QueueOptions::default().auto_delete())
        .unwrap();
    let consumer = ch
        .consume_with("tmp", ConsumeOptions::new(1, AckMode::Manual).with_tag("mine"))
        .unwrap();
    assert_eq!(consumer.tag, "mine");

    ch.cancel("mine").unwrap();
    assert!(broker.queue_info("tmp").is_none());
}

#[test]
fn test_dead_letter_loop_is_bounded() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    let mut events = broker.subscribe_events();
    ch.declare_queue(
        "loop",
        QueueOptions::default()
            .max_length(0)
            .dead_letter(DeadLetterTarget::queue("loop")),
    )
    .unwrap();

    ch.publish("", "loop", Message::new("x"), false).unwrap();

    assert_eq!(broker.queue_info("loop").unwrap().messages, 0);
    assert_eq!(broker.stored_messages(), 0);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, BrokerEvent::DeadLetterDropped { .. })));
}

#[test]
fn test_maintenance_pass() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("ttl", QueueOptions::default().message_ttl(Duration::from_secs(1)))
        .unwrap();
    ch.declare_queue("held", QueueOptions::default()).unwrap();
    ch.publish("", "ttl", Message::new("a"), false).unwrap();
    ch.publish("", "held", Message::new("b"), false).unwrap();
    ch.get("held", AckMode::Manual).unwrap().unwrap();

    let report = broker.run_maintenance(now_ms() + 10_000);
    assert_eq!(report.expired, 1);
    assert_eq!(report.timed_out, 1);
    assert_eq!(broker.queue_info("held").unwrap().messages, 1);
}

#[test]
fn test_auto_delete_exchange_removed_from_journal() {
    let dir = tempdir().unwrap();
    let options = ExchangeOptions::durable().auto_delete();

    {
        let persistence = Persistence::open(dir.path()).unwrap();
        let broker = Broker::with_persistence(settings(), persistence).unwrap();
        broker.declare_queue("q", QueueOptions::durable()).unwrap();
        for exchange in ["by-unbind", "by-delete"] {
            broker
                .declare_exchange(exchange, ExchangeKind::Direct, options.clone())
                .unwrap();
            broker
                .bind("q", exchange, "k", BindingArguments::default())
                .unwrap();
        }
        broker.declare_queue("other", QueueOptions::durable()).unwrap();
        broker
            .bind("other", "by-delete", "k", BindingArguments::default())
            .unwrap();

        broker
            .unbind("q", "by-unbind", "k", BindingArguments::default())
            .unwrap();
        assert!(!broker.has_exchange("by-unbind"));

        broker.delete_queue("other", false, false).unwrap();
        assert!(broker.has_exchange("by-delete"));
        broker.delete_queue("q", false, false).unwrap();
        assert!(!broker.has_exchange("by-delete"));
        broker.flush().unwrap();
    }

    let persistence = Persistence::open(dir.path()).unwrap();
    assert!(persistence.load_exchanges().unwrap().is_empty());
    let broker = Broker::with_persistence(settings(), persistence).unwrap();
    assert!(!broker.has_exchange("by-unbind"));
    assert!(!broker.has_exchange("by-delete"));
}

#[test]
fn test_durable_fanout_message_restored_once() {
    let dir = tempdir().unwrap();
    let channel = (1, 1);

    {
        let persistence = Persistence::open(dir.path()).unwrap();
        let broker = Broker::with_persistence(settings(), persistence).unwrap();
        broker
            .declare_exchange("events", ExchangeKind::Fanout, ExchangeOptions::durable())
            .unwrap();
        for queue in ["audit", "billing"] {
            broker.declare_queue(queue, QueueOptions::durable()).unwrap();
            broker
                .bind(queue, "events", "", BindingArguments::default())
                .unwrap();
        }
        broker
            .publish("events", "", Message::new("shared").persistent(), false)
            .unwrap();
        broker.flush().unwrap();
    }

    let persistence = Persistence::open(dir.path()).unwrap();
    let broker = Broker::with_persistence(settings(), persistence).unwrap();
    assert_eq!(broker.stored_messages(), 1);

    let audit = broker.get(channel, "audit", AckMode::Auto).unwrap().unwrap();
    let billing = broker.get(channel, "billing", AckMode::Auto).unwrap().unwrap();
    assert!(Arc::ptr_eq(&audit.message, &billing.message));
    assert_eq!(broker.stored_messages(), 0);
}

#[test]
fn test_durable_restart_keeps_unacked_persistent_messages() {
    let dir = tempdir().unwrap();
    let channel = (1, 1);

    {
        let persistence = Persistence::open(dir.path()).unwrap();
        let broker = Broker::with_persistence(settings(), persistence).unwrap();
        broker
            .declare_exchange("orders", ExchangeKind::Direct, ExchangeOptions::durable())
            .unwrap();
        broker.declare_queue("durable", QueueOptions::durable()).unwrap();
        broker
            .declare_queue("transient", QueueOptions::default())
            .unwrap();
        broker
            .bind("durable", "orders", "new", BindingArguments::default())
            .unwrap();
        broker
            .bind("transient", "orders", "new", BindingArguments::default())
            .unwrap();

        for body in ["A", "B", "C"] {
            broker
                .publish("orders", "new", Message::new(body).persistent(), false)
                .unwrap();
        }
        broker
            .publish("orders", "new", Message::new("D"), false)
            .unwrap();

        let a = broker.get(channel, "durable", AckMode::Manual).unwrap().unwrap();
        assert_eq!(text(&a), "A");
        broker.ack(channel, a.delivery_tag, false).unwrap();
        // delivered but never acknowledged
        broker.get(channel, "durable", AckMode::Manual).unwrap().unwrap();

        broker.flush().unwrap();
    }

    let persistence = Persistence::open(dir.path()).unwrap();
    let broker = Broker::with_persistence(settings(), persistence).unwrap();
    assert!(broker.has_exchange("orders"));
    assert_eq!(broker.queue_names(), vec!["durable".to_string()]);
    assert_eq!(broker.queue_info("durable").unwrap().messages, 2);

    let survivors: Vec<String> = (0..2)
        .map(|_| {
            let d = broker.get(channel, "durable", AckMode::Auto).unwrap().unwrap();
            assert!(d.message.persistent);
            text(&d).to_string()
        })
        .collect();
    assert_eq!(survivors, vec!["B", "C"]);

    let outcome = broker
        .publish("orders", "new", Message::new("E"), false)
        .unwrap();
    assert_eq!(outcome.queues, vec!["durable".to_string()]);
}

#[test]
fn test_dead_letter_headers_accumulate() {
    let first = Message::new("x").routed("ex", "key");
    let once = first.dead_lettered("q1", DeadLetterReason::Expired, 0);
    let twice = once.dead_lettered("q2", DeadLetterReason::Rejected, 0);

    assert_ne!(once.id, first.id);
    assert_eq!(once.payload, first.payload);
    assert_eq!(once.death_count(), 1);
    assert_eq!(twice.death_count(), 2);
    assert_eq!(twice.death_reason(), Some("rejected"));
    assert_eq!(
        twice.headers.get(DEATH_COUNT_HEADER),
        Some(&HeaderValue::Int(2))
    );
}

#[tokio::test]
async fn test_consumer_resumes_when_message_arrives() {
    let broker = broker();
    let (_conn, ch) = open(&broker);
    ch.declare_queue("async", QueueOptions::default()).unwrap();
    let mut consumer = ch.consume("async", 1, AckMode::Manual).unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher
            .publish("", "async", Message::new("late"), false)
            .unwrap();
    });

    let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("delivery in time")
        .expect("consumer open");
    assert_eq!(text(&delivery), "late");
    assert_eq!(delivery.consumer_tag.as_deref(), Some(consumer.tag.as_str()));
    ch.ack(delivery.delivery_tag, false).unwrap();
    assert_eq!(broker.queue_info("async").unwrap().unacked, 0);
}

#[test]
fn test_store_counts_references() {
    let store = MessageStore::new();
    let msg = Arc::new(Message::new("shared"));
    store.retain(&msg, 2);
    store.retain(&msg, 1);
    assert_eq!(store.len(), 1);

    assert!(store.release(&msg.id).is_none());
    assert!(store.release(&msg.id).is_none());
    assert!(store.get(&msg.id).is_some());
    assert_eq!(store.release(&msg.id).unwrap().id, msg.id);
    assert_eq!(store.len(), 0);
    assert!(store.get(&msg.id).is_none());
    assert!(store.release(&msg.id).is_none());
}

#[test]
fn test_queue_requeued_entries_precede_fresh() {
    let mut queue = Queue::new("q", QueueOptions::default());
    let first = Arc::new(Message::new("first"));
    let second = Arc::new(Message::new("second"));
    let urgent = Arc::new(Message::new("urgent").with_priority(9));
    queue.enqueue(first.clone(), 0).unwrap();
    queue.enqueue(second.clone(), 0).unwrap();

    let mut expired = Vec::new();
    let mut head = queue.dequeue(0, &mut expired).unwrap();
    assert_eq!(head.message.id, first.id);
    head.redelivery_count = 1;
    queue.requeue(head);
    queue.enqueue(urgent.clone(), 0).unwrap();

    assert_eq!(queue.peek(0).unwrap().message.id, urgent.id);
    assert_eq!(queue.dequeue(0, &mut expired).unwrap().message.id, urgent.id);
    assert_eq!(queue.peek(0).unwrap().message.id, first.id);

    assert!(queue.contains(&second.id));
    assert!(queue.remove(&second.id).is_some());
    assert!(!queue.contains(&second.id));
    assert_eq!(queue.len(), 1);
    assert!(expired.is_empty());
}

#[test]
fn test_queue_ttl_is_minimum_of_message_and_queue() {
    let mut queue = Queue::new(
        "q",
        QueueOptions::default().message_ttl(Duration::from_millis(100)),
    );
    queue
        .enqueue(Arc::new(Message::new("short").with_ttl(Duration::from_millis(10))), 0)
        .unwrap();
    queue
        .enqueue(Arc::new(Message::new("long").with_ttl(Duration::from_secs(10))), 0)
        .unwrap();

    assert_eq!(queue.peek(0).unwrap().expires_at, Some(10));
    assert_eq!(queue.take_expired(50).len(), 1);
    assert_eq!(queue.take_expired(100).len(), 1);
    assert!(queue.is_empty());
}

#[test]
fn test_router_alternate_exchange_cycle_ends() {
    let mut router = ExchangeRouter::new();
    router
        .declare_exchange(
            "a",
            ExchangeKind::Direct,
            ExchangeOptions::default().with_alternate_exchange("b"),
        )
        .unwrap();
    router
        .declare_exchange(
            "b",
            ExchangeKind::Direct,
            ExchangeOptions::default().with_alternate_exchange("a"),
        )
        .unwrap();

    let msg = Message::new("x");
    assert!(router.route("a", &msg, "k").unwrap().is_empty());

    router.register_queue("q");
    router.bind("b", Binding::new("q", "k")).unwrap();
    let routes = router.route("a", &msg, "k").unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].queue, "q");
    assert_eq!(routes[0].binding_key, "k");

    let err = router.bind("", Binding::new("q", "k")).unwrap_err();
    assert_eq!(err.code(), "ACCESS_REFUSED");
}

#[test]
fn test_delivery_manager_prefetch_and_dead_consumer() {
    let index: TagIndex = Arc::new(Mutex::new(BTreeMap::new()));
    let limits = DeliveryLimits {
        max_redeliveries: 5,
        consumer_timeout_ms: None,
    };
    let mut manager = DeliveryManager::new(limits, Arc::new(AtomicU64::new(0)), index.clone());
    let mut queue = Queue::new("q", QueueOptions::default());
    let mut effects = Effects::default();
    let channel = (1, 1);

    let (tx, rx) = mpsc::unbounded_channel();
    manager.add_consumer("c1".into(), channel, 2, AckMode::Manual, tx);
    for body in ["a", "b", "c"] {
        queue.enqueue(Arc::new(Message::new(body)), 0).unwrap();
    }

    let DeliverOutcome::Delivered(first) =
        manager.deliver(&mut queue, channel, "c1", 0, &mut effects)
    else {
        panic!("expected a delivery");
    };
    assert_eq!(manager.state_of(&queue, first.delivery_tag), Some(DeliveryState::Delivered));
    assert!(index.lock().unwrap().contains_key(&first.delivery_tag));

    assert_eq!(manager.dispatch(&mut queue, 0, &mut effects), 1);
    assert_eq!(manager.outstanding(channel, "c1"), Some(2));
    assert!(matches!(
        manager.deliver(&mut queue, channel, "c1", 0, &mut effects),
        DeliverOutcome::Blocked(Blocked::PrefetchLimit)
    ));
    assert!(matches!(
        manager.deliver(&mut queue, channel, "nobody", 0, &mut effects),
        DeliverOutcome::Blocked(Blocked::NoSuchConsumer)
    ));
    assert_eq!(manager.consumers_of(channel), vec!["c1".to_string()]);

    manager
        .ack(&queue, channel, first.delivery_tag, false, &mut effects)
        .unwrap();
    assert_eq!(
        manager.state_of(&queue, first.delivery_tag),
        Some(DeliveryState::Acked)
    );
    assert!(!index.lock().unwrap().contains_key(&first.delivery_tag));
    assert_eq!(effects.released.len(), 1);

    // the receiver is gone: the next send fails and the consumer is dropped
    drop(rx);
    assert_eq!(manager.dispatch(&mut queue, 0, &mut effects), 0);
    assert!(!manager.has_consumer(channel, "c1"));
    assert_eq!(manager.unacked_count(), 0);
    assert_eq!(queue.len(), 2);
    assert!(index.lock().unwrap().is_empty());
}
