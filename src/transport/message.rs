//! Wire protocol
//!
//! Every frame is a JSON text message tagged by `type`. Clients log in, then
//! authenticate with the returned token, then open channels and issue broker
//! operations against them. Replies carry the channel they answer.

use serde::{Deserialize, Serialize};

use crate::broker::delivery::{AckMode, Delivery, DeliveryTag};
use crate::broker::exchange::{BindingArguments, ExchangeKind, ExchangeOptions};
use crate::broker::message::{Headers, MessageId};
use crate::broker::queue::QueueOptions;
use crate::utils::BrokerError;

fn default_requeue() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
        password: String,
    },
    Auth {
        token: String,
    },
    OpenChannel,
    CloseChannel {
        channel: u16,
    },
    DeclareExchange {
        channel: u16,
        exchange: String,
        kind: ExchangeKind,
        #[serde(default)]
        options: ExchangeOptions,
    },
    DeleteExchange {
        channel: u16,
        exchange: String,
        #[serde(default)]
        if_unused: bool,
    },
    DeclareQueue {
        channel: u16,
        #[serde(default)]
        queue: String,
        #[serde(default)]
        options: QueueOptions,
    },
    DeleteQueue {
        channel: u16,
        queue: String,
        #[serde(default)]
        if_unused: bool,
        #[serde(default)]
        if_empty: bool,
    },
    PurgeQueue {
        channel: u16,
        queue: String,
    },
    Bind {
        channel: u16,
        queue: String,
        exchange: String,
        #[serde(default)]
        routing_key: String,
        #[serde(default)]
        arguments: BindingArguments,
    },
    Unbind {
        channel: u16,
        queue: String,
        exchange: String,
        #[serde(default)]
        routing_key: String,
        #[serde(default)]
        arguments: BindingArguments,
    },
    Publish {
        channel: u16,
        #[serde(default)]
        exchange: String,
        #[serde(default)]
        routing_key: String,
        payload: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        ttl_ms: Option<u64>,
        #[serde(default)]
        persistent: bool,
        #[serde(default)]
        mandatory: bool,
    },
    Consume {
        channel: u16,
        queue: String,
        #[serde(default)]
        consumer_tag: Option<String>,
        #[serde(default)]
        prefetch: Option<u16>,
        #[serde(default)]
        ack_mode: AckMode,
    },
    Cancel {
        channel: u16,
        consumer_tag: String,
    },
    Get {
        channel: u16,
        queue: String,
        #[serde(default)]
        ack_mode: AckMode,
    },
    Ack {
        channel: u16,
        delivery_tag: DeliveryTag,
        #[serde(default)]
        multiple: bool,
    },
    Nack {
        channel: u16,
        delivery_tag: DeliveryTag,
        #[serde(default)]
        multiple: bool,
        #[serde(default = "default_requeue")]
        requeue: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginResponse {
        token: String,
    },
    Authenticated {},
    ChannelOpened {
        channel: u16,
    },
    Ok {
        channel: u16,
    },
    QueueDeclared {
        channel: u16,
        queue: String,
        messages: usize,
        consumers: usize,
    },
    Published {
        channel: u16,
        message_id: MessageId,
        queues: Vec<String>,
    },
    ConsumeOk {
        channel: u16,
        consumer_tag: String,
    },
    Deliver(DeliverFrame),
    GetEmpty {
        channel: u16,
    },
    Settled {
        channel: u16,
        count: usize,
    },
    Purged {
        channel: u16,
        messages: usize,
    },
    ChannelClosed {
        channel: u16,
        reason: String,
    },
    Error {
        #[serde(default)]
        channel: Option<u16>,
        code: String,
        message: String,
    },
}

/// A message pushed to a consumer or returned by `get`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeliverFrame {
    pub channel: u16,
    #[serde(default)]
    pub consumer_tag: Option<String>,
    pub delivery_tag: DeliveryTag,
    pub message_id: MessageId,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: String,
    #[serde(default)]
    pub headers: Headers,
    pub priority: u8,
    pub redelivered: bool,
    pub redelivery_count: u32,
    pub timestamp: i64,
}

impl ServerMessage {
    pub fn deliver(channel: u16, delivery: &Delivery) -> Self {
        let message = &delivery.message;
        ServerMessage::Deliver(DeliverFrame {
            channel,
            consumer_tag: delivery.consumer_tag.clone(),
            delivery_tag: delivery.delivery_tag,
            message_id: message.id,
            queue: delivery.queue.clone(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            headers: message.headers.clone(),
            priority: message.priority,
            redelivered: delivery.redelivered(),
            redelivery_count: delivery.redelivery_count,
            timestamp: message.timestamp,
        })
    }

    pub fn error(channel: Option<u16>, err: &BrokerError) -> Self {
        ServerMessage::Error {
            channel,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// An error outside the broker's error codes (protocol or auth).
    pub fn protocol_error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            channel: None,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// JWT claims issued at login.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}
