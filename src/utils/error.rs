//! Error types shared across the broker.
//!
//! `BrokerError` is what channel operations return. Each variant carries a
//! stable protocol code (`UNROUTABLE`, `PRECONDITION_FAILED`, ...) and a
//! scope: channel-level errors close the offending channel only, while
//! connection-level errors tear down the whole connection.
//!
//! Policy outcomes such as eviction, expiry or dead-lettering are not errors;
//! they are reported as `BrokerEvent`s.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Reported to the caller; the channel stays open.
    Operation,
    /// Closes the channel that issued the operation.
    Channel,
    /// Closes the connection and requeues all of its work.
    Connection,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("message published to '{exchange}' with key '{routing_key}' matched no binding")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("queue '{queue}' is full")]
    QueueFull { queue: String },

    #[error("no {kind} named '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("access refused: {0}")]
    AccessRefused(String),

    #[error("channel {channel} is closed: {reason}")]
    ChannelClosed { channel: u16, reason: String },

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl BrokerError {
    /// Protocol code used on the wire and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Unroutable { .. } => "UNROUTABLE",
            BrokerError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            BrokerError::QueueFull { .. } => "QUEUE_FULL",
            BrokerError::NotFound { .. } => "NOT_FOUND",
            BrokerError::AccessRefused(_) => "ACCESS_REFUSED",
            BrokerError::ChannelClosed { .. } => "CHANNEL_CLOSED",
            BrokerError::ConnectionClosed(_) => "CONNECTION_CLOSED",
            BrokerError::Persistence(_) => "PERSISTENCE",
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            BrokerError::Unroutable { .. } | BrokerError::QueueFull { .. } => ErrorScope::Operation,
            BrokerError::PreconditionFailed(_)
            | BrokerError::NotFound { .. }
            | BrokerError::AccessRefused(_)
            | BrokerError::ChannelClosed { .. } => ErrorScope::Channel,
            BrokerError::ConnectionClosed(_) | BrokerError::Persistence(_) => {
                ErrorScope::Connection
            }
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        BrokerError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(err: PersistenceError) -> Self {
        BrokerError::Persistence(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
