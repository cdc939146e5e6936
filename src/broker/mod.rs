//! The broker core.
//!
//! Leaves first: `message` and `store` hold published messages, `queue` is
//! the priority-FIFO buffer, `exchange`/`router`/`topic` decide which queues
//! get a message, `delivery` tracks what consumers hold, and `engine` plus
//! `connection` compose them behind the channel API.

pub mod connection;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod router;
pub mod store;
pub mod topic;

pub use connection::{Channel, Connection};
pub use delivery::{AckMode, Delivery, DeliveryState, Settlement};
pub use engine::{Broker, ConsumeOptions, Consumer, PublishOutcome, QueueDeclared, QueueInfo};
pub use events::BrokerEvent;
pub use exchange::{BindingArguments, ExchangeKind, ExchangeOptions, MatchMode};
pub use message::{DeadLetterReason, HeaderValue, Headers, Message};
pub use queue::{DeadLetterTarget, OverflowPolicy, QueueOptions};

#[cfg(test)]
mod tests;
