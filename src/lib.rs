//! # PopMQ
//!
//! `popmq` is an AMQP-style message broker. Producers publish to named
//! exchanges, which route messages into queues through bindings; consumers
//! receive from queues with prefetch limits and explicit acknowledgments.
//! Queues support priorities, TTLs, length limits and dead-lettering, and
//! durable state can be journaled to disk.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, queues, routing, delivery tracking and the
//!   connection/channel API over them.
//! - `client`: the transport's view of a connected WebSocket peer.
//! - `config`: loading server, broker and logging settings.
//! - `persistence`: the `sled` journal behind durable declarations and
//!   persistent messages.
//! - `transport`: the JSON-over-WebSocket protocol and server.
//! - `utils`: the error type, logging setup and lock helpers.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
