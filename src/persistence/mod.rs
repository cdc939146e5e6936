//! The `persistence` module is the disk journal behind durable exchanges,
//! queues, bindings and persistent messages.
//!
//! It uses `sled` as an embedded key-value store. The broker writes through
//! it as state changes and replays it once on start (see
//! `Broker::with_persistence`).

pub mod sled_store;

pub use sled_store::{
    BindingRecord, EntryRecord, ExchangeRecord, Persistence, PersistenceError, PersistenceResult,
    QueueRecord,
};
