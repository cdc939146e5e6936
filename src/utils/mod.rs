//! Shared utilities: the crate-wide error type and logging setup.

pub mod error;
pub mod logging;
pub mod sync;

pub use error::{BrokerError, BrokerResult, ErrorScope};
