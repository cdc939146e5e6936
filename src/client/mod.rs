//! The `client` module holds the transport's view of a connected peer.

pub mod pubsub_client;
pub use pubsub_client::Client;

#[cfg(test)]
mod tests;
