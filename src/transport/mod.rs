//! The `transport` module carries the broker over WebSockets.
//!
//! `message` defines the JSON frames exchanged with clients; `websocket`
//! runs the server, authenticates peers and maps frames onto channel
//! operations.

pub mod message;
pub mod websocket;
