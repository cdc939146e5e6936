//! Client representation
//!
//! `Client` is one WebSocket peer as seen by the transport. It holds the
//! sending half of the per-peer outbound channel: broker replies and consumer
//! deliveries are all funnelled through it to the socket writer task.

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::ServerMessage;

#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub sender: UnboundedSender<WsMessage>,
    /// Set once a valid token was presented.
    pub authenticated: bool,
    /// Subject of the accepted token.
    pub user: Option<String>,
}

impl Client {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            authenticated: false,
            user: None,
        }
    }

    pub fn authenticate(&mut self, user: &str) {
        self.authenticated = true;
        self.user = Some(user.to_string());
    }

    /// Queue `message` for the socket. Returns `false` once the writer is
    /// gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                debug!(client = %self.id, error = %err, "unserializable frame dropped");
                return true;
            }
        };
        self.sender.send(WsMessage::Text(text.into())).is_ok()
    }
}
