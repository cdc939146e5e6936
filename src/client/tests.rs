use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use super::pubsub_client::Client;
use crate::transport::message::ServerMessage;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    assert!(!client.id.is_empty());
    assert!(!client.authenticated);
    assert_eq!(client.user, None);
}

#[test]
fn test_authenticate_records_user() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    client.authenticate("admin");
    assert!(client.authenticated);
    assert_eq!(client.user.as_deref(), Some("admin"));
}

#[test]
fn test_send_serializes_frame() {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    assert!(client.send(&ServerMessage::ChannelOpened { channel: 3 }));

    let frame = rx.try_recv().unwrap();
    let text = frame.to_text().unwrap();
    let value: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(value["type"], "channel_opened");
    assert_eq!(value["channel"], 3);
}

#[test]
fn test_send_after_writer_dropped() {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    drop(rx);
    assert!(!client.send(&ServerMessage::Authenticated {}));
}
