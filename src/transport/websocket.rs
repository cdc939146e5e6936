//! WebSocket transport
//!
//! Translates JSON frames into channel operations on the broker. Each socket
//! is one broker `Connection`; its channels are opened with `open_channel`
//! frames and addressed by id afterwards.
//!
//! Clients must `login`, then `auth` with the returned token, before anything
//! else. A frame sent before authentication, or a bad token, closes the
//! socket. Closing the socket without closing the connection counts as a lost
//! connection: everything the peer held is requeued.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::{Channel, Connection};
use crate::broker::engine::{Broker, ConsumeOptions};
use crate::broker::message::Message;
use crate::client::Client;
use crate::config::Settings;
use crate::transport::message::{Claims, ClientMessage, ServerMessage};
use crate::utils::{BrokerError, BrokerResult, ErrorScope};

/// Binds `addr` and serves connections until the listener fails.
pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Broker>,
    settings: Settings,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, broker, settings).await;
    Ok(())
}

/// Accepts connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, settings: Settings) {
    let settings = Arc::new(settings);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp connection accepted");
                spawn(handle_connection(stream, broker.clone(), settings.clone()));
            }
            Err(e) => {
                error!("accept failed: {e}");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, broker: Arc<Broker>, settings: Arc<Settings>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    let client_id = client.id.clone();

    let writer = {
        let client_id = client_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(client = %client_id, "failed to send frame: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!(client = %client_id, "send loop closed");
        })
    };

    let mut session = Session::new(client, broker, settings);
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };
        if session.handle(text) == Flow::Close {
            break;
        }
    }

    session.end();
    drop(session);
    let _ = writer.await;
    info!(client = %client_id, "client disconnected");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-socket state: the authenticated connection and its open channels.
struct Session {
    client: Client,
    broker: Arc<Broker>,
    settings: Arc<Settings>,
    connection: Option<Connection>,
    channels: HashMap<u16, Channel>,
}

impl Session {
    fn new(client: Client, broker: Arc<Broker>, settings: Arc<Settings>) -> Self {
        Self {
            client,
            broker,
            settings,
            connection: None,
            channels: HashMap::new(),
        }
    }

    fn handle(&mut self, text: &str) -> Flow {
        let frame = match serde_json::from_str::<ClientMessage>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    client = %self.client.id,
                    "invalid client message: {err} | {}",
                    text.chars().take(100).collect::<String>()
                );
                self.reply(ServerMessage::protocol_error("BAD_REQUEST", err.to_string()));
                return Flow::Continue;
            }
        };

        match frame {
            ClientMessage::Login { username, password } => self.login(&username, &password),
            ClientMessage::Auth { token } => self.authenticate(&token),
            _ if !self.client.authenticated => {
                warn!(client = %self.client.id, "message before authentication");
                self.reply(ServerMessage::protocol_error(
                    "ACCESS_REFUSED",
                    "must authenticate first",
                ));
                Flow::Close
            }
            frame => self.dispatch(frame),
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Flow {
        let server = &self.settings.server;
        if username != server.username || password != server.password {
            self.reply(ServerMessage::protocol_error(
                "ACCESS_REFUSED",
                "invalid credentials",
            ));
            return Flow::Continue;
        }

        let claims = Claims {
            sub: username.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize,
        };
        let key = EncodingKey::from_secret(server.jwt_secret.as_ref());
        match encode(&Header::default(), &claims, &key) {
            Ok(token) => self.reply(ServerMessage::LoginResponse { token }),
            Err(err) => {
                error!(client = %self.client.id, "token signing failed: {err}");
                self.reply(ServerMessage::protocol_error("INTERNAL_ERROR", "login failed"));
            }
        }
        Flow::Continue
    }

    fn authenticate(&mut self, token: &str) -> Flow {
        let key = DecodingKey::from_secret(self.settings.server.jwt_secret.as_ref());
        let claims = match decode::<Claims>(token, &key, &Validation::default()) {
            Ok(data) => data.claims,
            Err(err) => {
                warn!(client = %self.client.id, "authentication failed: {err}");
                self.reply(ServerMessage::protocol_error(
                    "ACCESS_REFUSED",
                    "authentication failed",
                ));
                return Flow::Close;
            }
        };

        if self.connection.is_none() {
            match self.broker.connect(&claims.sub) {
                Ok(conn) => self.connection = Some(conn),
                Err(err) => {
                    self.reply(ServerMessage::error(None, &err));
                    return Flow::Close;
                }
            }
        }
        self.client.authenticate(&claims.sub);
        info!(client = %self.client.id, user = %claims.sub, "authenticated");
        self.reply(ServerMessage::Authenticated {});
        Flow::Continue
    }

    fn dispatch(&mut self, frame: ClientMessage) -> Flow {
        match frame {
            ClientMessage::Login { .. } | ClientMessage::Auth { .. } => Flow::Continue,
            ClientMessage::OpenChannel => self.open_channel(),
            ClientMessage::CloseChannel { channel } => {
                let Some(ch) = self.channels.remove(&channel) else {
                    return self.unknown_channel(channel);
                };
                match ch.close() {
                    Ok(requeued) => {
                        debug!(client = %self.client.id, channel, requeued, "channel closed");
                        self.reply(ServerMessage::Ok { channel });
                        Flow::Continue
                    }
                    Err(err) => self.failed(channel, err),
                }
            }
            ClientMessage::DeclareExchange {
                channel,
                exchange,
                kind,
                options,
            } => self.on_channel(
                channel,
                |ch| ch.declare_exchange(&exchange, kind, options),
                |_| ServerMessage::Ok { channel },
            ),
            ClientMessage::DeleteExchange {
                channel,
                exchange,
                if_unused,
            } => self.on_channel(
                channel,
                |ch| ch.delete_exchange(&exchange, if_unused),
                |_| ServerMessage::Ok { channel },
            ),
            ClientMessage::DeclareQueue {
                channel,
                queue,
                options,
            } => self.on_channel(
                channel,
                |ch| ch.declare_queue(&queue, options),
                |declared| ServerMessage::QueueDeclared {
                    channel,
                    queue: declared.queue,
                    messages: declared.messages,
                    consumers: declared.consumers,
                },
            ),
            ClientMessage::DeleteQueue {
                channel,
                queue,
                if_unused,
                if_empty,
            } => self.on_channel(
                channel,
                |ch| ch.delete_queue(&queue, if_unused, if_empty),
                |messages| ServerMessage::Purged { channel, messages },
            ),
            ClientMessage::PurgeQueue { channel, queue } => self.on_channel(
                channel,
                |ch| ch.purge_queue(&queue),
                |messages| ServerMessage::Purged { channel, messages },
            ),
            ClientMessage::Bind {
                channel,
                queue,
                exchange,
                routing_key,
                arguments,
            } => self.on_channel(
                channel,
                |ch| ch.bind(&queue, &exchange, &routing_key, arguments),
                |_| ServerMessage::Ok { channel },
            ),
            ClientMessage::Unbind {
                channel,
                queue,
                exchange,
                routing_key,
                arguments,
            } => self.on_channel(
                channel,
                |ch| ch.unbind(&queue, &exchange, &routing_key, arguments),
                |_| ServerMessage::Ok { channel },
            ),
            ClientMessage::Publish {
                channel,
                exchange,
                routing_key,
                payload,
                headers,
                priority,
                ttl_ms,
                persistent,
                mandatory,
            } => {
                let mut message = Message::new(payload).with_headers(headers);
                if let Some(priority) = priority {
                    message = message.with_priority(priority);
                }
                message.ttl_ms = ttl_ms;
                message.persistent = persistent;
                self.on_channel(
                    channel,
                    |ch| ch.publish(&exchange, &routing_key, message, mandatory),
                    |outcome| ServerMessage::Published {
                        channel,
                        message_id: outcome.message_id,
                        queues: outcome.queues,
                    },
                )
            }
            ClientMessage::Consume {
                channel,
                queue,
                consumer_tag,
                prefetch,
                ack_mode,
            } => {
                let prefetch = prefetch.unwrap_or(self.broker.settings().default_prefetch);
                let mut options = ConsumeOptions::new(prefetch, ack_mode);
                options.tag = consumer_tag;
                self.consume(channel, &queue, options)
            }
            ClientMessage::Cancel {
                channel,
                consumer_tag,
            } => self.on_channel(
                channel,
                |ch| ch.cancel(&consumer_tag),
                |_| ServerMessage::Ok { channel },
            ),
            ClientMessage::Get {
                channel,
                queue,
                ack_mode,
            } => self.on_channel(
                channel,
                |ch| ch.get(&queue, ack_mode),
                |delivery| match delivery {
                    Some(delivery) => ServerMessage::deliver(channel, &delivery),
                    None => ServerMessage::GetEmpty { channel },
                },
            ),
            ClientMessage::Ack {
                channel,
                delivery_tag,
                multiple,
            } => self.on_channel(
                channel,
                |ch| ch.ack(delivery_tag, multiple),
                |settled| ServerMessage::Settled {
                    channel,
                    count: settled.len(),
                },
            ),
            ClientMessage::Nack {
                channel,
                delivery_tag,
                multiple,
                requeue,
            } => self.on_channel(
                channel,
                |ch| ch.nack(delivery_tag, multiple, requeue),
                |settled| ServerMessage::Settled {
                    channel,
                    count: settled.len(),
                },
            ),
        }
    }

    fn open_channel(&mut self) -> Flow {
        let Some(conn) = &self.connection else {
            return Flow::Close;
        };
        match conn.open_channel() {
            Ok(ch) => {
                let channel = ch.id();
                self.channels.insert(channel, ch);
                self.reply(ServerMessage::ChannelOpened { channel });
                Flow::Continue
            }
            Err(err) => {
                self.reply(ServerMessage::error(None, &err));
                Flow::Continue
            }
        }
    }

    /// Registers the consumer and forwards its deliveries to the socket.
    fn consume(&mut self, channel: u16, queue: &str, options: ConsumeOptions) -> Flow {
        let Some(ch) = self.channels.get(&channel) else {
            return self.unknown_channel(channel);
        };
        let mut consumer = match ch.consume_with(queue, options) {
            Ok(consumer) => consumer,
            Err(err) => return self.failed(channel, err),
        };
        self.reply(ServerMessage::ConsumeOk {
            channel,
            consumer_tag: consumer.tag.clone(),
        });

        let client = self.client.clone();
        spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                if !client.send(&ServerMessage::deliver(channel, &delivery)) {
                    break;
                }
            }
            debug!(client = %client.id, consumer = %consumer.tag, "consumer forwarder stopped");
        });
        Flow::Continue
    }

    fn on_channel<T>(
        &mut self,
        channel: u16,
        op: impl FnOnce(&Channel) -> BrokerResult<T>,
        ok: impl FnOnce(T) -> ServerMessage,
    ) -> Flow {
        let Some(ch) = self.channels.get(&channel) else {
            return self.unknown_channel(channel);
        };
        match op(ch) {
            Ok(value) => {
                self.reply(ok(value));
                Flow::Continue
            }
            Err(err) => self.failed(channel, err),
        }
    }

    /// Reports `err` with the effect its scope had on the channel.
    fn failed(&mut self, channel: u16, err: BrokerError) -> Flow {
        match err.scope() {
            ErrorScope::Operation => {
                self.reply(ServerMessage::error(Some(channel), &err));
                Flow::Continue
            }
            ErrorScope::Channel => {
                self.channels.remove(&channel);
                self.reply(ServerMessage::error(Some(channel), &err));
                self.reply(ServerMessage::ChannelClosed {
                    channel,
                    reason: err.to_string(),
                });
                Flow::Continue
            }
            ErrorScope::Connection => {
                self.reply(ServerMessage::error(Some(channel), &err));
                Flow::Close
            }
        }
    }

    fn unknown_channel(&mut self, channel: u16) -> Flow {
        let err = BrokerError::not_found("channel", &channel.to_string());
        self.reply(ServerMessage::error(Some(channel), &err));
        Flow::Continue
    }

    fn reply(&self, message: ServerMessage) {
        if !self.client.send(&message) {
            debug!(client = %self.client.id, "reply dropped, writer gone");
        }
    }

    /// Tears the broker connection down when the socket goes away.
    fn end(&mut self) {
        self.channels.clear();
        if let Some(conn) = self.connection.take() {
            if conn.is_open() {
                let requeued = conn.abort();
                debug!(client = %self.client.id, requeued, "connection aborted");
            }
        }
    }
}
