//! CLI for PopMQ
//!
//! Subcommands:
//! - `server`: run the broker behind the WebSocket server
//! - `client`: run a small scripted client (useful for smoke tests)

use std::sync::Arc;

use clap::Parser;
use popmq::broker::Broker;
use popmq::config::load_config;
use popmq::transport::websocket::start_websocket_server;
use popmq::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popmq")]
enum Command {
    /// Start the broker and its WebSocket server
    Server,
    /// Run the example client (login, auth, declare, publish, consume, ack)
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "admin")]
        username: String,
        #[arg(long, default_value = "password")]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {e}");
            }
        }
        Command::Client {
            url,
            username,
            password,
        } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &username, &password).await {
                error!("Client failed: {e}");
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init(&config.log.level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::open(config.broker.clone())?);

    tokio::spawn(Broker::start_maintenance_loop(broker.clone()));

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone(), config.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.flush()?;
    Ok(())
}

async fn run_client(
    url: &str,
    username: &str,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let mut frames = vec![json!({ "type": "login", "username": username, "password": password })];
    let mut step = 0;
    while let Some(frame) = frames.pop() {
        ws_stream
            .send(WsMessage::Text(frame.to_string().into()))
            .await?;

        let Some(Ok(WsMessage::Text(reply))) = ws_stream.next().await else {
            break;
        };
        println!("< {reply}");
        let reply: Value = serde_json::from_str(&reply)?;
        if reply["type"] == "error" {
            break;
        }

        step += 1;
        let next = match step {
            1 => json!({ "type": "auth", "token": reply["token"] }),
            2 => json!({ "type": "open_channel" }),
            3 => json!({ "type": "declare_queue", "channel": reply["channel"], "queue": "demo" }),
            4 => json!({
                "type": "publish",
                "channel": reply["channel"],
                "routing_key": "demo",
                "payload": "Hello from popmq",
            }),
            5 => json!({
                "type": "get",
                "channel": reply["channel"],
                "queue": "demo",
                "ack_mode": "manual",
            }),
            6 if reply["type"] == "deliver" => json!({
                "type": "ack",
                "channel": reply["channel"],
                "delivery_tag": reply["delivery_tag"],
            }),
            _ => break,
        };
        frames.push(next);
    }

    Ok(())
}
