//! CLI for chatrelay
//!
//! Subcommands:
//! - `server`: run the relay
//! - `listen`: print a channel's history and live messages
//! - `post`: post one message to a channel
//! - `create`: create a channel

use std::process::ExitCode;
use std::sync::Arc;

use chatrelay::broker::{MemoryBroker, SubscriptionOptions};
use chatrelay::channel::{ChannelHub, SessionConfig};
use chatrelay::config::{Settings, load_config};
use chatrelay::transport::{ClientMessage, ServerMessage, start_websocket_server};
use chatrelay::utils::logging;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "chatrelay")]
enum Command {
    /// Start the relay server
    Server,
    /// Listen to a channel and print what arrives
    Listen {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        channel: String,
    },
    /// Post a single message
    Post {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        message: String,
    },
    /// Create a channel
    Create {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        channel: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match Command::parse() {
        Command::Server => run_server(settings).await,
        Command::Listen { url, channel } => {
            run_client(&url, vec![ClientMessage::Listen { channel }], true).await
        }
        Command::Post {
            url,
            channel,
            message,
        } => run_client(&url, vec![ClientMessage::Post { channel, message }], false).await,
        Command::Create { url, channel } => {
            run_client(&url, vec![ClientMessage::CreateChannel { channel }], false).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("chatrelay failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(MemoryBroker::open(settings.broker.data_path())?);
    let hub = Arc::new(ChannelHub::new(
        broker,
        SessionConfig {
            history_capacity: settings.channel.history_capacity,
            preload: settings.channel.preload(),
            subscription: SubscriptionOptions {
                ordered: settings.broker.ordered,
            },
        },
    ));

    let addr = settings.server.addr();
    tokio::select! {
        res = start_websocket_server(addr, hub.clone(), settings.clone()) => {
            res?;
            hub.shutdown();
            return Err("WebSocket server exited unexpectedly".into());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    hub.shutdown();
    Ok(())
}

/// Sends `requests`, prints replies. With `follow`, keeps printing until the
/// server closes the connection.
async fn run_client(
    url: &str,
    requests: Vec<ClientMessage>,
    follow: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;

    for request in &requests {
        ws_stream
            .send(WsMessage::Text(serde_json::to_string(request)?.into()))
            .await?;
    }

    let mut replies = 0;
    while let Some(frame) = ws_stream.next().await {
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::History { channel, messages }) => {
                for m in messages {
                    println!("[{channel}] {} {}: {}", m.timestamp(), m.author(), m.text());
                }
            }
            Ok(ServerMessage::Message {
                channel,
                author,
                message,
                timestamp,
            }) => println!("[{channel}] {timestamp} {author}: {message}"),
            Ok(other) => println!("{other:?}"),
            Err(_) => println!("{text}"),
        }

        replies += 1;
        if !follow && replies >= requests.len() {
            break;
        }
    }

    Ok(())
}
