//! WebSocket transport
//!
//! Per connection:
//! - a `Client` with a generated guest name and an outbound frame queue,
//!   drained by a dedicated send task;
//! - a heartbeat task that pings every `server.heartbeat_secs`;
//! - one task per listened channel: attach to the hub (possibly waiting out
//!   the preload window), write the history frame, then forward live
//!   messages from the viewer sink.
//!
//! History for a channel is queued before any live frame for it because the
//! listen task writes it before it starts draining the sink. When the read
//! side ends, every viewer the connection registered is detached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::channel::{ChannelHub, ViewerId, ViewerSink};
use crate::client::Client;
use crate::config::Settings;
use crate::transport::message::{ClientMessage, ServerMessage};

pub async fn start_websocket_server(
    addr: String,
    hub: Arc<ChannelHub>,
    settings: Settings,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, hub, settings).await;
    Ok(())
}

/// Accepts connections on an already bound listener until the task is
/// dropped.
pub async fn serve(listener: TcpListener, hub: Arc<ChannelHub>, settings: Settings) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, hub.clone(), settings.clone()));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<ChannelHub>,
    settings: Settings,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    info!(%peer, client = %client.id, name = %client.name, "client connected");

    let send_task = {
        let client_id = client.id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(client = %client_id, error = %e, "failed to send, closing send loop");
                    break;
                }
            }
        })
    };

    let heartbeat = {
        let client = client.clone();
        let period = settings.server.heartbeat();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(WsMessage::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        })
    };

    let mut connection = Connection {
        client,
        hub,
        sink_buffer: settings.channel.sink_buffer,
        listening: HashMap::new(),
    };

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = %connection.client.id, error = %e, "read error");
                break;
            }
        }
    }

    connection.detach_all();
    heartbeat.abort();
    send_task.abort();
    info!(client = %connection.client.id, "client dropped");
}

struct Listening {
    viewer: ViewerId,
    task: JoinHandle<()>,
}

struct Connection {
    client: Client,
    hub: Arc<ChannelHub>,
    sink_buffer: usize,
    listening: HashMap<String, Listening>,
}

impl Connection {
    async fn handle_text(&mut self, text: &str) {
        let request = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    client = %self.client.id,
                    error = %e,
                    frame = %text.chars().take(100).collect::<String>(),
                    "invalid client message"
                );
                self.reply(&ServerMessage::error(format!("invalid message: {e}")));
                return;
            }
        };

        match request {
            ClientMessage::Listen { channel } => self.listen(channel),
            ClientMessage::Unlisten { channel } => self.unlisten(&channel),
            ClientMessage::Post { channel, message } => {
                let reply = match self.hub.post(&channel, &self.client.name, &message).await {
                    Ok(_) => ServerMessage::Posted { channel },
                    Err(e) => ServerMessage::error(e),
                };
                self.reply(&reply);
            }
            ClientMessage::ListChannels => {
                let reply = match self.hub.list_channels().await {
                    Ok(channels) => ServerMessage::Channels { channels },
                    Err(e) => ServerMessage::error(e),
                };
                self.reply(&reply);
            }
            ClientMessage::CreateChannel { channel } => {
                let reply = match self.hub.create_channel(&channel).await {
                    Ok(()) => ServerMessage::ChannelCreated { channel },
                    Err(e) => ServerMessage::error(e),
                };
                self.reply(&reply);
            }
            ClientMessage::WhoAmI => {
                let name = self.client.name.clone();
                self.reply(&ServerMessage::Identity { name });
            }
        }
    }

    fn listen(&mut self, channel: String) {
        if let Some(existing) = self.listening.get(&channel) {
            if !existing.task.is_finished() {
                self.reply(&ServerMessage::error(format!("already listening to {channel}")));
                return;
            }
        }

        let (sink, mut rx) = ViewerSink::channel(self.sink_buffer);
        let viewer = sink.id().clone();
        let hub = self.hub.clone();
        let client = self.client.clone();
        let name = channel.clone();

        let task = tokio::spawn(async move {
            let history = match hub.attach(&name, sink).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(client = %client.id, channel = %name, error = %e, "listen failed");
                    send(&client, &ServerMessage::error(e));
                    return;
                }
            };

            let replay = ServerMessage::History {
                channel: name.clone(),
                messages: history.iter().map(|m| (**m).clone()).collect(),
            };
            if !send(&client, &replay) {
                return;
            }

            while let Some(message) = rx.recv().await {
                if !send(&client, &ServerMessage::live(&name, &message)) {
                    break;
                }
            }
        });

        debug!(client = %self.client.id, %channel, %viewer, "listening");
        self.listening.insert(channel, Listening { viewer, task });
    }

    fn unlisten(&mut self, channel: &str) {
        if let Some(listening) = self.listening.remove(channel) {
            listening.task.abort();
            self.hub.detach(channel, &listening.viewer);
            debug!(client = %self.client.id, channel, "stopped listening");
        }
    }

    fn detach_all(&mut self) {
        let channels: Vec<String> = self.listening.keys().cloned().collect();
        for channel in channels {
            self.unlisten(&channel);
        }
    }

    fn reply(&self, message: &ServerMessage) {
        send(&self.client, message);
    }
}

/// Serializes and queues `message`. Returns false once the connection is
/// gone.
fn send(client: &Client, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => client.send_text(json),
        Err(e) => {
            warn!(client = %client.id, error = %e, "failed to serialize server message");
            true
        }
    }
}
