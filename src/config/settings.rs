use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the relay.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub channel: ChannelSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Where the WebSocket server binds and how often it pings idle viewers.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub heartbeat_secs: u64,
}

/// Per-channel session tuning.
///
/// `history_capacity` bounds the replay buffer, `preload_ms` is the warm-up
/// window after a subscription opens, `sink_buffer` is how many messages a
/// single viewer may lag behind before it starts missing live messages.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    pub history_capacity: usize,
    pub preload_ms: u64,
    pub sink_buffer: usize,
}

/// Settings for the bundled broker.
///
/// An empty `data_path` keeps the broker state in a temporary database.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub data_path: String,
    pub ordered: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl ChannelSettings {
    pub fn preload(&self) -> Duration {
        Duration::from_millis(self.preload_ms)
    }
}

impl BrokerSettings {
    pub fn data_path(&self) -> Option<&str> {
        let path = self.data_path.trim();
        if path.is_empty() { None } else { Some(path) }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub channel: Option<PartialChannelSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialChannelSettings {
    pub history_capacity: Option<usize>,
    pub preload_ms: Option<u64>,
    pub sink_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub data_path: Option<String>,
    pub ordered: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                heartbeat_secs: 5,
            },
            channel: ChannelSettings {
                history_capacity: 50,
                preload_ms: 3000,
                sink_buffer: 64,
            },
            broker: BrokerSettings {
                data_path: "chatrelay_db".to_string(),
                ordered: false,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was provided on top of the defaults.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let channel = self.channel.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                heartbeat_secs: server
                    .heartbeat_secs
                    .unwrap_or(default.server.heartbeat_secs),
            },
            channel: ChannelSettings {
                history_capacity: channel
                    .history_capacity
                    .unwrap_or(default.channel.history_capacity),
                preload_ms: channel.preload_ms.unwrap_or(default.channel.preload_ms),
                sink_buffer: channel.sink_buffer.unwrap_or(default.channel.sink_buffer),
            },
            broker: BrokerSettings {
                data_path: broker.data_path.unwrap_or(default.broker.data_path),
                ordered: broker.ordered.unwrap_or(default.broker.ordered),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}
