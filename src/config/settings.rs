use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the WebSocket server, the broker core and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the bind address, the JWT signing secret and the single set of
/// credentials accepted by `login`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub username: String,
    pub password: String,
}

/// Configuration settings for the broker core.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Requeues allowed per message before it is dead-lettered as `rejected`.
    pub max_redeliveries: u32,
    /// Acknowledgment timeout; `0` disables it.
    pub consumer_timeout_ms: u64,
    /// Period of the TTL sweep and ack-timeout check.
    pub sweep_interval_ms: u64,
    /// Prefetch used when a `consume` frame does not carry one.
    pub default_prefetch: u16,
    /// Journal directory; `None` keeps everything in memory.
    pub data_dir: Option<String>,
    /// Buffer of the broker event stream.
    pub event_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub jwt_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub max_redeliveries: Option<u32>,
    pub consumer_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub default_prefetch: Option<u16>,
    pub data_dir: Option<String>,
    pub event_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl BrokerSettings {
    pub fn consumer_timeout(&self) -> Option<u64> {
        (self.consumer_timeout_ms > 0).then_some(self.consumer_timeout_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_redeliveries: 5,
            consumer_timeout_ms: 30 * 60 * 1000,
            sweep_interval_ms: 1000,
            default_prefetch: 10,
            data_dir: None,
            event_capacity: 1024,
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                jwt_secret: "secret".to_string(),
                username: "admin".to_string(),
                password: "password".to_string(),
            },
            broker: BrokerSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
