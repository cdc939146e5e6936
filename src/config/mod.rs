mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LogSettings, ServerSettings, Settings};

/// Loads the configuration from `.env`, the default file and environment
/// variables, then merges it over the default values.
///
/// Environment keys use `_` as separator, e.g. `SERVER_PORT=9000` or
/// `LOG_LEVEL=debug`. Broker keys containing underscores are only reachable
/// through the config file.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let log = partial.log;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            jwt_secret: server
                .as_ref()
                .and_then(|s| s.jwt_secret.clone())
                .unwrap_or(default.server.jwt_secret),
            username: server
                .as_ref()
                .and_then(|s| s.username.clone())
                .unwrap_or(default.server.username),
            password: server
                .as_ref()
                .and_then(|s| s.password.clone())
                .unwrap_or(default.server.password),
        },
        broker: BrokerSettings {
            max_connections: broker
                .as_ref()
                .and_then(|b| b.max_connections)
                .unwrap_or(default.broker.max_connections),
            max_redeliveries: broker
                .as_ref()
                .and_then(|b| b.max_redeliveries)
                .unwrap_or(default.broker.max_redeliveries),
            consumer_timeout_ms: broker
                .as_ref()
                .and_then(|b| b.consumer_timeout_ms)
                .unwrap_or(default.broker.consumer_timeout_ms),
            sweep_interval_ms: broker
                .as_ref()
                .and_then(|b| b.sweep_interval_ms)
                .unwrap_or(default.broker.sweep_interval_ms),
            default_prefetch: broker
                .as_ref()
                .and_then(|b| b.default_prefetch)
                .unwrap_or(default.broker.default_prefetch),
            data_dir: broker
                .as_ref()
                .and_then(|b| b.data_dir.clone())
                .or(default.broker.data_dir),
            event_capacity: broker
                .as_ref()
                .and_then(|b| b.event_capacity)
                .unwrap_or(default.broker.event_capacity),
        },
        log: LogSettings {
            level: log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    }
}
