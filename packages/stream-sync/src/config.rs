use std::time::Duration;

pub const CLIENT_OUT_STREAM: &str = "client-out";
pub const UPDATER_OUT_STREAM: &str = "updater-out";
pub const CLIENT_IN_STREAM: &str = "client-in";
pub const UPDATER_IN_STREAM: &str = "updater-in";
pub const CONSUMER_GROUP: &str = "market-analysis_server";
pub const CONSUMER_NAME: &str = "interface-consumer";

/// Redis connection settings.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl BrokerConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}/", self.password, self.host, self.port)
        }
    }
}

/// SurrealDB connection settings plus the fixed namespace the message path writes to.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    pub collection: String,
}

impl StoreConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Consumer loop tuning.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub input_streams: Vec<String>,
    pub response_stream: String,
    pub updater_stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub operation_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            input_streams: vec![CLIENT_OUT_STREAM.to_string(), UPDATER_OUT_STREAM.to_string()],
            response_stream: CLIENT_IN_STREAM.to_string(),
            updater_stream: UPDATER_IN_STREAM.to_string(),
            group: CONSUMER_GROUP.to_string(),
            consumer: CONSUMER_NAME.to_string(),
            batch_size: 10,
            block: Duration::from_millis(5000),
            operation_timeout: Duration::from_millis(10_000),
        }
    }
}

pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub consumer: ConsumerSettings,
    pub listen_addr: String,
    pub auth_secret: Option<String>,
}

pub fn load_config() -> Config {
    load_config_from(|key| std::env::var(key).ok())
}

/// Builds the configuration from an arbitrary variable source.
pub fn load_config_from<F>(var: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());
    let parsed = |key: &str, default: u64| -> u64 {
        var(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    };
    let port = |key: &str, default: u16| -> u16 {
        var(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    };

    let defaults = ConsumerSettings::default();

    Config {
        broker: BrokerConfig {
            host: string("REDIS_HOST", "localhost"),
            port: port("REDIS_PORT", 6379),
            password: string("REDIS_PASSWORD", ""),
        },
        store: StoreConfig {
            host: string("SURREALDB_HOST", "localhost"),
            port: port("SURREALDB_PORT", 8000),
            user: string("SURREALDB_USER", "root"),
            password: string("SURREALDB_PASS", ""),
            namespace: string("SURREALDB_NS", "market-analysis"),
            database: string("STORE_DATABASE", "stonksdev"),
            collection: string("STORE_COLLECTION", "main"),
        },
        consumer: ConsumerSettings {
            batch_size: parsed("SYNC_BATCH_SIZE", 10).max(1) as usize,
            block: Duration::from_millis(parsed("SYNC_BLOCK_MS", 5000)),
            operation_timeout: Duration::from_millis(parsed("SYNC_OPERATION_TIMEOUT_MS", 10_000)),
            ..defaults
        },
        listen_addr: string("LISTEN_ADDR", "0.0.0.0:8668"),
        auth_secret: var("STORE_API_AUTH_SECRET").filter(|s| !s.is_empty()),
    }
}
