use std::env;
use std::time::Duration;

use serde::Deserialize;

use boreal_core::queue::QueueSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Intake queue policy plus the size of the worker fleet consuming it.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// Absent disables the TTL.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: Option<u64>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_workers_min")]
    pub workers_min: usize,
    #[serde(default = "default_workers_max")]
    pub workers_max: usize,
}

fn default_queue_name() -> String {
    "order.intake".to_string()
}
fn default_durable() -> bool {
    true
}
fn default_message_ttl_secs() -> Option<u64> {
    Some(30)
}
fn default_max_length() -> usize {
    1000
}
fn default_max_deliveries() -> u32 {
    3
}
fn default_prefetch() -> usize {
    5
}
fn default_workers_min() -> usize {
    2
}
fn default_workers_max() -> usize {
    8
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            durable: self.durable,
            message_ttl: self.message_ttl_secs.map(Duration::from_secs),
            max_length: self.max_length,
            max_deliveries: self.max_deliveries,
            prefetch: self.prefetch,
        }
    }
}

/// Seat-lock lease policy shared by every fulfillment worker.
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_lease_secs() -> u64 {
    30
}
fn default_acquire_timeout_ms() -> u64 {
    5000
}
fn default_retry_interval_ms() -> u64 {
    100
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in.
            .add_source(config::File::with_name("config/local").required(false))
            // E.g. BOREAL__SERVER__PORT=9090
            .add_source(config::Environment::with_prefix("BOREAL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [server]
        port = 8080

        [database]
        url = "postgres://localhost/boreal"

        [redis]
        url = "redis://localhost"

        [queue]

        [lock]
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.queue.name, "order.intake");
        assert!(cfg.queue.durable);
        assert_eq!(cfg.queue.workers_min, 2);
        assert_eq!(cfg.queue.workers_max, 8);
        assert_eq!(cfg.lock.lease(), Duration::from_secs(30));
        assert_eq!(cfg.lock.acquire_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.lock.retry_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_queue_settings_mapping() {
        let cfg = parse(MINIMAL);
        let settings = cfg.queue.settings();
        assert_eq!(settings.message_ttl, Some(Duration::from_secs(30)));
        assert_eq!(settings.max_length, 1000);
        assert_eq!(settings.max_deliveries, 3);
        assert_eq!(settings.prefetch, 5);
    }
}
