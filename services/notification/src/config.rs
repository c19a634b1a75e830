//! Configuration for the notification service.
//!
//! Values are resolved once by the binary and handed to the core as plain
//! structs. [`SharedConfig`] keeps the current snapshot for hot reload.

use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the notification service
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka consumer configuration, only needed by the consume mode
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KafkaConfig {
    /// Broker addresses
    #[serde(default)]
    pub brokers: Vec<String>,
    /// Topic carrying notification records
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Interval at which stored offsets are committed, in milliseconds
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u32,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open while idle
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "notification-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_topic() -> String {
    "notifications".to_string()
}

fn default_group_id() -> String {
    "notification-service-group".to_string()
}

fn default_client_id() -> String {
    "notification-service".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_auto_commit_interval_ms() -> u32 {
    5000
}

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_run_migrations() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// Nothing is validated here. Callers check the sections their mode
    /// uses, see [`Config::validate`] and [`DatabaseConfig::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            // Add config file if present
            .add_source(config::File::with_name("config/notification").required(false))
            .add_source(config::File::with_name("/etc/notification/notification").required(false))
            // NOTIFICATION__KAFKA__BROKERS=a:9092,b:9092 -> kafka.brokers
            .add_source(
                config::Environment::with_prefix("NOTIFICATION")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.database.validate()
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self::new(Vec::new(), default_topic(), default_group_id())
    }
}

impl KafkaConfig {
    /// Create a configuration for the given brokers, topic and group
    pub fn new(
        brokers: Vec<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            group_id: group_id.into(),
            client_id: default_client_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            extra_properties: HashMap::new(),
        }
    }

    /// Validate the consumer settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::MissingRequired("kafka.brokers".to_string()));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.topic".to_string()));
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }
        Ok(())
    }

    /// Broker list in librdkafka's `bootstrap.servers` form
    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Build a consumer ClientConfig
    ///
    /// Offsets are stored explicitly after each message and committed by the
    /// background auto-commit.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false");

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }
}

impl DatabaseConfig {
    /// Validate the connection settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired("database.host".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                key: "database.min_connections".to_string(),
                message: format!(
                    "{} exceeds max_connections {}",
                    self.min_connections, self.max_connections
                ),
            });
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Current configuration snapshot, replaceable at runtime.
///
/// Readers take one [`Arc<Config>`] per unit of work and never observe a
/// partially applied reload.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Get the current snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the snapshot, returning the previous one
    pub fn replace(&self, config: Config) -> Arc<Config> {
        let next = Arc::new(config);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Load configuration again and swap it in.
    ///
    /// On failure the current snapshot is kept.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let config = Config::load()?;
        config.validate()?;
        Ok(self.replace(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            kafka: KafkaConfig::new(
                vec!["localhost:9092".to_string()],
                "notifications",
                "notification-service-group",
            ),
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: default_port(),
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                database: "notifications".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                idle_timeout_secs: default_idle_timeout_secs(),
                connect_timeout_secs: default_connect_timeout_secs(),
                run_migrations: true,
            },
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_topic(), "notifications");
        assert_eq!(default_group_id(), "notification-service-group");
        assert_eq!(default_port(), 5432);
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_consumer_config_build() {
        let config = KafkaConfig::new(
            vec!["kafka-1:9092".to_string(), " kafka-2:9092 ".to_string()],
            "notifications",
            "group-a",
        );
        let client_config = config.build_consumer_config();

        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(client_config.get("group.id"), Some("group-a"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("true"));
    }

    #[test]
    fn test_extra_properties_override() {
        let mut config = KafkaConfig::new(vec!["localhost:9092".to_string()], "t", "g");
        config
            .extra_properties
            .insert("fetch.min.bytes".to_string(), "1024".to_string());

        let client_config = config.build_consumer_config();
        assert_eq!(client_config.get("fetch.min.bytes"), Some("1024"));
    }

    #[test]
    fn test_validate_rejects_missing_values() {
        let mut config = test_config();
        config.kafka.brokers = vec![" ".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "kafka.brokers"
        ));

        let mut config = test_config();
        config.kafka.group_id.clear();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.database.min_connections = 20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [kafka]
                brokers = ["localhost:9092"]

                [database]
                host = "db"
                user = "app"
                database = "notifications"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.kafka.topic, "notifications");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.service.log_format, LogFormat::Json);
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_database_only_config_for_listing() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [database]
                host = "db"
                user = "app"
                database = "notifications"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.kafka.brokers.is_empty());
        assert_eq!(config.kafka.group_id, "notification-service-group");
        assert!(config.database.validate().is_ok());

        // Consuming still needs brokers
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "kafka.brokers"
        ));
    }

    #[test]
    fn test_shared_config_swaps_whole_snapshot() {
        let shared = SharedConfig::new(test_config());
        let before = shared.snapshot();

        let mut next = test_config();
        next.service.log_level = "debug".to_string();
        next.kafka.topic = "notifications.v2".to_string();

        let previous = shared.replace(next);
        assert!(Arc::ptr_eq(&before, &previous));

        // Snapshots taken earlier stay intact
        assert_eq!(before.service.log_level, "info");
        assert_eq!(before.kafka.topic, "notifications");

        let after = shared.snapshot();
        assert_eq!(after.service.log_level, "debug");
        assert_eq!(after.kafka.topic, "notifications.v2");
    }
}
