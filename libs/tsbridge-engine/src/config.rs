use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use crate::error::EngineError;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub db: DbConfig,
    pub broker: BrokerConfig,

    /// Topic bindings. Defaults to the weather and rtl_433 topics.
    #[serde(default = "default_topics")]
    pub topics: Vec<TopicConfig>,
}

#[derive(Clone, Deserialize)]
pub struct DbConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits for a pooled connection before failing.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Subscription QoS: 0, 1 or 2.
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Buffer between the connection driver and each subscription.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("qos", &self.qos)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

/// One topic → schema binding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicConfig {
    /// Bus topic (e.g. `"timescaledb/weather"`).
    pub name: String,
    /// Record schema name (e.g. `"weather"`, `"sensor_burst"`).
    pub schema: String,
    /// Relay queue capacity between receiver and writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What the receiver does when the relay queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Allow-list for the schema's acceptance filter.
    #[serde(default)]
    pub accept: Option<Vec<String>>,
}

/// Receiver behaviour on a full relay queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Log at error level and terminate the pipeline.
    #[default]
    Abort,
    /// Log a warning, discard the record and keep receiving.
    Drop,
}

fn default_topics() -> Vec<TopicConfig> {
    vec![
        TopicConfig {
            name: "timescaledb/weather".into(),
            schema: "weather".into(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            accept: None,
        },
        TopicConfig {
            name: "timescaledb/rtl433".into(),
            schema: "sensor_burst".into(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            accept: None,
        },
    ]
}

fn default_min_connections() -> u32 {
    2
}
fn default_max_connections() -> u32 {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "tsbridge".into()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_qos() -> u8 {
    1
}
fn default_channel_capacity() -> usize {
    64
}
fn default_queue_capacity() -> usize {
    20
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.db.max_connections == 0 {
            return Err(EngineError::Config("db.max_connections must be at least 1".into()));
        }
        if self.db.min_connections > self.db.max_connections {
            return Err(EngineError::Config(format!(
                "db.min_connections ({}) exceeds db.max_connections ({})",
                self.db.min_connections, self.db.max_connections
            )));
        }
        if self.broker.host.is_empty() {
            return Err(EngineError::Config("broker.host is empty".into()));
        }
        if self.broker.qos > 2 {
            return Err(EngineError::Config(format!("broker.qos must be 0, 1 or 2, got {}", self.broker.qos)));
        }
        if self.broker.channel_capacity == 0 {
            return Err(EngineError::Config("broker.channel_capacity must be at least 1".into()));
        }

        if self.topics.is_empty() {
            return Err(EngineError::Config("no [[topics]] configured".into()));
        }
        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.name.is_empty() {
                return Err(EngineError::Config("topic with empty name".into()));
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(EngineError::Config(format!("topic '{}' configured twice", topic.name)));
            }
            if topic.queue_capacity == 0 {
                return Err(EngineError::Config(format!(
                    "topic '{}': queue_capacity must be at least 1",
                    topic.name
                )));
            }
        }
        Ok(())
    }
}
