// src/brokers/configuration.rs
// Named configuration records resolved by the factory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::errors::{BrokerError, Result};

/// Kind of exchange declared on the broker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AMQP delivery mode attached to every outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    NonPersistent,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Connection parameters for one broker server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerBrokerConfiguration {
    pub name: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user_name: String,

    #[serde(default = "default_user")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub virtual_host: String,

    /// Explicit AMQP URI; wins over the individual fields when set.
    #[serde(default)]
    pub uri: Option<String>,

    /// Whether clients may declare exchanges and queues on this server.
    #[serde(default)]
    pub config_allowed: bool,

    #[serde(default = "default_timeout_seconds")]
    pub connection_timeout_seconds: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

// Default values
fn default_hostname() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_user() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_timeout_seconds() -> u64 { 60 }
fn default_heartbeat() -> u16 { 30 }
fn default_prefetch() -> u16 { 10 }
fn default_true() -> bool { true }

impl ServerBrokerConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: default_hostname(),
            port: default_port(),
            user_name: default_user(),
            password: default_user(),
            virtual_host: default_vhost(),
            uri: None,
            config_allowed: false,
            connection_timeout_seconds: default_timeout_seconds(),
            heartbeat_seconds: default_heartbeat(),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_config_allowed(mut self, allowed: bool) -> Self {
        self.config_allowed = allowed;
        self
    }

    /// Connection URI, with credentials and virtual host percent-encoded.
    pub fn amqp_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.user_name),
            urlencoding::encode(&self.password),
            self.hostname,
            self.port,
            urlencoding::encode(&self.virtual_host),
            self.heartbeat_seconds
        )
    }

    /// Ceiling for channel opening and the first publish handshake.
    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }
}

/// Parameters of a named publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPublishParameter {
    pub name: String,
    pub server_name: String,

    #[serde(default)]
    pub exchange_name: Option<String>,

    #[serde(default)]
    pub exchange_type: ExchangeType,

    #[serde(default)]
    pub default_routing_key: Option<String>,

    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    /// Per-message TTL in milliseconds, as AMQP expects it.
    #[serde(default)]
    pub expiration_message: Option<String>,
}

impl BrokerPublishParameter {
    pub fn new(name: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_name: server_name.into(),
            exchange_name: None,
            exchange_type: ExchangeType::default(),
            default_routing_key: None,
            delivery_mode: DeliveryMode::default(),
            expiration_message: None,
        }
    }

    pub fn with_exchange(mut self, name: impl Into<String>, kind: ExchangeType) -> Self {
        self.exchange_name = Some(name.into());
        self.exchange_type = kind;
        self
    }

    pub fn with_default_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.default_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_expiration(mut self, expiration_ms: impl Into<String>) -> Self {
        self.expiration_message = Some(expiration_ms.into());
        self
    }
}

/// Parameters of a named subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSubscriptionParameter {
    pub name: String,
    pub server_name: String,
    pub storage_queue_name: String,

    #[serde(default)]
    pub exchange_name: Option<String>,

    #[serde(default)]
    pub exchange_type: ExchangeType,

    /// Routing keys binding the queue to the exchange.
    #[serde(default)]
    pub routing_keys: Vec<String>,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub exclusive: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
}

impl BrokerSubscriptionParameter {
    pub fn new(
        name: impl Into<String>,
        server_name: impl Into<String>,
        storage_queue_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server_name: server_name.into(),
            storage_queue_name: storage_queue_name.into(),
            exchange_name: None,
            exchange_type: ExchangeType::default(),
            routing_keys: Vec::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch_count: default_prefetch(),
        }
    }

    pub fn with_exchange(mut self, name: impl Into<String>, kind: ExchangeType) -> Self {
        self.exchange_name = Some(name.into());
        self.exchange_type = kind;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_keys.push(routing_key.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// Any record the factory accepts, tagged by `kind` when read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConfigurationRecord {
    Server(ServerBrokerConfiguration),
    Publisher(BrokerPublishParameter),
    Subscription(BrokerSubscriptionParameter),
}

impl ConfigurationRecord {
    /// Classifies an untyped record. An absent or unknown `kind` is rejected.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BrokerError::InvalidConfiguration(
                    "configuration record must carry a 'kind' of server, publisher or subscription"
                        .to_string(),
                )
            })?;

        match kind.as_str() {
            "server" | "publisher" | "subscription" => serde_json::from_value(value)
                .map_err(|e| BrokerError::InvalidConfiguration(format!("{} record: {}", kind, e))),
            other => Err(BrokerError::InvalidConfiguration(format!(
                "unrecognized configuration kind '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConfigurationRecord::Server(c) => &c.name,
            ConfigurationRecord::Publisher(c) => &c.name,
            ConfigurationRecord::Subscription(c) => &c.name,
        }
    }
}

impl From<ServerBrokerConfiguration> for ConfigurationRecord {
    fn from(value: ServerBrokerConfiguration) -> Self {
        ConfigurationRecord::Server(value)
    }
}

impl From<BrokerPublishParameter> for ConfigurationRecord {
    fn from(value: BrokerPublishParameter) -> Self {
        ConfigurationRecord::Publisher(value)
    }
}

impl From<BrokerSubscriptionParameter> for ConfigurationRecord {
    fn from(value: BrokerSubscriptionParameter) -> Self {
        ConfigurationRecord::Subscription(value)
    }
}
