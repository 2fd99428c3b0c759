// src/brokers/factory.rs
// Name-indexed registry of broker configurations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::broker::Broker;
use super::configuration::{
    BrokerPublishParameter, BrokerSubscriptionParameter, ConfigurationRecord,
    ServerBrokerConfiguration,
};
use super::errors::{BrokerError, Result};
use super::publisher::Publisher;
use super::subscription::{Subscription, SubscriptionCallback};
use crate::message::MessageCodec;
use crate::rabbitmq::LapinChannelProvider;
use crate::transport::ChannelProvider;

/// Builds the channel provider for a server configuration.
pub type ProviderBuilder =
    Arc<dyn Fn(&ServerBrokerConfiguration) -> Arc<dyn ChannelProvider> + Send + Sync>;

struct FactoryInner {
    servers: RwLock<HashMap<String, ServerBrokerConfiguration>>,
    publishers: RwLock<HashMap<String, BrokerPublishParameter>>,
    subscriptions: RwLock<HashMap<String, BrokerSubscriptionParameter>>,
    provider_builder: ProviderBuilder,
    codec: MessageCodec,
}

/// Resolves logical names into brokers, publishers and subscriptions.
///
/// Construct one at startup and pass clones around; clones share the
/// registry. Registering a name again replaces the previous record.
#[derive(Clone)]
pub struct FactoryBrokers {
    inner: Arc<FactoryInner>,
}

impl Default for FactoryBrokers {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryBrokers {
    /// Factory whose brokers talk to RabbitMQ.
    pub fn new() -> Self {
        Self::with_provider_builder(Arc::new(|server: &ServerBrokerConfiguration| {
            Arc::new(LapinChannelProvider::new(server)) as Arc<dyn ChannelProvider>
        }))
    }

    pub fn with_provider_builder(provider_builder: ProviderBuilder) -> Self {
        Self::with_codec(provider_builder, MessageCodec::default())
    }

    pub fn with_codec(provider_builder: ProviderBuilder, codec: MessageCodec) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                servers: RwLock::new(HashMap::new()),
                publishers: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                provider_builder,
                codec,
            }),
        }
    }

    /// Registers or replaces a record under its name.
    pub fn add(&self, record: impl Into<ConfigurationRecord>) -> &Self {
        let record = record.into();
        debug!(name = %record.name(), "Registering configuration");

        match record {
            ConfigurationRecord::Server(server) => {
                let mut servers = self.inner.servers.write().unwrap_or_else(|p| p.into_inner());
                servers.insert(server.name.clone(), server);
            }
            ConfigurationRecord::Publisher(publisher) => {
                let mut publishers = self.inner.publishers.write().unwrap_or_else(|p| p.into_inner());
                publishers.insert(publisher.name.clone(), publisher);
            }
            ConfigurationRecord::Subscription(subscription) => {
                let mut subscriptions = self
                    .inner
                    .subscriptions
                    .write()
                    .unwrap_or_else(|p| p.into_inner());
                subscriptions.insert(subscription.name.clone(), subscription);
            }
        }
        self
    }

    /// Registers an untyped record; its `kind` field picks the registry.
    pub fn add_value(&self, value: serde_json::Value) -> Result<&Self> {
        let record = ConfigurationRecord::from_value(value)?;
        Ok(self.add(record))
    }

    pub fn get_server(&self, name: &str) -> Option<ServerBrokerConfiguration> {
        let servers = self.inner.servers.read().unwrap_or_else(|p| p.into_inner());
        servers.get(name).cloned()
    }

    pub fn get_publisher(&self, name: &str) -> Option<BrokerPublishParameter> {
        let publishers = self.inner.publishers.read().unwrap_or_else(|p| p.into_inner());
        publishers.get(name).cloned()
    }

    pub fn get_subscriber(&self, name: &str) -> Option<BrokerSubscriptionParameter> {
        let subscriptions = self.inner.subscriptions.read().unwrap_or_else(|p| p.into_inner());
        subscriptions.get(name).cloned()
    }

    pub fn get_server_broker_names(&self) -> Vec<String> {
        let servers = self.inner.servers.read().unwrap_or_else(|p| p.into_inner());
        servers.keys().cloned().collect()
    }

    pub fn get_publisher_names(&self) -> Vec<String> {
        let publishers = self.inner.publishers.read().unwrap_or_else(|p| p.into_inner());
        publishers.keys().cloned().collect()
    }

    pub fn get_subscriber_names(&self) -> Vec<String> {
        let subscriptions = self.inner.subscriptions.read().unwrap_or_else(|p| p.into_inner());
        subscriptions.keys().cloned().collect()
    }

    fn resolve_server(&self, name: &str) -> Result<ServerBrokerConfiguration> {
        self.get_server(name).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!("unknown server broker '{}'", name))
        })
    }

    fn resolve_publisher(&self, name: &str) -> Result<(BrokerPublishParameter, ServerBrokerConfiguration)> {
        let publisher = self.get_publisher(name).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!("unknown publisher '{}'", name))
        })?;
        let server = self.get_server(&publisher.server_name).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!(
                "publisher '{}' refers to unknown server broker '{}'",
                name, publisher.server_name
            ))
        })?;
        Ok((publisher, server))
    }

    fn resolve_subscription(
        &self,
        name: &str,
    ) -> Result<(BrokerSubscriptionParameter, ServerBrokerConfiguration)> {
        let subscription = self.get_subscriber(name).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!("unknown subscription '{}'", name))
        })?;
        let server = self.get_server(&subscription.server_name).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!(
                "subscription '{}' refers to unknown server broker '{}'",
                name, subscription.server_name
            ))
        })?;
        Ok((subscription, server))
    }

    fn build_broker(&self, server: ServerBrokerConfiguration) -> Broker {
        let provider = (self.inner.provider_builder)(&server);
        Broker::from_parts(server, provider, Some(self.clone()), self.inner.codec)
    }

    /// A fresh broker for the named server on every call.
    pub fn create_server_broker(&self, name: &str) -> Result<Broker> {
        let server = self.resolve_server(name)?;
        info!(server = %name, "Creating server broker");
        Ok(self.build_broker(server))
    }

    pub fn check_server_broker(&self, name: &str) -> Option<BrokerError> {
        self.resolve_server(name).err()
    }

    pub fn create_publisher(&self, name: &str) -> Result<Publisher> {
        let (publisher, server) = self.resolve_publisher(name)?;
        info!(publisher = %name, server = %server.name, "Creating publisher");
        Ok(self.build_broker(server).get_publisher(publisher))
    }

    pub fn check_publisher(&self, name: &str) -> Option<BrokerError> {
        self.resolve_publisher(name).err()
    }

    pub async fn create_subscription(
        &self,
        name: &str,
        callback: SubscriptionCallback,
    ) -> Result<Subscription> {
        let (subscription, server) = self.resolve_subscription(name)?;
        info!(subscription = %name, server = %server.name, "Creating subscription");
        self.build_broker(server)
            .subscribe(subscription, callback, None)
            .await
    }

    pub fn check_subscription(&self, name: &str) -> Option<BrokerError> {
        self.resolve_subscription(name).err()
    }
}
