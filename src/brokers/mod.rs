// src/brokers/mod.rs
// Broker abstraction: named configurations, publishers, subscriptions.

pub mod broker;
pub mod configuration;
pub mod context;
pub mod errors;
pub mod factory;
pub mod publisher;
mod session;
pub mod subscription;

pub use broker::Broker;
pub use configuration::{
    BrokerPublishParameter, BrokerSubscriptionParameter, ConfigurationRecord, DeliveryMode,
    ExchangeType, ServerBrokerConfiguration,
};
pub use context::{BrokerContext, ContextFactory, DeliveryState, RabbitBrokerContext};
pub use errors::{BrokerError, Result};
pub use factory::{FactoryBrokers, ProviderBuilder};
pub use publisher::{Publisher, Transaction};
pub use session::ChannelSession;
pub use subscription::{callback, Subscription, SubscriptionCallback};
