// src/lib.rs
//! Broker abstraction over RabbitMQ: a named-configuration factory that
//! builds brokers, publishers with channel transactions, and subscriptions
//! handing each delivery to a callback with one-shot ack semantics.

pub mod brokers;
pub mod cli;
pub mod config;
pub mod env;
pub mod headers;
pub mod message;
pub mod rabbitmq;
pub mod transport;

pub use brokers::{
    Broker, BrokerContext, BrokerError, BrokerPublishParameter, BrokerSubscriptionParameter,
    FactoryBrokers, Publisher, ServerBrokerConfiguration, Subscription,
};
pub use headers::MessageHeaders;
pub use message::Payload;
