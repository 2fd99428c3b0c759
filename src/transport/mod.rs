// src/transport/mod.rs
// Seams between the broker core and a concrete message-queue transport.
//
// The core only talks to these traits. `crate::rabbitmq` implements them
// over lapin, `memory` implements them in-process for tests and local runs
// (behind the `memory` feature).

#[cfg(any(test, feature = "memory"))]
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::brokers::configuration::ExchangeType;
use crate::brokers::errors::Result;
use crate::headers::HeaderMap;

#[cfg(any(test, feature = "memory"))]
pub use memory::InMemoryChannelProvider;

/// Metadata travelling with a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub delivery_mode: u8,
    pub expiration: Option<String>,
    pub headers: Option<HeaderMap>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Exchanges, queues and bindings a session expects to exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub exchanges: Vec<(String, ExchangeType)>,
    pub queues: Vec<(String, QueueOptions)>,
    /// (queue, exchange, routing key)
    pub bindings: Vec<(String, String, String)>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|(name, _)| name.as_str())
    }
}

/// Hands out channels on one server connection.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>>;

    /// Probes liveness without declaring or publishing anything.
    async fn check_connection(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// One transport channel.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn id(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()>;

    /// Switches the channel into transactional mode.
    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn rollback_transaction(&self) -> Result<()>;

    /// Ready message count, `None` when the queue does not exist.
    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>>;

    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Settles one inbound delivery on the transport.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// An inbound message as the transport hands it over.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("len", &self.data.len())
            .finish()
    }
}
