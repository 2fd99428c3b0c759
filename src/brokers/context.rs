// src/brokers/context.rs
// One inbound delivery and its terminal disposition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::broker::Broker;
use super::errors::{BrokerError, Result};
use crate::headers::HeaderMap;
use crate::transport::{Delivery, DeliveryAcker};

/// Where a delivery stands. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Committed,
    Rejected,
    Requeued,
    RolledBack,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Committed => "committed",
            DeliveryState::Rejected => "rejected",
            DeliveryState::Requeued => "requeued",
            DeliveryState::RolledBack => "rolled back",
        };
        f.write_str(text)
    }
}

/// A message handed to a subscription callback.
///
/// Exactly one of `commit`, `reject`, `requeue_last` or `rollback` settles
/// it; a second terminal call fails with `IllegalState`.
#[async_trait]
pub trait BrokerContext: Send + Sync {
    /// Message id when the publisher set one, the delivery tag otherwise.
    fn transaction_id(&self) -> &str;

    fn utf8_data(&self) -> &str;

    fn data(&self) -> &[u8];

    /// Routing key used when the message was published.
    fn routing_key(&self) -> &str;

    /// Exchange the message was published to.
    fn exchange(&self) -> &str;

    fn headers(&self) -> Option<&HeaderMap>;

    fn set_headers(&mut self, headers: Option<HeaderMap>);

    fn redelivered(&self) -> bool;

    fn state(&self) -> DeliveryState;

    /// Marks the message as read; it should never be presented again.
    async fn commit(&self) -> Result<()>;

    /// Discards the message for good.
    async fn reject(&self) -> Result<()>;

    fn can_be_requeued(&self) -> bool;

    /// Puts the message back at the head of its queue.
    async fn requeue_last(&self) -> Result<()>;

    /// Discards this attempt; the message is presented again later.
    async fn rollback(&self) -> Result<()>;

    fn broker(&self) -> &Broker;
}

impl dyn BrokerContext {
    /// Decodes a JSON body.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.data())?)
    }
}

/// Builds the context handed to callbacks; replaceable per subscription.
pub type ContextFactory = Arc<dyn Fn(Delivery, Broker) -> Box<dyn BrokerContext> + Send + Sync>;

pub fn default_context_factory() -> ContextFactory {
    Arc::new(|delivery: Delivery, broker: Broker| {
        Box::new(RabbitBrokerContext::new(delivery, broker)) as Box<dyn BrokerContext>
    })
}

/// Default context over a transport delivery.
pub struct RabbitBrokerContext {
    transaction_id: String,
    utf8_data: String,
    data: Vec<u8>,
    routing_key: String,
    exchange: String,
    headers: Option<HeaderMap>,
    redelivered: bool,
    delivery_tag: u64,
    acker: Arc<dyn DeliveryAcker>,
    state: Mutex<DeliveryState>,
    broker: Broker,
}

impl RabbitBrokerContext {
    pub fn new(delivery: Delivery, broker: Broker) -> Self {
        let transaction_id = delivery
            .properties
            .message_id
            .clone()
            .unwrap_or_else(|| delivery.delivery_tag.to_string());

        Self {
            transaction_id,
            utf8_data: String::from_utf8_lossy(&delivery.data).into_owned(),
            data: delivery.data,
            routing_key: delivery.routing_key,
            exchange: delivery.exchange,
            headers: delivery.properties.headers,
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            acker: delivery.acker,
            state: Mutex::new(DeliveryState::Pending),
            broker,
        }
    }

    fn current_state(&self) -> DeliveryState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claims the delivery for `outcome`, runs the transport action, and
    /// hands the delivery back to pending if the transport refuses.
    async fn settle<F>(&self, outcome: DeliveryState, action: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != DeliveryState::Pending {
                return Err(BrokerError::IllegalState(format!(
                    "delivery {} is already {}",
                    self.transaction_id, *state
                )));
            }
            *state = outcome;
        }

        if let Err(e) = action.await {
            *self.state.lock().unwrap_or_else(|p| p.into_inner()) = DeliveryState::Pending;
            return Err(e);
        }

        debug!(
            delivery_tag = self.delivery_tag,
            routing_key = %self.routing_key,
            "Delivery {}",
            outcome
        );
        Ok(())
    }
}

#[async_trait]
impl BrokerContext for RabbitBrokerContext {
    fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    fn utf8_data(&self) -> &str {
        &self.utf8_data
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn exchange(&self) -> &str {
        &self.exchange
    }

    fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    fn set_headers(&mut self, headers: Option<HeaderMap>) {
        self.headers = headers;
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn state(&self) -> DeliveryState {
        self.current_state()
    }

    async fn commit(&self) -> Result<()> {
        self.settle(DeliveryState::Committed, self.acker.ack()).await
    }

    async fn reject(&self) -> Result<()> {
        self.settle(DeliveryState::Rejected, self.acker.reject(false))
            .await
    }

    /// A message the broker already redelivered once is not requeued again.
    fn can_be_requeued(&self) -> bool {
        self.current_state() == DeliveryState::Pending && !self.redelivered
    }

    async fn requeue_last(&self) -> Result<()> {
        if !self.can_be_requeued() {
            return Err(BrokerError::IllegalState(format!(
                "delivery {} cannot be requeued",
                self.transaction_id
            )));
        }
        self.settle(DeliveryState::Requeued, self.acker.reject(true))
            .await
    }

    async fn rollback(&self) -> Result<()> {
        self.settle(DeliveryState::RolledBack, self.acker.nack(true))
            .await
    }

    fn broker(&self) -> &Broker {
        &self.broker
    }
}

impl Drop for RabbitBrokerContext {
    fn drop(&mut self) {
        if self.current_state() == DeliveryState::Pending {
            warn!(
                delivery_tag = self.delivery_tag,
                routing_key = %self.routing_key,
                "Delivery dropped without a terminal action; it stays unacknowledged"
            );
        }
    }
}
