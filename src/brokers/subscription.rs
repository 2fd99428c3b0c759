// src/brokers/subscription.rs
// Consume loop feeding broker contexts to a callback.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::configuration::BrokerSubscriptionParameter;
use super::context::{default_context_factory, BrokerContext, ContextFactory};
use super::errors::Result;
use super::session::ChannelSession;
use crate::transport::{DeliveryStream, QueueOptions, Topology};

/// Handler run once per delivery. Settling the context is up to it.
pub type SubscriptionCallback =
    Arc<dyn Fn(Box<dyn BrokerContext>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Boxes an async closure into a [`SubscriptionCallback`].
pub fn callback<F, Fut>(f: F) -> SubscriptionCallback
where
    F: Fn(Box<dyn BrokerContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context| f(context).boxed())
}

const RECONSUME_DELAY: Duration = Duration::from_millis(500);

/// A running consumer on one queue.
///
/// Deliveries are handed to the callback one at a time, in order.
/// Dropping the handle aborts the loop; `close` stops it cleanly.
pub struct Subscription {
    name: String,
    queue: String,
    consumer_tag: String,
    session: Arc<ChannelSession>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

fn subscription_topology(parameters: &BrokerSubscriptionParameter) -> Topology {
    let mut topology = Topology::default();
    topology.queues.push((
        parameters.storage_queue_name.clone(),
        QueueOptions {
            durable: parameters.durable,
            exclusive: parameters.exclusive,
            auto_delete: parameters.auto_delete,
        },
    ));

    if let Some(exchange) = parameters
        .exchange_name
        .as_ref()
        .filter(|name| !name.trim().is_empty())
    {
        topology
            .exchanges
            .push((exchange.clone(), parameters.exchange_type));

        if parameters.routing_keys.is_empty() {
            topology.bindings.push((
                parameters.storage_queue_name.clone(),
                exchange.clone(),
                String::new(),
            ));
        }
        for routing_key in &parameters.routing_keys {
            topology.bindings.push((
                parameters.storage_queue_name.clone(),
                exchange.clone(),
                routing_key.clone(),
            ));
        }
    }

    topology
}

struct ConsumeLoop {
    name: String,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    broker: Broker,
    session: Arc<ChannelSession>,
    callback: SubscriptionCallback,
    context_factory: ContextFactory,
}

impl ConsumeLoop {
    async fn consume(&self) -> Result<DeliveryStream> {
        let channel = self.session.channel().await?;
        channel
            .consume(&self.queue, &self.consumer_tag, self.prefetch)
            .await
    }

    async fn run(self, mut stream: DeliveryStream, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        debug!(
                            subscription = %self.name,
                            delivery_tag = delivery.delivery_tag,
                            "Delivery received"
                        );
                        let context = (self.context_factory)(delivery, self.broker.clone());
                        if let Err(e) = (self.callback)(context).await {
                            error!(subscription = %self.name, "Subscription callback failed: {:#}", e);
                        }
                    }
                    Some(Err(e)) => {
                        error!(subscription = %self.name, "Error receiving delivery: {}", e);
                        if self.session.is_open() {
                            continue;
                        }
                        match self.reconsume(&mut shutdown).await {
                            Some(next) => stream = next,
                            None => break,
                        }
                    }
                    None => {
                        warn!(subscription = %self.name, "Consumer stream ended, channel was closed");
                        match self.reconsume(&mut shutdown).await {
                            Some(next) => stream = next,
                            None => break,
                        }
                    }
                }
            }
        }
        debug!(subscription = %self.name, "Consume loop stopped");
    }

    /// Reopens the channel and attaches a new consumer, retrying until it
    /// works or shutdown is requested.
    async fn reconsume(&self, shutdown: &mut oneshot::Receiver<()>) -> Option<DeliveryStream> {
        loop {
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = tokio::time::sleep(RECONSUME_DELAY) => {}
            }
            if self.broker.is_closed() {
                debug!(subscription = %self.name, "Broker closed, not re-attaching");
                return None;
            }

            match self.consume().await {
                Ok(stream) => {
                    info!(subscription = %self.name, queue = %self.queue, "Consumer re-attached");
                    return Some(stream);
                }
                Err(e) => warn!(subscription = %self.name, "Re-attaching consumer failed: {}", e),
            }
        }
    }
}

impl Subscription {
    pub(crate) async fn start(
        broker: Broker,
        parameters: BrokerSubscriptionParameter,
        callback: SubscriptionCallback,
        context_factory: Option<ContextFactory>,
    ) -> Result<Self> {
        let topology = subscription_topology(&parameters);
        let session = broker.new_session(format!("subscription-{}", parameters.name), topology);
        let consumer_tag = format!("{}-{}", parameters.name, &Uuid::new_v4().to_string()[..8]);

        let consume_loop = ConsumeLoop {
            name: parameters.name.clone(),
            queue: parameters.storage_queue_name.clone(),
            consumer_tag: consumer_tag.clone(),
            prefetch: parameters.prefetch_count,
            broker,
            session: session.clone(),
            callback,
            context_factory: context_factory.unwrap_or_else(default_context_factory),
        };

        let stream = match consume_loop.consume().await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    debug!("Releasing channel after failed subscribe: {}", close_error);
                }
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(consume_loop.run(stream, shutdown_rx));

        info!(
            subscription = %parameters.name,
            queue = %parameters.storage_queue_name,
            consumer_tag = %consumer_tag,
            "Subscription started"
        );

        Ok(Self {
            name: parameters.name,
            queue: parameters.storage_queue_name,
            consumer_tag,
            session,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop after the delivery in progress, then releases the
    /// channel. Unsettled deliveries go back to the queue.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(subscription = %self.name, "Consume loop ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.session.close().await {
            warn!(subscription = %self.name, "Releasing channel failed: {}", e);
        }
        info!(subscription = %self.name, "Subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let session = self.session.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!("Releasing channel on drop failed: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::configuration::ExchangeType;

    #[test]
    fn test_topology_binds_every_routing_key() {
        let parameters = BrokerSubscriptionParameter::new("S-orders", "S1", "orders-q")
            .with_exchange("orders", ExchangeType::Topic)
            .with_routing_key("orders.created")
            .with_routing_key("orders.*.eu");
        let topology = subscription_topology(&parameters);

        assert_eq!(topology.exchanges, vec![("orders".to_string(), ExchangeType::Topic)]);
        assert_eq!(topology.queue_names().collect::<Vec<_>>(), vec!["orders-q"]);
        assert_eq!(topology.bindings.len(), 2);
        assert_eq!(topology.bindings[1].2, "orders.*.eu");
    }

    #[test]
    fn test_topology_without_routing_keys() {
        let fanout = BrokerSubscriptionParameter::new("S-all", "S1", "all-q")
            .with_exchange("events", ExchangeType::Fanout);
        let topology = subscription_topology(&fanout);
        assert_eq!(
            topology.bindings,
            vec![("all-q".to_string(), "events".to_string(), String::new())]
        );

        let bare = subscription_topology(&BrokerSubscriptionParameter::new("S-q", "S1", "q"));
        assert!(bare.exchanges.is_empty());
        assert!(bare.bindings.is_empty());
    }
}
