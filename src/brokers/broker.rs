// src/brokers/broker.rs
// Runtime object bound to one server configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::configuration::{BrokerPublishParameter, BrokerSubscriptionParameter, ServerBrokerConfiguration};
use super::context::ContextFactory;
use super::errors::{BrokerError, Result};
use super::factory::FactoryBrokers;
use super::publisher::Publisher;
use super::session::{ChannelSession, DeclaredQueues};
use super::subscription::{Subscription, SubscriptionCallback};
use crate::message::MessageCodec;
use crate::rabbitmq::LapinChannelProvider;
use crate::transport::{ChannelProvider, Topology, TransportChannel};

struct BrokerInner {
    configuration: ServerBrokerConfiguration,
    provider: Arc<dyn ChannelProvider>,
    factory: Option<FactoryBrokers>,
    sessions: Mutex<Vec<Weak<ChannelSession>>>,
    declared_queues: DeclaredQueues,
    codec: MessageCodec,
    closed: AtomicBool,
}

/// Aggregates the channel provider of one server.
///
/// Clones share the same provider, sessions and declared-queue registry.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Broker on a RabbitMQ server; the connection is opened on first use.
    pub fn new(configuration: ServerBrokerConfiguration) -> Self {
        let provider: Arc<dyn ChannelProvider> = Arc::new(LapinChannelProvider::new(&configuration));
        Self::from_parts(configuration, provider, None, MessageCodec::default())
    }

    pub fn with_provider(
        configuration: ServerBrokerConfiguration,
        provider: Arc<dyn ChannelProvider>,
    ) -> Self {
        Self::from_parts(configuration, provider, None, MessageCodec::default())
    }

    pub(crate) fn from_parts(
        configuration: ServerBrokerConfiguration,
        provider: Arc<dyn ChannelProvider>,
        factory: Option<FactoryBrokers>,
        codec: MessageCodec,
    ) -> Self {
        debug!(
            server = %configuration.name,
            config_allowed = configuration.config_allowed,
            "Creating broker"
        );

        Self {
            inner: Arc::new(BrokerInner {
                configuration,
                provider,
                factory,
                sessions: Mutex::new(Vec::new()),
                declared_queues: DeclaredQueues::default(),
                codec,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn configuration(&self) -> &ServerBrokerConfiguration {
        &self.inner.configuration
    }

    pub fn codec(&self) -> MessageCodec {
        self.inner.codec
    }

    /// The factory that built this broker, `None` when built directly.
    pub fn factory(&self) -> Option<&FactoryBrokers> {
        self.inner.factory.as_ref()
    }

    /// Set once `close` has run; consume loops stop re-attaching.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn new_session(&self, id: String, topology: Topology) -> Arc<ChannelSession> {
        let session = Arc::new(ChannelSession::new(
            id,
            self.inner.provider.clone(),
            topology,
            self.inner.configuration.config_allowed,
            self.inner.configuration.continuation_timeout(),
            Some(self.inner.declared_queues.clone()),
        ));

        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        session
    }

    /// Probes the server without declaring or publishing anything.
    pub async fn check_connection(&self) -> bool {
        let alive = self.inner.provider.check_connection().await;
        debug!(server = %self.inner.configuration.name, alive, "Checked connection");
        alive
    }

    /// A publisher bound to this broker. No channel is opened yet.
    pub fn get_publisher(&self, parameters: BrokerPublishParameter) -> Publisher {
        Publisher::new(self.clone(), parameters)
    }

    /// Starts consuming `parameters.storage_queue_name`, handing every
    /// delivery to `callback`. `context_factory` replaces the default
    /// context construction.
    pub async fn subscribe(
        &self,
        parameters: BrokerSubscriptionParameter,
        callback: SubscriptionCallback,
        context_factory: Option<ContextFactory>,
    ) -> Result<Subscription> {
        Subscription::start(self.clone(), parameters, callback, context_factory).await
    }

    /// Opens a short-lived channel for an administrative call.
    async fn admin_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let open_timeout = self.inner.configuration.continuation_timeout();
        timeout(open_timeout, self.inner.provider.open_channel())
            .await
            .map_err(|_| {
                BrokerError::TimeoutError(format!(
                    "opening channel on '{}' timed out after {} seconds",
                    self.inner.configuration.name,
                    open_timeout.as_secs()
                ))
            })?
    }

    /// Ready messages in `queue`; 0 when the queue does not exist.
    pub async fn get_queue_depth(&self, queue: &str) -> Result<u32> {
        let channel = self.admin_channel().await?;
        let depth = channel.queue_depth(queue).await;
        if let Err(e) = channel.close().await {
            debug!("Closing admin channel failed: {}", e);
        }

        match depth? {
            Some(count) => Ok(count),
            None => {
                debug!(queue = %queue, "Queue does not exist, depth is 0");
                Ok(0)
            }
        }
    }

    /// Purges every queue declared through this broker's sessions.
    ///
    /// Each queue gets its own channel: a purge failure closes the channel
    /// it ran on.
    pub async fn reset(&self) -> Result<()> {
        let queues: Vec<String> = {
            let declared = self
                .inner
                .declared_queues
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            declared.iter().cloned().collect()
        };

        for queue in queues {
            let channel = self.admin_channel().await?;
            let result = match channel.queue_depth(&queue).await {
                Ok(Some(_)) => channel.purge_queue(&queue).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            if let Err(e) = channel.close().await {
                debug!("Closing admin channel failed: {}", e);
            }

            match result? {
                Some(purged) => info!(queue = %queue, purged, "Queue purged"),
                None => debug!(queue = %queue, "Queue vanished before reset"),
            }
        }
        Ok(())
    }

    /// Closes every live session of this broker, then the connection.
    /// Never fails; teardown problems are logged.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let sessions: Vec<Arc<ChannelSession>> = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(|p| p.into_inner());
            let live = sessions.iter().filter_map(Weak::upgrade).collect();
            sessions.clear();
            live
        };

        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(session_id = %session.id(), "Closing session failed: {}", e);
            }
        }

        if let Err(e) = self.inner.provider.close().await {
            warn!(server = %self.inner.configuration.name, "Closing connection failed: {}", e);
        }
        info!(server = %self.inner.configuration.name, "Broker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryChannelProvider;

    fn broker(provider: &InMemoryChannelProvider, config_allowed: bool) -> Broker {
        Broker::with_provider(
            ServerBrokerConfiguration::new("S1").with_config_allowed(config_allowed),
            Arc::new(provider.clone()),
        )
    }

    #[tokio::test]
    async fn test_queue_depth_of_missing_queue_is_zero() {
        let provider = InMemoryChannelProvider::new();
        let broker = broker(&provider, true);
        assert_eq!(broker.get_queue_depth("never-declared").await.unwrap(), 0);
        assert_eq!(provider.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_purges_declared_queues_only() {
        let provider = InMemoryChannelProvider::new();
        let broker = broker(&provider, true);
        provider.ensure_queue("foreign");

        let publisher =
            broker.get_publisher(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
        publisher.publish("one", None).await.unwrap();
        publisher.publish("two", None).await.unwrap();
        publisher.publish_to("foreign", "three", None).await.unwrap();
        assert_eq!(broker.get_queue_depth("q1").await.unwrap(), 2);

        broker.reset().await.unwrap();
        assert_eq!(broker.get_queue_depth("q1").await.unwrap(), 0);
        assert_eq!(broker.get_queue_depth("foreign").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_connection_follows_provider() {
        let provider = InMemoryChannelProvider::new();
        let broker = broker(&provider, false);
        assert!(broker.check_connection().await);
        provider.set_available(false);
        assert!(!broker.check_connection().await);
        assert!(broker.factory().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_sessions() {
        let provider = InMemoryChannelProvider::new();
        let broker = broker(&provider, true);
        let publisher =
            broker.get_publisher(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
        publisher.initialize().await.unwrap();
        assert_eq!(provider.open_channel_count(), 1);

        broker.close().await;
        assert!(broker.is_closed());
        assert_eq!(provider.open_channel_count(), 0);
    }
}
