// src/brokers/publisher.rs

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::configuration::{BrokerPublishParameter, ServerBrokerConfiguration};
use super::errors::{BrokerError, Result};
use super::session::ChannelSession;
use crate::headers::{translate_headers, MessageHeaders};
use crate::message::{MessageCodec, Payload};
use crate::transport::{MessageProperties, QueueOptions, Topology, TransportChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Open,
    /// Abandoned by its scope; rolled back before the next transactional
    /// operation, or by a spawned task, whichever runs first.
    RollbackPending,
}

struct TxSlot {
    state: TxState,
    id: Option<Uuid>,
    generation: u64,
    /// Channel generation switched into transactional mode. AMQP has no way
    /// back, so plain publishes on that channel are committed one by one.
    selected: Option<u64>,
}

struct PublisherInner {
    broker: Broker,
    parameters: BrokerPublishParameter,
    session: Arc<ChannelSession>,
    codec: MessageCodec,
    publish_timeout: Duration,
    tx: Mutex<TxSlot>,
    tx_lock: tokio::sync::Mutex<()>,
}

/// Publishes messages for one named publisher configuration.
///
/// Cheap to clone; clones share the channel session and the transaction
/// state. The channel is opened on first use.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub(crate) fn new(broker: Broker, parameters: BrokerPublishParameter) -> Self {
        let server = broker.configuration();
        let topology = publish_topology(&parameters);
        let publish_timeout = server.continuation_timeout();
        let session = broker.new_session(format!("publisher-{}", parameters.name), topology);
        let codec = broker.codec();

        Self {
            inner: Arc::new(PublisherInner {
                broker,
                parameters,
                session,
                codec,
                publish_timeout,
                tx: Mutex::new(TxSlot {
                    state: TxState::Idle,
                    id: None,
                    generation: 0,
                    selected: None,
                }),
                tx_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn parameters(&self) -> &BrokerPublishParameter {
        &self.inner.parameters
    }

    pub fn server_configuration(&self) -> &ServerBrokerConfiguration {
        self.inner.broker.configuration()
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Publishes on the configured default routing key.
    pub async fn publish(
        &self,
        message: impl Into<Payload>,
        headers: Option<MessageHeaders>,
    ) -> Result<()> {
        let routing_key = self
            .inner
            .parameters
            .default_routing_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                BrokerError::MissingConfiguration(
                    "parameter 'default_routing_key' is missing or empty".to_string(),
                )
            })?;

        self.inner
            .publish_impl(&routing_key, message.into(), headers)
            .await
    }

    /// Publishes on an explicit routing key; `None` is rejected.
    pub async fn publish_to<'a>(
        &self,
        routing_key: impl Into<Option<&'a str>>,
        message: impl Into<Payload>,
        headers: Option<MessageHeaders>,
    ) -> Result<()> {
        let routing_key = routing_key
            .into()
            .ok_or_else(|| BrokerError::MissingConfiguration("routing_key".to_string()))?;

        self.inner
            .publish_impl(routing_key, message.into(), headers)
            .await
    }

    /// Opens (or reopens) the channel session.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.ensure_channel().await.map(|_| ())
    }

    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let id = self.inner.begin_transaction().await?;
        Ok(Transaction {
            publisher: self.inner.clone(),
            id,
            completed: false,
        })
    }

    /// Commits whichever transaction is currently open.
    pub async fn commit(&self) -> Result<()> {
        self.inner.commit(None).await
    }

    /// No-op when no transaction is open or the channel is already gone.
    pub async fn rollback(&self) -> Result<()> {
        self.inner.rollback(None).await
    }

    /// Identifier of the transaction currently open, if any.
    pub fn current_transaction(&self) -> Option<Uuid> {
        let slot = self.inner.tx();
        match slot.state {
            TxState::Open => slot.id,
            _ => None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.tx().state != TxState::Idle
    }

    /// Rolls back any open transaction and releases the channel.
    /// Never fails; teardown problems are logged.
    pub async fn close(&self) {
        self.inner.dispose().await;
    }
}

fn publish_topology(parameters: &BrokerPublishParameter) -> Topology {
    let mut topology = Topology::default();

    if let Some(exchange) = parameters
        .exchange_name
        .as_ref()
        .filter(|name| !name.trim().is_empty())
    {
        topology
            .exchanges
            .push((exchange.clone(), parameters.exchange_type));
    }

    // a default routing key means direct-to-queue publishing, so the queue must exist
    if let Some(queue) = parameters
        .default_routing_key
        .as_ref()
        .filter(|key| !key.trim().is_empty())
    {
        topology.queues.push((queue.clone(), QueueOptions::default()));
    }

    topology
}

impl PublisherInner {
    fn tx(&self) -> MutexGuard<'_, TxSlot> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn exchange_name(&self) -> &str {
        self.parameters.exchange_name.as_deref().unwrap_or("")
    }

    /// Opens or reopens the session and checks that a transaction in
    /// progress survived.
    async fn ensure_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self.session.channel().await?;

        let mut slot = self.tx();
        if slot.state == TxState::Open && slot.generation != self.session.generation() {
            slot.state = TxState::Idle;
            slot.id = None;
            warn!(
                publisher = %self.parameters.name,
                "Channel was reopened, the open transaction was lost"
            );
            return Err(BrokerError::IllegalState(
                "transaction lost because the channel was reopened".to_string(),
            ));
        }
        Ok(channel)
    }

    async fn publish_impl(
        &self,
        routing_key: &str,
        message: Payload,
        headers: Option<MessageHeaders>,
    ) -> Result<()> {
        let headers = translate_headers(headers);
        let body = self.codec.encode(&message)?;

        let channel = self.ensure_channel().await?;

        let tx_guard = if self.is_transactional() {
            let guard = self.tx_lock.lock().await;
            self.settle_abandoned().await;
            Some(guard)
        } else {
            None
        };
        let autocommit = tx_guard.is_some() && self.tx().state != TxState::Open;

        let properties = MessageProperties {
            delivery_mode: self.parameters.delivery_mode.as_u8(),
            expiration: self
                .parameters
                .expiration_message
                .clone()
                .filter(|e| !e.is_empty()),
            headers,
            content_type: Some(message.content_type().to_string()),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp() as u64),
        };

        let exchange = self.exchange_name();
        timeout(
            self.publish_timeout,
            channel.publish(exchange, routing_key, properties, body),
        )
        .await
        .map_err(|_| {
            BrokerError::TimeoutError(format!(
                "publish to '{}' with routing key '{}' timed out after {} seconds",
                exchange,
                routing_key,
                self.publish_timeout.as_secs()
            ))
        })??;

        if autocommit {
            self.bounded_commit(channel.as_ref()).await?;
        }

        debug!(
            publisher = %self.parameters.name,
            exchange = %exchange,
            routing_key = %routing_key,
            "Published message"
        );
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        self.tx().selected == Some(self.session.generation())
    }

    async fn begin_transaction(&self) -> Result<Uuid> {
        let _tx_guard = self.tx_lock.lock().await;
        self.settle_abandoned().await;

        let channel = self.session.channel().await?;

        let id = Uuid::new_v4();
        {
            let mut slot = self.tx();
            if slot.state != TxState::Idle {
                return Err(BrokerError::IllegalState(
                    "a RabbitMQ transaction is already open on this session".to_string(),
                ));
            }
            slot.state = TxState::Open;
            slot.id = Some(id);
            slot.generation = self.session.generation();
        }

        let selected = timeout(self.publish_timeout, channel.begin_transaction())
            .await
            .map_err(BrokerError::from)
            .and_then(|r| r);
        if let Err(e) = selected {
            let mut slot = self.tx();
            slot.state = TxState::Idle;
            slot.id = None;
            return Err(e);
        }
        self.tx().selected = Some(self.session.generation());

        debug!(publisher = %self.parameters.name, transaction = %id, "Transaction opened");
        Ok(id)
    }

    async fn bounded_commit(&self, channel: &dyn TransportChannel) -> Result<()> {
        timeout(self.publish_timeout, channel.commit_transaction())
            .await
            .map_err(|_| {
                BrokerError::TimeoutError(format!(
                    "commit on publisher '{}' timed out after {} seconds",
                    self.parameters.name,
                    self.publish_timeout.as_secs()
                ))
            })?
    }

    /// `expected` pins the commit to one transaction; `None` takes the
    /// current one.
    async fn commit(&self, expected: Option<Uuid>) -> Result<()> {
        let _tx_guard = self.tx_lock.lock().await;
        {
            let slot = self.tx();
            if slot.state != TxState::Open {
                return Err(BrokerError::IllegalState(
                    "no transaction is open on this session".to_string(),
                ));
            }
            if let Some(id) = expected.filter(|id| slot.id != Some(*id)) {
                return Err(BrokerError::IllegalState(format!(
                    "transaction {} is no longer the open transaction",
                    id
                )));
            }
        }

        let channel = self.ensure_channel().await?;
        self.bounded_commit(channel.as_ref()).await?;

        let mut slot = self.tx();
        debug!(publisher = %self.parameters.name, transaction = ?slot.id, "Transaction committed");
        slot.state = TxState::Idle;
        slot.id = None;
        Ok(())
    }

    /// A stale `expected` id leaves the current transaction alone.
    async fn rollback(&self, expected: Option<Uuid>) -> Result<()> {
        let _tx_guard = self.tx_lock.lock().await;
        if let Some(id) = expected {
            let slot = self.tx();
            if slot.state != TxState::Open || slot.id != Some(id) {
                debug!(
                    publisher = %self.parameters.name,
                    transaction = %id,
                    "Rollback of a finished transaction ignored"
                );
                return Ok(());
            }
        }
        self.rollback_locked().await
    }

    /// Caller holds `tx_lock`.
    async fn rollback_locked(&self) -> Result<()> {
        let idle = self.tx().state == TxState::Idle;
        if idle {
            return Ok(());
        }

        let result = match self.session.current() {
            Some(channel) => channel.rollback_transaction().await,
            None => Ok(()),
        };

        let mut slot = self.tx();
        debug!(publisher = %self.parameters.name, transaction = ?slot.id, "Transaction rolled back");
        slot.state = TxState::Idle;
        slot.id = None;
        result
    }

    /// Finishes the rollback of a transaction whose scope ended without
    /// commit. Caller holds `tx_lock`.
    async fn settle_abandoned(&self) {
        let pending = self.tx().state == TxState::RollbackPending;
        if !pending {
            return;
        }
        if let Err(e) = self.rollback_locked().await {
            warn!(publisher = %self.parameters.name, "Rollback of abandoned transaction failed: {}", e);
        }
    }

    /// Called from `Transaction::drop`.
    fn abandon(self: &Arc<Self>, id: Uuid) {
        {
            let mut slot = self.tx();
            if slot.state != TxState::Open || slot.id != Some(id) {
                return;
            }
            slot.state = TxState::RollbackPending;
            slot.id = None;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    let _tx_guard = inner.tx_lock.lock().await;
                    inner.settle_abandoned().await;
                });
            }
            Err(_) => warn!(
                publisher = %self.parameters.name,
                "No runtime to roll back abandoned transaction; it rolls back on next use"
            ),
        }
    }

    async fn dispose(&self) {
        {
            let _tx_guard = self.tx_lock.lock().await;
            if let Err(e) = self.rollback_locked().await {
                warn!(publisher = %self.parameters.name, "Rollback during dispose failed: {}", e);
            }
        }

        if let Err(e) = self.session.close().await {
            warn!(publisher = %self.parameters.name, "Releasing channel failed: {}", e);
        }
        info!(publisher = %self.parameters.name, "Publisher closed");
    }
}

impl Drop for PublisherInner {
    fn drop(&mut self) {
        if !self.session.is_initialized() {
            return;
        }

        let session = self.session.clone();
        let tx_open = self.tx().state != TxState::Idle;
        let name = self.parameters.name.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if tx_open {
                    if let Some(channel) = session.current() {
                        if let Err(e) = channel.rollback_transaction().await {
                            warn!(publisher = %name, "Rollback on drop failed: {}", e);
                        }
                    }
                }
                if let Err(e) = session.close().await {
                    warn!(publisher = %name, "Releasing channel on drop failed: {}", e);
                }
            });
        }
    }
}

/// Scope of one channel transaction.
///
/// Dropping it without `commit` rolls the transaction back.
pub struct Transaction {
    publisher: Arc<PublisherInner>,
    id: Uuid,
    completed: bool,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            inner: self.publisher.clone(),
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        self.publisher.commit(Some(self.id)).await?;
        self.completed = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.publisher.rollback(Some(self.id)).await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.completed {
            debug!(transaction = %self.id, "Transaction scope ended without commit");
            self.publisher.abandon(self.id);
        }
    }
}
