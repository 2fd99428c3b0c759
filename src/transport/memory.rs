// src/transport/memory.rs
//! In-process transport that behaves like a small AMQP broker.
//!
//! Supports exchanges (direct, fanout, topic; headers exchanges fan out),
//! durable-free queues, bindings, channel transactions, consumers and
//! ack/nack/reject. Messages left unacknowledged on a channel that closes
//! go back to the front of their queue, as they would on RabbitMQ.
//!
//! Used by the test-suite and for running without a broker.

use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    ChannelProvider, Delivery, DeliveryAcker, DeliveryStream, MessageProperties, QueueOptions,
    TransportChannel,
};
use crate::brokers::configuration::ExchangeType;
use crate::brokers::errors::{BrokerError, Result};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

struct Unacked {
    message: QueuedMessage,
    channel_id: String,
}

struct MemoryQueue {
    options: QueueOptions,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, Unacked>,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    channels: HashMap<String, Arc<AtomicBool>>,
}

impl BrokerState {
    /// Queues a publish lands in. Missing exchanges and, on the default
    /// exchange, missing queues are channel errors.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                Ok(vec![routing_key.to_string()])
            } else {
                Err(BrokerError::ChannelError(format!(
                    "NOT_FOUND - no queue '{}' in vhost",
                    routing_key
                )))
            };
        }

        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            BrokerError::ChannelError(format!("NOT_FOUND - no exchange '{}' in vhost", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout | ExchangeType::Headers => true,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, targets: &[String], message: QueuedMessage) {
        for name in targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
    }

    /// Returns everything a channel still holds unacknowledged.
    fn release_channel(&mut self, channel_id: &str) {
        if let Some(flag) = self.channels.remove(channel_id) {
            flag.store(true, Ordering::SeqCst);
        }

        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            // highest tag first so the oldest ends up at the very front
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(mut unacked) = queue.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                }
            }
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    available: AtomicBool,
    commits_stalled: AtomicBool,
    channel_seq: AtomicU64,
    delivery_seq: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cheap-to-clone handle on one in-memory broker.
#[derive(Clone)]
pub struct InMemoryChannelProvider {
    shared: Arc<Shared>,
}

impl Default for InMemoryChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannelProvider {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
                commits_stalled: AtomicBool::new(false),
                channel_seq: AtomicU64::new(0),
                delivery_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Simulates the server going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        if !available {
            self.close_all_channels();
        }
    }

    /// Makes `tx.commit` hang until switched back, like an unresponsive server.
    pub fn set_commits_stalled(&self, stalled: bool) {
        self.shared.commits_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Closes every open channel as if the server had dropped them.
    pub fn close_all_channels(&self) {
        {
            let mut state = self.shared.state();
            let ids: Vec<String> = state.channels.keys().cloned().collect();
            for id in ids {
                state.release_channel(&id);
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Total channels opened since creation.
    pub fn channels_opened(&self) -> u64 {
        self.shared.channel_seq.load(Ordering::SeqCst)
    }

    pub fn open_channel_count(&self) -> usize {
        self.shared.state().channels.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state().queues.contains_key(name)
    }

    /// Declares a queue outside any channel, for test setup.
    pub fn ensure_queue(&self, name: &str) {
        self.shared
            .state()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(QueueOptions::default()));
    }

    /// Snapshot of the ready messages of a queue, front first.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared.state().queues.get(queue).map(|q| q.options)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChannelProvider for InMemoryChannelProvider {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionError(
                "connection refused by in-memory broker".to_string(),
            ));
        }

        let seq = self.shared.channel_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("memory-channel-{}", seq);
        let closed = Arc::new(AtomicBool::new(false));
        self.shared.state().channels.insert(id.clone(), closed.clone());
        debug!(channel_id = %id, "Opened in-memory channel");

        Ok(Arc::new(MemoryChannel {
            id,
            shared: self.shared.clone(),
            closed,
            transaction: Mutex::new(None),
        }))
    }

    async fn check_connection(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.close_all_channels();
        Ok(())
    }
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    message: QueuedMessage,
}

struct MemoryChannel {
    id: String,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    /// `Some` once the channel is in transactional mode.
    transaction: Mutex<Option<Vec<PendingPublish>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelError(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn transaction(&self) -> MutexGuard<'_, Option<Vec<PendingPublish>>> {
        self.transaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Channel-level exceptions close the channel, as on a real broker.
    fn fail(&self, error: BrokerError) -> BrokerError {
        self.shared.state().release_channel(&self.id);
        self.shared.notify.notify_waiters();
        error
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        let existing = {
            let mut state = self.shared.state();
            *state.exchanges.entry(name.to_string()).or_insert(kind)
        };
        if existing != kind {
            return Err(self.fail(BrokerError::ChannelError(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                name, existing
            ))));
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .state()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(options));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let missing = {
            let mut state = self.shared.state();
            if !state.queues.contains_key(queue) {
                Some(format!("NOT_FOUND - no queue '{}' in vhost", queue))
            } else if !state.exchanges.contains_key(exchange) {
                Some(format!("NOT_FOUND - no exchange '{}' in vhost", exchange))
            } else {
                let exists = state.bindings.iter().any(|b| {
                    b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
                });
                if !exists {
                    state.bindings.push(Binding {
                        queue: queue.to_string(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    });
                }
                None
            }
        };
        match missing {
            Some(reason) => Err(self.fail(BrokerError::ChannelError(reason))),
            None => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.ensure_open()?;

        let message = QueuedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            data: body,
            redelivered: false,
        };

        let routed = self.shared.state().route(exchange, routing_key);
        let targets = match routed {
            Ok(targets) => targets,
            Err(e) => return Err(self.fail(e)),
        };

        let mut transaction = self.transaction();
        if let Some(pending) = transaction.as_mut() {
            pending.push(PendingPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message,
            });
            return Ok(());
        }
        drop(transaction);

        self.shared.state().enqueue(&targets, message);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        let mut transaction = self.transaction();
        if transaction.is_none() {
            *transaction = Some(Vec::new());
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        if self.shared.commits_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending = match self.transaction().as_mut() {
            Some(pending) => std::mem::take(pending),
            None => {
                return Err(BrokerError::ChannelError(
                    "PRECONDITION_FAILED - channel is not transactional".to_string(),
                ))
            }
        };

        {
            let mut state = self.shared.state();
            for publish in pending {
                if let Ok(targets) = state.route(&publish.exchange, &publish.routing_key) {
                    state.enqueue(&targets, publish.message);
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.ensure_open()?;
        match self.transaction().as_mut() {
            Some(pending) => {
                pending.clear();
                Ok(())
            }
            None => Err(BrokerError::ChannelError(
                "PRECONDITION_FAILED - channel is not transactional".to_string(),
            )),
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>> {
        self.ensure_open()?;
        Ok(self
            .shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        let purged = {
            let mut state = self.shared.state();
            state.queues.get_mut(queue).map(|q| {
                let count = q.ready.len() as u32;
                q.ready.clear();
                count
            })
        };
        purged.ok_or_else(|| {
            self.fail(BrokerError::ChannelError(format!(
                "NOT_FOUND - no queue '{}' in vhost",
                queue
            )))
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, _prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        if !self.has_queue(queue) {
            return Err(self.fail(BrokerError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}' in vhost",
                queue
            ))));
        }
        debug!(channel_id = %self.id, consumer_tag = %consumer_tag, queue = %queue, "Consumer attached");

        let cursor = ConsumerCursor {
            shared: self.shared.clone(),
            closed: self.closed.clone(),
            queue: queue.to_string(),
            channel_id: self.id.clone(),
        };

        let stream = stream::unfold(cursor, |cursor| async move {
            loop {
                let notified = cursor.shared.notify.notified();
                if cursor.closed.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(delivery) = cursor.take_next() {
                    drop(notified);
                    return Some((Ok(delivery), cursor));
                }
                notified.await;
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_closed() {
            self.shared.state().release_channel(&self.id);
            self.shared.notify.notify_waiters();
            debug!(channel_id = %self.id, "Closed in-memory channel");
        }
        Ok(())
    }
}

impl MemoryChannel {
    fn has_queue(&self, queue: &str) -> bool {
        self.shared.state().queues.contains_key(queue)
    }
}

struct ConsumerCursor {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    queue: String,
    channel_id: String,
}

impl ConsumerCursor {
    fn take_next(&self) -> Option<Delivery> {
        let mut state = self.shared.state();
        let queue = state.queues.get_mut(&self.queue)?;
        let message = queue.ready.pop_front()?;
        let tag = self.shared.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1;

        queue.unacked.insert(
            tag,
            Unacked {
                message: message.clone(),
                channel_id: self.channel_id.clone(),
            },
        );

        Some(Delivery {
            delivery_tag: tag,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            properties: message.properties,
            data: message.data,
            acker: Arc::new(MemoryAcker {
                shared: self.shared.clone(),
                closed: self.closed.clone(),
                queue: self.queue.clone(),
                delivery_tag: tag,
            }),
        })
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AckError(format!(
                "channel closed before delivery {} was settled",
                self.delivery_tag
            )));
        }

        {
            let mut state = self.shared.state();
            let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
                BrokerError::AckError(format!("queue '{}' no longer exists", self.queue))
            })?;
            let unacked = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
                BrokerError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    self.delivery_tag
                ))
            })?;
            if requeue {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        if requeue {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }
}
