// src/brokers/session.rs
// One transport channel per publisher or subscription, opened lazily.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::errors::{BrokerError, Result};
use crate::transport::{ChannelProvider, Topology, TransportChannel};

/// Queues declared through a broker's sessions.
pub(crate) type DeclaredQueues = Arc<Mutex<BTreeSet<String>>>;

/// Owns one transport channel.
///
/// The first caller opens the channel (declaring the topology when the
/// server allows it); later callers get the same channel, or a fresh one
/// if the transport reports it closed. The open path is guarded by an
/// async lock; the hot path only reads an atomic flag and the slot.
pub struct ChannelSession {
    id: String,
    provider: Arc<dyn ChannelProvider>,
    topology: Topology,
    declare_topology: bool,
    open_timeout: Duration,
    declared: Option<DeclaredQueues>,
    initialized: AtomicBool,
    generation: AtomicU64,
    init_lock: tokio::sync::Mutex<()>,
    channel: RwLock<Option<Arc<dyn TransportChannel>>>,
}

impl ChannelSession {
    pub(crate) fn new(
        id: String,
        provider: Arc<dyn ChannelProvider>,
        topology: Topology,
        declare_topology: bool,
        open_timeout: Duration,
        declared: Option<DeclaredQueues>,
    ) -> Self {
        debug!(
            session_id = %id,
            declare = %declare_topology,
            "Creating channel session"
        );

        Self {
            id,
            provider,
            topology,
            declare_topology,
            open_timeout,
            declared,
            initialized: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            init_lock: tokio::sync::Mutex::new(()),
            channel: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Bumped every time a channel is (re)opened.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The current channel if it is open.
    pub fn current(&self) -> Option<Arc<dyn TransportChannel>> {
        let slot = self.channel.read().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Returns an open channel, opening or re-opening it when needed.
    pub async fn channel(&self) -> Result<Arc<dyn TransportChannel>> {
        if self.is_initialized() {
            if let Some(channel) = self.current() {
                return Ok(channel);
            }
        }

        let _guard = self.init_lock.lock().await;

        // another caller may have opened it while we waited
        if self.is_initialized() {
            if let Some(channel) = self.current() {
                return Ok(channel);
            }
        }

        let first_open = !self.is_initialized();
        let channel = timeout(self.open_timeout, self.provider.open_channel())
            .await
            .map_err(|_| {
                BrokerError::TimeoutError(format!(
                    "opening channel for session {} timed out after {} seconds",
                    self.id,
                    self.open_timeout.as_secs()
                ))
            })??;

        if first_open && self.declare_topology {
            if let Err(e) = self.declare(channel.as_ref()).await {
                if let Err(close_error) = channel.close().await {
                    debug!(session_id = %self.id, "Closing channel after failed declaration: {}", close_error);
                }
                return Err(e);
            }
        }

        *self.channel.write().unwrap_or_else(|p| p.into_inner()) = Some(channel.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.initialized.store(true, Ordering::Release);

        if first_open {
            info!(session_id = %self.id, channel_id = %channel.id(), "Channel session initialized");
        } else {
            warn!(session_id = %self.id, channel_id = %channel.id(), "Channel was closed, reopened it");
        }
        Ok(channel)
    }

    async fn declare(&self, channel: &dyn TransportChannel) -> Result<()> {
        let declare = async {
            for (name, kind) in &self.topology.exchanges {
                channel.declare_exchange(name, *kind, true).await?;
            }
            for (name, options) in &self.topology.queues {
                channel.declare_queue(name, *options).await?;
            }
            for (queue, exchange, routing_key) in &self.topology.bindings {
                channel.bind_queue(queue, exchange, routing_key).await?;
            }
            Ok::<(), BrokerError>(())
        };

        timeout(self.open_timeout, declare).await.map_err(|_| {
            BrokerError::TimeoutError(format!("declaring topology for session {} timed out", self.id))
        })??;

        if let Some(declared) = &self.declared {
            let mut declared = declared.lock().unwrap_or_else(|p| p.into_inner());
            declared.extend(self.topology.queue_names().map(str::to_string));
        }
        Ok(())
    }

    /// Releases the channel. The session may be opened again afterwards.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        let channel = self.channel.write().unwrap_or_else(|p| p.into_inner()).take();
        self.initialized.store(false, Ordering::Release);

        if let Some(channel) = channel {
            debug!(session_id = %self.id, channel_id = %channel.id(), "Closing channel session");
            channel.close().await?;
        }
        Ok(())
    }
}
