use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties, Error as LapinError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::channel::LapinChannel;
use crate::brokers::configuration::ServerBrokerConfiguration;
use crate::brokers::errors::{BrokerError, Result};
use crate::transport::{ChannelProvider, TransportChannel};

/// Owns the single lapin connection of a broker and re-establishes it
/// with exponential backoff when it drops.
pub struct ConnectionManager {
    uri: String,
    connection: Mutex<Option<Arc<Connection>>>,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(uri: &str) -> Self {
        ConnectionManager {
            uri: uri.to_string(),
            connection: Mutex::new(None),
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
            connect_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }

        let conn = Arc::new(self.establish_connection().await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// True if a live connection exists or a single attempt succeeds.
    pub async fn probe(&self) -> bool {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return true;
            }
        }

        match self.connect_once().await {
            Ok(conn) => {
                *guard = Some(Arc::new(conn));
                true
            }
            Err(err) => {
                debug!("Connection probe failed: {}", err);
                false
            }
        }
    }

    async fn connect_once(&self) -> Result<Connection> {
        let conn = timeout(
            self.connect_timeout,
            Connection::connect(&self.uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            BrokerError::TimeoutError(format!(
                "connecting to RabbitMQ timed out after {} seconds",
                self.connect_timeout.as_secs()
            ))
        })??;
        Ok(conn)
    }

    async fn establish_connection(&self) -> Result<Connection> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            info!("Attempting to connect to RabbitMQ at {}", redact(&self.uri));

            match self.connect_once().await {
                Ok(conn) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_reconnect_attempts, err
                    );

                    if attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay * 2, 30000); // Cap at 30 seconds
                }
            }
        }
    }

    pub async fn close(&self) -> std::result::Result<(), LapinError> {
        if let Some(conn) = self.connection.lock().await.take() {
            if conn.status().connected() {
                info!("Closing RabbitMQ connection gracefully");
                conn.close(200, "Closing connection").await?;
            }
        }
        Ok(())
    }
}

/// Hides the password part of an AMQP URI for logs.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &uri[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &uri[..scheme_end + 3],
                    &credentials[..colon],
                    &uri[at..]
                ),
                None => uri.to_string(),
            }
        }
        _ => uri.to_string(),
    }
}

/// Channel provider backed by a RabbitMQ server through lapin.
pub struct LapinChannelProvider {
    manager: ConnectionManager,
    continuation_timeout: Duration,
}

impl LapinChannelProvider {
    pub fn new(server: &ServerBrokerConfiguration) -> Self {
        let continuation_timeout = server.continuation_timeout();
        Self {
            manager: ConnectionManager::new(&server.amqp_uri())
                .with_reconnect_policy(5, 1000)
                .with_connect_timeout(continuation_timeout),
            continuation_timeout,
        }
    }
}

#[async_trait]
impl ChannelProvider for LapinChannelProvider {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let connection = self.manager.get_connection().await?;
        let channel = timeout(self.continuation_timeout, connection.create_channel())
            .await
            .map_err(|_| BrokerError::TimeoutError("opening channel timed out".to_string()))??;

        let id = format!("channel-{}", &Uuid::new_v4().to_string()[..8]);
        debug!(channel_id = %id, "Created lapin channel");
        Ok(Arc::new(LapinChannel::new(id, channel)))
    }

    async fn check_connection(&self) -> bool {
        self.manager.probe().await
    }

    async fn close(&self) -> Result<()> {
        self.manager.close().await?;
        Ok(())
    }
}
