// src/brokers/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BrokerError {
    /// True for errors raised by the broker transport rather than by misuse.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionError(_)
                | BrokerError::ChannelError(_)
                | BrokerError::PublishError(_)
                | BrokerError::ConsumeError(_)
                | BrokerError::AckError(_)
                | BrokerError::TimeoutError(_)
        )
    }
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

// Converting from lapin errors
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") {
            BrokerError::ConnectionError(error_text)
        } else if error_text.contains("channel") {
            BrokerError::ChannelError(error_text)
        } else if error_text.contains("publish") {
            BrokerError::PublishError(error_text)
        } else if error_text.contains("consume") {
            BrokerError::ConsumeError(error_text)
        } else if error_text.contains("ack") || error_text.contains("nack") {
            BrokerError::AckError(error_text)
        } else {
            BrokerError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_: Elapsed) -> Self {
        BrokerError::TimeoutError("operation timed out".to_string())
    }
}

impl From<String> for BrokerError {
    fn from(message: String) -> Self {
        BrokerError::Unknown(message)
    }
}

impl From<&str> for BrokerError {
    fn from(message: &str) -> Self {
        BrokerError::Unknown(message.to_string())
    }
}
