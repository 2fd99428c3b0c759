// src/rabbitmq/mod.rs
// RabbitMQ implementation of the transport seam, built on lapin

mod channel;
pub mod connection;

pub use channel::LapinChannel;
pub use connection::{ConnectionManager, LapinChannelProvider};
