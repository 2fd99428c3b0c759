//! Command line of the `rabbit-brokers` binary.
//!
//! Flags take precedence over the environment read by [`Settings`].

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::env::Settings;

/// Publish to and listen on configured RabbitMQ brokers
#[derive(Parser, Debug)]
#[command(name = "rabbit-brokers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish to and listen on configured RabbitMQ brokers")]
pub struct Cli {
    /// Configuration file path (otherwise BROKERS_CONFIG or the usual locations)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// AMQP URI replacing the address of every configured server
    #[arg(long)]
    pub amqp_addr: Option<String>,

    /// Log filter, e.g. `info` or `rabbit_brokers=debug`
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Pretty-print structured message bodies
    #[arg(long)]
    pub pretty_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = "brokers.json")]
        path: PathBuf,
    },

    /// Probe the connection of a server broker
    Check {
        /// Server configuration name
        server: String,
    },

    /// Publish one text message
    Publish {
        /// Publisher configuration name
        publisher: String,

        message: String,

        /// Routing key; the publisher's default routing key when omitted
        routing_key: Option<String>,
    },

    /// Print and commit deliveries until Ctrl+C
    Listen {
        /// Subscription configuration name
        subscription: String,
    },
}

impl Cli {
    /// Overlays the flags given on the command line onto `settings`.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(path) = &self.config {
            settings.config_path = Some(path.clone());
        }
        if let Some(addr) = &self.amqp_addr {
            settings.amqp_addr = Some(addr.clone());
        }
        if let Some(level) = &self.log_level {
            settings.log_filter = level.clone();
        }
        settings.pretty_json |= self.pretty_json;
        settings
    }
}
