// src/config.rs
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Result, Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, debug, warn};

use crate::brokers::{
    BrokerPublishParameter, BrokerSubscriptionParameter, ExchangeType, FactoryBrokers,
    ServerBrokerConfiguration,
};

pub const CONFIG_ENV_VAR: &str = "BROKERS_CONFIG";
const CONFIG_FILE_NAME: &str = "brokers.json";

/// Layout of a brokers configuration file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokersConfig {
    #[serde(default)]
    pub servers: Vec<ServerBrokerConfiguration>,
    #[serde(default)]
    pub publishers: Vec<BrokerPublishParameter>,
    #[serde(default)]
    pub subscriptions: Vec<BrokerSubscriptionParameter>,
}

impl BrokersConfig {
    /// Registers every record with `factory`, servers first.
    pub fn load_into(&self, factory: &FactoryBrokers) {
        for server in &self.servers {
            factory.add(server.clone());
        }
        for publisher in &self.publishers {
            factory.add(publisher.clone());
        }
        for subscription in &self.subscriptions {
            factory.add(subscription.clone());
        }
        debug!(
            servers = self.servers.len(),
            publishers = self.publishers.len(),
            subscriptions = self.subscriptions.len(),
            "Loaded broker configuration into factory"
        );
    }

    /// Names of publishers and subscriptions pointing at a server the file
    /// does not define. They may still resolve if registered elsewhere.
    pub fn dangling_references(&self) -> Vec<String> {
        let known = |server: &str| self.servers.iter().any(|s| s.name == server);
        self.publishers
            .iter()
            .filter(|p| !known(&p.server_name))
            .map(|p| p.name.clone())
            .chain(
                self.subscriptions
                    .iter()
                    .filter(|s| !known(&s.server_name))
                    .map(|s| s.name.clone()),
            )
            .collect()
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(&explicit);
        if path.exists() {
            debug!("Found config file from {}: {}", CONFIG_ENV_VAR, path.display());
            return Ok(path);
        }
        return Err(anyhow!("{} points to {}, which does not exist", CONFIG_ENV_VAR, explicit));
    }

    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {}. Set {} or create one in the current directory, \
         ./config, or your home directory (as .{}).",
        CONFIG_FILE_NAME,
        CONFIG_ENV_VAR,
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<BrokersConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<BrokersConfig> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let config: BrokersConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    if let Some(server) = config.servers.iter().find(|s| s.name.trim().is_empty()) {
        return Err(anyhow!("Configuration error: server with host '{}' has no name", server.hostname));
    }
    for name in config.dangling_references() {
        warn!("'{}' refers to a server not defined in {}", name, config_path.display());
    }

    info!(
        "Loaded broker configuration from {} ({} servers, {} publishers, {} subscriptions)",
        config_path.display(),
        config.servers.len(),
        config.publishers.len(),
        config.subscriptions.len()
    );
    Ok(config)
}

/// Configuration for a local broker: one server, one publisher and one
/// subscription on the same queue.
pub fn default_config() -> BrokersConfig {
    BrokersConfig {
        servers: vec![ServerBrokerConfiguration::new("local").with_config_allowed(true)],
        publishers: vec![BrokerPublishParameter::new("events", "local")
            .with_exchange("events", ExchangeType::Topic)
            .with_default_routing_key("events.default")],
        subscriptions: vec![BrokerSubscriptionParameter::new("events-listener", "local", "events.default")
            .with_exchange("events", ExchangeType::Topic)
            .with_routing_key("events.#")],
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&default_config())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
