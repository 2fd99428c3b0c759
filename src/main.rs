use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_brokers::brokers::{callback, BrokerContext, FactoryBrokers, ServerBrokerConfiguration};
use rabbit_brokers::cli::{Cli, Commands};
use rabbit_brokers::config::{self, BrokersConfig};
use rabbit_brokers::env::Settings;
use rabbit_brokers::message::MessageCodec;
use rabbit_brokers::rabbitmq::LapinChannelProvider;
use rabbit_brokers::transport::ChannelProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is loaded before the flags are parsed
    let settings = Settings::load()?;
    let cli = Cli::parse();
    let settings = cli.apply(settings);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .init();

    if let Commands::InitConfig { path } = &cli.command {
        return config::create_default_config_file(path);
    }

    let factory = build_factory(&settings)?;

    match cli.command {
        Commands::InitConfig { .. } => {}
        Commands::Check { server } => {
            let broker = factory.create_server_broker(&server)?;
            let alive = broker.check_connection().await;
            info!(server = %server, alive, "Connection check");
            broker.close().await;
            if !alive {
                return Err(anyhow!("server broker '{}' is not reachable", server));
            }
        }
        Commands::Publish {
            publisher,
            message,
            routing_key,
        } => {
            let publisher_handle = factory.create_publisher(&publisher)?;
            match routing_key {
                Some(routing_key) => {
                    publisher_handle
                        .publish_to(routing_key.as_str(), message, None)
                        .await?
                }
                None => publisher_handle.publish(message, None).await?,
            }
            info!(publisher = %publisher, "Message published");
            publisher_handle.close().await;
        }
        Commands::Listen { subscription } => {
            let handler = callback(|context: Box<dyn BrokerContext>| async move {
                info!(
                    routing_key = %context.routing_key(),
                    transaction_id = %context.transaction_id(),
                    "Received: {}",
                    context.utf8_data()
                );
                context.commit().await?;
                Ok::<(), anyhow::Error>(())
            });

            let running = factory.create_subscription(&subscription, handler).await?;
            info!(subscription = %subscription, "Listening, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            running.close().await;
        }
    }

    Ok(())
}

fn build_factory(settings: &Settings) -> Result<FactoryBrokers> {
    let mut brokers_config: BrokersConfig = match &settings.config_path {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };

    if let Some(addr) = &settings.amqp_addr {
        for server in brokers_config.servers.iter_mut() {
            server.uri = Some(addr.clone());
        }
    }

    let factory = FactoryBrokers::with_codec(
        Arc::new(|server: &ServerBrokerConfiguration| {
            Arc::new(LapinChannelProvider::new(server)) as Arc<dyn ChannelProvider>
        }),
        MessageCodec::new(settings.pretty_json),
    );
    brokers_config.load_into(&factory);
    Ok(factory)
}
