//! postbus demo server
//!
//! Serves a small echo service over the postbus wire protocol, configured
//! from the YAML file named by `POSTBUS_CONFIG` (defaults otherwise).

use postbus_core::ReceiveContext;
use postbus_protocol::Envelope;
use postbus_server::{Config, HashService, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("POSTBUS_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting postbus demo server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  TLS: {}",
        if config.tls.enabled { "enabled" } else { "disabled" }
    );

    let echo = HashService::new("echo")
        .method("say", |ctx: ReceiveContext| async move {
            Ok(Envelope::new(ctx.body.clone()))
        })
        .method("reverse", |ctx: ReceiveContext| async move {
            let mut reversed = ctx.body.to_vec();
            reversed.reverse();
            Ok(Envelope::new(reversed.into()))
        });
    tracing::info!("  echo.say request id: {:#x}", echo.request_id("say"));

    let mut server = Server::new(ServerConfig::from_config(&config)?);
    server.apply_filter_settings(&config.filters);
    server.register_service(Box::new(echo));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, draining");
    server.stop().await;
    tracing::info!("Final {}", server.stats());
    Ok(())
}
