use clap::Parser;
use cmux_gateway::{Options, spawn_gateway};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cmux_gateway=info,hyper=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let config = Options::parse().into_config();
    info!(
        bind = %config.bind_addr,
        domains = ?config.domains,
        raw_ports = ?config.raw_ports,
        "starting cmux gateway"
    );

    let handle = match spawn_gateway(config).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(%err, "failed to start gateway");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    handle.shutdown().await;
}
