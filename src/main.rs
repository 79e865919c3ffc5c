//! Tollgate - policy gateway for content-addressed storage nodes

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::{
    config::{Args, GatewayConfig},
    pin,
    server::{self, exporter, Backends},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tollgate={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = Arc::new(GatewayConfig::from_args(&args)?);

    info!("======================================");
    info!("  Tollgate - storage node gateway");
    info!("======================================");
    info!("Listen: {}", config.listen);
    info!("Upstream: {}", config.upstream_url);
    info!("Public hostname: {}", config.public_hostname);
    info!("Mode: {}", if config.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!(
        "Auth: {}",
        if config.verify_key.is_some() { "enabled" } else { "disabled" }
    );
    info!(
        "Metering: {}",
        config.collector_url.as_deref().unwrap_or("disabled")
    );
    info!("Whitelist: {} namespace(s)", config.whitelist.len());
    info!("Request timeout: {}s", config.default_timeout.as_secs());
    info!("Version: {}", server::router::version());
    info!("======================================");

    match args.metrics_listen {
        Some(addr) => exporter::install(addr)?,
        None => exporter::describe(),
    }

    let pins = pin::open_index(&config)?;

    let client = reqwest::Client::builder().build()?;
    let backends = Backends::connect(&config, client, pins)?;
    let chain = server::build_chain(Arc::clone(&config), backends);

    tokio::select! {
        result = server::run(config, chain) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
