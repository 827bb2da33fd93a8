//! Envoy ext_proc header manipulation sidecar.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!                  │              EXTERNAL PROCESSOR              │
//!                  │                                              │
//!  Envoy ext_proc  │  ┌────────┐   ┌─────────┐   ┌────────────┐   │
//!  ───────────────▶│  │ server │──▶│ stream  │──▶│instructions│   │
//!  (one stream per │  │ (gRPC) │   │processor│   │  decoder   │   │
//!   transaction)   │  └────────┘   └────┬────┘   └─────┬──────┘   │
//!                  │                    │              ▼          │
//!  ◀───────────────┼────────────────────┘       ┌────────────┐    │
//!  ProcessingResp. │                            │  mutation  │    │
//!                  │                            │  builder   │    │
//!                  │                            └────────────┘    │
//!                  │  ┌────────┐ ┌─────────┐ ┌──────────────────┐ │
//!                  │  │ health │ │ config  │ │ observability +  │ │
//!                  │  │        │ │         │ │    lifecycle     │ │
//!                  │  └────────┘ └─────────┘ └──────────────────┘ │
//!                  └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use ext_proc_header_manipulation::config::validation::validate_config;
use ext_proc_header_manipulation::config::{load_config, ConfigError, ServerConfig};
use ext_proc_header_manipulation::lifecycle::{signals, Shutdown};
use ext_proc_header_manipulation::observability::{init_logging, metrics};
use ext_proc_header_manipulation::server::GrpcServer;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "ext-proc-header-manipulation")]
#[command(
    about = "Envoy external processor that mutates headers from an `instructions` header",
    long_about = None
)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "EXT_PROC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ext-proc-header-manipulation starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls.is_some(),
        health = config.health.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let _signals = signals::spawn_signal_listener(shutdown.clone());

    GrpcServer::new(config).run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
