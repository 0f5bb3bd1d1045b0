//! Bridge host binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ listener (plain / TLS)
//!                         │
//!                         ▼
//!                  request ID, trace, timeout
//!                         │
//!                         ▼
//!                  bridge middleware ──────▶ pipeline host process
//!                         │        ◀────── (stdio, JSON lines)
//!             truthy ◀────┴────▶ falsy
//!               │                  │
//!               ▼                  ▼
//!       buffered response     host router (404)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use owin_bridge::config::{read_config, validate_config, BridgeConfig, ConfigError};
use owin_bridge::lifecycle::{signals, Shutdown};
use owin_bridge::observability::{logging, metrics};
use owin_bridge::pipeline::{ProcessConfig, ProcessPipeline};
use owin_bridge::HttpServer;

#[derive(Parser)]
#[command(name = "owin-bridge")]
#[command(about = "Serve HTTP through an external OWIN pipeline", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Assembly file to load; overrides `pipeline.options` from the config.
    #[arg(short, long)]
    assembly: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(assembly) = cli.assembly {
        config.pipeline.options = serde_json::Value::String(assembly);
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability.log_level);
    tracing::info!("owin-bridge v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls.is_some(),
        request_timeout_secs = config.timeouts.request_secs,
        max_body_size = config.limits.max_body_size,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let process = ProcessConfig::from_config(&config.pipeline);
    let pipeline = Arc::new(ProcessPipeline::spawn(&process)?);

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config, pipeline.clone())?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(&shutdown);
    server.run(listener, shutdown).await?;

    if let Err(e) = pipeline.kill() {
        tracing::warn!(error = %e, "Failed to stop pipeline host");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
