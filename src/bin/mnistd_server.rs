//! mnistd-server - digit inference server
//!
//! Usage:
//!   mnistd-server --model ./mnist.mnlm [--port 32001] [--config server.json]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mnistd::backend::{LinearModel, ModelLoader};
use mnistd::{BackendGate, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "mnistd-server", version)]
#[command(about = "MnistProt inference server")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Per-connection read/write timeout in milliseconds
    #[arg(long)]
    io_timeout_ms: Option<u64>,

    /// How long a request waits for the backend, in milliseconds
    #[arg(long)]
    gate_timeout_ms: Option<u64>,

    /// Disable request metrics
    #[arg(long)]
    no_metrics: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = self.model {
            config.model_path = model;
        }
        if let Some(ms) = self.io_timeout_ms {
            config.read_timeout_ms = ms;
            config.write_timeout_ms = ms;
        }
        if let Some(ms) = self.gate_timeout_ms {
            config.gate_timeout_ms = ms;
        }
        if self.no_metrics {
            config.metrics = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mnistd-server");

    let config = args.into_config()?;

    let model = LinearModel::load_model(&config.model_path)
        .with_context(|| format!("loading model {}", config.model_path.display()))?;
    let gate = Arc::new(BackendGate::new(model, config.gate_timeout()));

    let server = Server::bind(&config, gate)?;
    let shutdown = server.shutdown_handle();
    let metrics = server.metrics();

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("registering signal handlers")?;
    thread::Builder::new()
        .name("mnistd-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "Received signal, shutting down");
                shutdown.trigger();
            }
        })?;

    server.run()?;

    if let Some(metrics) = metrics {
        match serde_json::to_string(&metrics.snapshot()) {
            Ok(json) => info!(metrics = %json, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to serialize metrics"),
        }
    }

    Ok(())
}
