//! `pitaya-worker`: a worker hosted in its own process.
//!
//! Launched by the command broker in process mode. Reads one JSON command
//! per line on stdin and writes one JSON message per line on stdout. Logs go
//! to stderr.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use pitaya_core::config::LoggingSettings;
use pitaya_hub::{init_tracing, serve_stdio, StandardBackendFactory, WorkerConfig};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pitaya-worker")]
#[command(about = "Red Pitaya backend worker speaking NDJSON on stdin/stdout", long_about = None)]
struct Args {
    /// Serialized worker configuration (JSON)
    #[arg(long = "worker-config")]
    worker_config: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_filter: String,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Inbound command queue length
    #[arg(long, default_value_t = 64)]
    capacity: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&LoggingSettings {
        filter: args.log_filter.clone(),
        json: args.log_json,
    })?;

    let config: WorkerConfig =
        serde_json::from_str(&args.worker_config).context("invalid --worker-config")?;
    tracing::info!(
        address = %config.spec.address,
        config = %config.spec.config_name,
        mock = config.spec.mock,
        pid = std::process::id(),
        "Worker process starting"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create worker runtime")?;
    let factory = StandardBackendFactory::new();
    let result = runtime.block_on(serve_stdio(config, &factory, args.capacity));
    // A pending stdin read must not keep the process alive
    runtime.shutdown_timeout(Duration::from_millis(500));

    result.context("worker failed")
}
