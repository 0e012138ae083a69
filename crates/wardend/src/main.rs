//! wardend — the Warden worker daemon.
//!
//! Starts a Worker that launches Nodes as child processes, optionally
//! registers it with a Manager, and idles until shut down by the Manager
//! or by Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! wardend --name w1 --port 7000 --config worker.toml \
//!     --manager-host 10.0.0.2 --manager-port 6000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use warden_core::WorkerConfig;
use wardend::{Delivery, Worker};

#[derive(Parser)]
#[command(name = "wardend", about = "Warden worker daemon")]
struct Cli {
    /// Name the Worker registers under.
    #[arg(long)]
    name: String,

    /// Interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Control server port; 0 picks a free one.
    #[arg(long, default_value = "0")]
    port: u16,

    /// Worker id; random when omitted.
    #[arg(long)]
    id: Option<Uuid>,

    /// TOML worker configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parent directory for the Worker's temporary storage.
    #[arg(long)]
    temp_root: Option<PathBuf>,

    /// Keep temporary storage after shutdown.
    #[arg(long)]
    keep_temp: bool,

    #[arg(long, requires = "manager_port")]
    manager_host: Option<String>,

    #[arg(long, requires = "manager_host")]
    manager_port: Option<u16>,

    /// Registration timeout in seconds.
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// How results reach the Manager on collect.
    #[arg(long, value_enum, default_value_t = Delivery::Auto)]
    delivery: Delivery,

    /// Log level handed to Nodes.
    #[arg(long, default_value = "info")]
    node_log_level: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,wardend=debug,warden=debug"))?,
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if cli.keep_temp {
        config.delete_temp_on_shutdown = false;
    }

    let mut builder = Worker::builder(cli.name)
        .host(cli.host)
        .port(cli.port)
        .config(config)
        .log_level(cli.node_log_level)
        .delivery(cli.delivery);
    if let Some(id) = cli.id {
        builder = builder.id(id);
    }
    if let Some(root) = cli.temp_root {
        builder = builder.temp_root(root);
    }

    let worker = builder.build().context("starting worker")?;
    worker.shutdown_on_ctrl_c();
    info!(id = %worker.id(), address = %worker.address(), "wardend running");

    if let (Some(host), Some(port)) = (cli.manager_host, cli.manager_port) {
        let timeout = Duration::from_secs(cli.connect_timeout);
        if !worker.connect(&host, port, timeout) {
            warn!(%host, port, "running without a manager");
        }
    }

    worker.idle();
    info!("wardend stopped");
    Ok(())
}
