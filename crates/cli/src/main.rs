use anyhow::{Context, Result};
use clap::Parser;
use subsync_persist::Storage;
use subsync_reconciler::{SyncConfig, SyncService};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod operations;

use config::{Cli, Command};

const PLAIN_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Plain levels are matched case-insensitively; anything else is taken as filter directives.
fn log_filter(level: &str) -> EnvFilter {
    let lower = level.trim().to_ascii_lowercase();
    let directives = if PLAIN_LEVELS.contains(&lower.as_str()) { lower } else { level.trim().to_string() };
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt().with_env_filter(log_filter(level)).with_target(true).init();
}

fn init_metrics(port: u16) {
    let sock = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    init_metrics(cli.metrics_port);

    let storage = Storage::sqlite(&cli.database_path).with_context(|| format!("opening database {}", cli.database_path))?;
    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(cancel.clone());

    match cli.command {
        Command::Sync(args) => {
            let config: SyncConfig = args.into();
            SyncService::new(config, storage).run(cancel).await?;
        }
        Command::Operations(args) => operations::run(args, storage, cancel).await?,
    }
    info!("bye");
    Ok(())
}
