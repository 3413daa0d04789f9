use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vela_dap::{config::DapConfig, server, DebugSession};

#[derive(Parser, Debug)]
#[command(name = "vela-dap", about = "Debug adapter for the Vela VM")]
struct Cli {
    /// Path to a TOML config file. Falls back to $VELA_DAP_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, overriding the config file.
    #[arg(long)]
    log_filter: Option<String>,
}

fn load_config(cli: &Cli) -> DapConfig {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("VELA_DAP_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return DapConfig::default();
    };
    match DapConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            // Can't log yet (the subscriber needs the config); stderr is the
            // only channel that won't corrupt the DAP stream.
            eprintln!("vela-dap: ignoring config {}: {err}", path.display());
            DapConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);

    let filter = cli
        .log_filter
        .clone()
        .unwrap_or_else(|| config.log.filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        // stdout carries DAP frames; everything else goes to stderr.
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vela-dap starting");

    let session = Arc::new(DebugSession::new(config));
    server::run(session, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("dap server failed")?;

    tracing::info!("vela-dap exiting");
    Ok(())
}
