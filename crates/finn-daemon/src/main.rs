mod daemon;
mod execution;
mod folders;
mod git_sync;
mod preview;
mod router;
mod sessions;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "finn", version, about = "Finn desktop daemon")]
struct Args {
    /// Run without the system tray UI.
    #[arg(long)]
    headless: bool,
    /// Connect to a local relay instead of production.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let cfg = finn_config::Config::load(args.dev).context("failed to load config")?;

    // The auth bootstrap that mints tokens lives outside the daemon; a
    // relay without a stored token is unrecoverable here.
    if cfg.token(&cfg.relay_url).is_none() {
        bail!(
            "no auth token for relay {}: sign in from the dashboard first",
            cfg.relay_url
        );
    }

    let daemon = daemon::Daemon::new(cfg, args.headless)?;
    daemon.start().await?;

    tokio::signal::ctrl_c().await.ok();
    tracing::info!(event = "shutdown_signal");
    daemon.shutdown().await;

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FINN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
