//! Entry point: initializes logging, parses CLI args, and dispatches to
//! the `info`/`announce`/`leech`/`serve-tracker` subcommands. Configuration
//! failures are fatal here, before any manager loop starts.
use clap::Parser;
use rs_torrent_client::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli).await {
        tracing::error!(error = ?e, "fatal error");
        std::process::exit(1);
    }

    Ok(())
}
