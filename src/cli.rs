//! Command-line surface: `info`, `announce`, `leech`, `serve-tracker`.
use crate::config::{Config, ConfigArgs};
use crate::swarm::manager::SwarmManager;
use crate::torrent::file::TorrentFile;
use crate::tracker::{server, Client as TrackerClient};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(author, version, about = "A BitTorrent (BEP-3) leecher and tracker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prints a torrent file's metadata: announce URL, info-hash, piece layout.
    Info { torrent: PathBuf },

    /// Announces to the tracker once and prints the returned peer list.
    Announce { torrent: PathBuf },

    /// Downloads a torrent's content from the swarm until complete.
    Leech { torrent: PathBuf },

    /// Runs the companion tracker HTTP service.
    ServeTracker {
        /// Directory to scan for `.torrent` files at startup.
        torrents_dir: PathBuf,

        /// Address to bind the HTTP server to.
        #[arg(long, default_value = "0.0.0.0:6969")]
        bind: SocketAddr,

        /// Peer TTL / eviction sweep period, in seconds.
        #[arg(long, default_value_t = 1800)]
        interval_secs: u64,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config: Config = cli.config.into();
    match cli.command {
        Command::Info { torrent } => info(&torrent),
        Command::Announce { torrent } => announce(&torrent, config.listen_port).await,
        Command::Leech { torrent } => leech(&torrent, config).await,
        Command::ServeTracker { torrents_dir, bind, interval_secs } => {
            serve_tracker(&torrents_dir, bind, Duration::from_secs(interval_secs)).await
        }
    }
}

fn info(path: &Path) -> Result<()> {
    let torrent = TorrentFile::parse_file(path).context("parse torrent file")?;
    println!("announce: {}", torrent.announce);
    println!("info hash: {}", hex::encode(torrent.info_hash));
    println!("piece length: {}", torrent.info.piece_length);
    println!("length: {}", torrent.total_length());
    println!("pieces: {}", torrent.num_pieces());
    Ok(())
}

async fn announce(path: &Path, listen_port: u16) -> Result<()> {
    let torrent = TorrentFile::parse_file(path).context("parse torrent file")?;
    let client = TrackerClient::new(listen_port).context("build tracker client")?;
    let response = client.announce(&torrent).await.context("announce to tracker")?;
    println!("interval: {}s", response.interval);
    for peer in response.peers {
        println!("{}:{}", peer.ip, peer.port);
    }
    Ok(())
}

async fn leech(path: &Path, config: Config) -> Result<()> {
    let torrent = TorrentFile::parse_file(path).context("parse torrent file")?;
    std::fs::create_dir_all(&config.base_dir).context("create base download directory")?;
    let client = TrackerClient::new(config.listen_port).context("build tracker client")?;
    let manager = SwarmManager::new(torrent, config, client);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    manager.run(cancel).await;
    Ok(())
}

async fn serve_tracker(torrents_dir: &Path, bind: SocketAddr, interval: Duration) -> Result<()> {
    let state = Arc::new(server::TrackerState::new(interval));
    let loaded = server::load_torrents_dir(torrents_dir, &state).context("scan torrents directory")?;
    tracing::info!(loaded, "seeded tracker state from torrents directory");

    let cancel = CancellationToken::new();
    tokio::spawn(server::run_eviction_loop(state.clone(), cancel.clone()));

    let listener = tokio::net::TcpListener::bind(bind).await.context("bind tracker HTTP listener")?;
    tracing::info!(%bind, "tracker listening");
    axum::serve(listener, server::router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("tracker HTTP server failed")?;

    cancel.cancel();
    Ok(())
}
