//! Huddle - replicated speaking queue
//!
//! Runs one replica of a room: restores it from local storage, keeps links
//! to peers in the same room, and drives it from a line-based console.

use std::path::PathBuf;

use clap::Parser;
use huddle_core::Config;
use huddle_net::PeerUrl;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod console;
mod error;
mod persistence;
mod state;
mod sync;

use error::AppResult;
use state::AppState;
use sync::{PeerSync, SyncOptions};

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle - Replicated speaking queue", long_about = None)]
struct Cli {
    /// Config file (defaults to huddle.toml in the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room path, e.g. team/standup
    #[arg(short, long)]
    room: Option<String>,

    /// Port to accept peers on
    #[arg(short, long)]
    listen: Option<u16>,

    /// Do not accept inbound peers
    #[arg(long, conflicts_with = "listen")]
    no_listen: bool,

    /// Peer to dial (huddle://host:port/room), may be repeated
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Shared secret peers must present
    #[arg(long)]
    secret: Option<String>,

    /// Directory holding the database
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags win over the config file
    fn apply(self, mut config: Config) -> Config {
        if let Some(room) = self.room {
            config.room = room;
        }
        if self.no_listen {
            config.listen_port = None;
        } else if let Some(port) = self.listen {
            config.listen_port = Some(port);
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if self.secret.is_some() {
            config.secret = self.secret;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        config
    }
}

fn main() {
    // Logs go to stderr so they stay out of the console output
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!("Starting Huddle");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("Huddle stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let config = cli.apply(config);
    let peers = parse_peers(&config.peers);

    let state = AppState::open(config).await?;
    let mut ready = state.persistence.ready();
    let _ = ready.wait_for(|ready| *ready).await;

    let options = SyncOptions {
        listen_port: state.config.listen_port,
        peers,
        secret: state.config.secret.clone(),
    };
    let sync = PeerSync::start(state.replica.clone(), options).await?;

    println!("Room: {} ({})", state.room, state.db_path().display());
    if let Some(addr) = sync.listen_addr() {
        println!(
            "Peers can join with --peer {}",
            PeerUrl::new("HOST", addr.port(), state.room.as_str())
        );
    }

    let timer = console::spawn_timer(state.replica.clone(), state.projection.clone());
    let result = console::run(state.replica.clone(), state.projection.clone()).await;
    timer.abort();

    sync.shutdown().await?;
    state.close().await?;

    info!("Huddle stopped");
    result
}

/// Parse configured peer URLs, skipping bad ones
fn parse_peers(urls: &[String]) -> Vec<PeerUrl> {
    urls.iter()
        .filter_map(|url| match url.parse::<PeerUrl>() {
            Ok(peer) => Some(peer),
            Err(e) => {
                warn!(url = %url, error = %e, "Ignoring invalid peer URL");
                None
            }
        })
        .collect()
}
