use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::path::PathBuf;

mod client;
mod config;

use client::{Client, TorrentMetadata};
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "trickle", about = "Download and seed a torrent", version)]
struct Args {
    #[arg(value_name = "TORRENT", help = "Path to the .torrent file")]
    torrent: PathBuf,

    #[arg(long, short = 'o', value_name = "DIR", default_value = ".", help = "Directory to download into")]
    output: PathBuf,

    #[arg(long, short = 'p', default_value_t = 6881, help = "Port to accept peers on")]
    port: u16,

    #[arg(long, value_name = "FILE", help = "Seed from a complete copy of the content")]
    seed: Option<PathBuf>,

    #[arg(long, default_value_t = 15, help = "Peers to connect to per torrent")]
    max_peers: usize,

    #[arg(long = "peer", value_name = "HOST:PORT", help = "Connect to this peer (repeatable)")]
    peers: Vec<SocketAddr>,

    #[arg(long, help = "Do not announce to the tracker")]
    no_tracker: bool,

    #[arg(long, help = "Keep seeding after the download completes")]
    keep_seeding: bool,

    #[arg(long, help = "Request blocks even from peers that do not advertise them")]
    ignore_bitfield: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config {
        listen_port: args.port,
        output_dir: args.output,
        max_peers: args.max_peers,
        request_only_available: !args.ignore_bitfield,
        use_tracker: !args.no_tracker,
        quit_when_done: args.seed.is_none() && !args.keep_seeding,
        extra_peers: args.peers,
        ..Config::default()
    };

    let meta = TorrentMetadata::open(&args.torrent)?;
    info!(
        torrent = %meta.name,
        length = meta.length,
        pieces = meta.piece_count(),
        "loaded metadata"
    );

    let mut client = Client::new(config)?;
    let id = client.add_torrent(meta)?;
    if let Some(path) = &args.seed {
        let verified = client.seed(id, path)?;
        info!(verified, "seeding");
    }
    client.run()
}
