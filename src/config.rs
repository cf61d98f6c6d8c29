use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub output_dir: PathBuf,
    pub max_peers: usize,
    // Requests kept in flight per peer.
    pub pipeline_depth: usize,
    pub block_size: usize,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub poll_timeout: Duration,
    // Only ask a peer for bytes its bitfield says it has.
    pub request_only_available: bool,
    pub use_tracker: bool,
    // Stop the event loop once every torrent is complete instead of seeding.
    pub quit_when_done: bool,
    pub extra_peers: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_port: 6881,
            output_dir: PathBuf::from("."),
            max_peers: 15,
            pipeline_depth: 15,
            block_size: 1 << 14,
            connect_timeout: Duration::from_secs(8),
            keep_alive_interval: Duration::from_secs(20),
            request_timeout: Duration::from_secs(120),
            tick_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(1),
            request_only_available: true,
            use_tracker: true,
            quit_when_done: true,
            extra_peers: Vec::new(),
        }
    }
}
