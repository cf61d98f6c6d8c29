mod bitfield;
mod block;
mod connection;
mod disk;
mod error;
mod handshake;
mod message;
mod peer;
mod peerclient;
mod piece;
mod piece_picker;
mod reactor;
mod sparse;
mod torrent;
mod tracker;
mod types;

pub use reactor::PollResult;
pub use torrent::TorrentMetadata;

use connection::PeerConnection;
use error::PeerError;
use message::Message;
use peerclient::{Context, PeerClient, PeerEvent};
use piece::PieceStore;
use reactor::{EventHandler, Reactor};
use tracker::{AnnounceEvent, TrackerRequest};
use types::{PeerId, TorrentId};

use crate::config::Config;

use anyhow::{Context as _, Result};
use fxhash::{FxHashMap, FxHashSet};
use mio::net::TcpListener;
use mio::Token;
use rand::Rng;
use tracing::{debug, info, warn};

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const CLIENT_PREFIX: &[u8; 8] = b"-TK0100-";
// Announces block the reactor, so every peer stalls for at most this long.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(5);
const ANNOUNCE_RETRY: Duration = Duration::from_secs(60);

/// One torrent being downloaded or seeded, and the peers working on it.
pub struct TorrentSession {
    pub store: PieceStore,
    peers: FxHashSet<Token>,
    // Addresses from the tracker or the command line not yet connected to.
    candidates: VecDeque<SocketAddr>,
    announce_token: Option<Token>,
    next_event: Option<AnnounceEvent>,
    complete: bool,
}

impl TorrentSession {
    pub(crate) fn new(store: PieceStore) -> Self {
        let complete = store.all_checked();
        TorrentSession {
            store,
            peers: FxHashSet::default(),
            candidates: VecDeque::new(),
            announce_token: None,
            next_event: None,
            complete,
        }
    }

    #[cfg(test)]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// A BitTorrent client: one listening socket, any number of torrents, all
/// driven from a single reactor.
pub struct Client {
    reactor: Reactor,
    session: Session,
}

// Everything the reactor dispatches into. Kept apart from the reactor so
// `poll` can borrow both.
struct Session {
    listener: TcpListener,
    port: u16,
    peer_id: PeerId,
    config: Config,
    torrents: Vec<TorrentSession>,
    connections: FxHashMap<Token, PeerClient>,
    announcers: FxHashMap<Token, TorrentId>,
    next_token: usize,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        let mut reactor = Reactor::new().context("creating poller")?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let mut listener = TcpListener::bind(addr).with_context(|| format!("listening on {}", addr))?;
        let port = listener.local_addr()?.port();
        reactor.register(LISTENER);
        reactor.watch_read(&mut listener, LISTENER)?;

        let peer_id = generate_peer_id();
        info!(port, peer_id = %String::from_utf8_lossy(&peer_id[..CLIENT_PREFIX.len()]), "listening");
        Ok(Client {
            reactor,
            session: Session {
                listener,
                port,
                peer_id,
                config,
                torrents: Vec::new(),
                connections: FxHashMap::default(),
                announcers: FxHashMap::default(),
                next_token: LISTENER.0 + 1,
            },
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.session.listener.local_addr()
    }

    /// Opens the torrent's files under the output directory, resuming from
    /// whatever is already there, and starts looking for peers.
    pub fn add_torrent(&mut self, meta: TorrentMetadata) -> Result<TorrentId> {
        let root = self.session.config.output_dir.clone();
        let resuming = meta.files.iter().any(|f| root.join(&f.path).exists());
        let name = meta.name.clone();
        let has_tracker = meta.announce.is_some();

        let mut store = PieceStore::open(meta, &root).with_context(|| format!("opening storage for {}", name))?;
        if resuming {
            store
                .load_existing()
                .with_context(|| format!("checking existing data for {}", name))?;
        }

        let id = self.session.torrents.len();
        let mut torrent = TorrentSession::new(store);
        torrent.candidates.extend(self.session.config.extra_peers.iter().copied());
        if self.session.config.use_tracker && has_tracker {
            let token = self.session.next_token();
            self.session.announcers.insert(token, id);
            torrent.announce_token = Some(token);
            torrent.next_event = Some(AnnounceEvent::Started);
            self.reactor.start_timer(Duration::ZERO, token);
        }
        info!(
            torrent = %name,
            pieces = torrent.store.metadata().piece_count(),
            verified = torrent.store.checked_count(),
            "added torrent"
        );
        self.session.torrents.push(torrent);
        self.session.connect_more(&mut self.reactor, id);
        Ok(id)
    }

    /// Loads a complete copy of the content from `path` so the torrent can
    /// be seeded.
    pub fn seed(&mut self, id: TorrentId, path: &Path) -> Result<usize> {
        let verified = self.session.torrents[id]
            .store
            .seed_from(path)
            .with_context(|| format!("seeding from {}", path.display()))?;
        if self.session.torrents[id].store.all_checked() {
            self.session.on_complete(&mut self.reactor, id);
        }
        Ok(verified)
    }

    #[cfg(test)]
    pub fn torrent(&self, id: TorrentId) -> &TorrentSession {
        &self.session.torrents[id]
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.session.connections.len()
    }

    pub fn is_complete(&self) -> bool {
        self.session.torrents.iter().all(|t| t.complete)
    }

    pub fn poll(&mut self, timeout: Duration) -> io::Result<PollResult> {
        self.reactor.poll(&mut self.session, timeout)
    }

    pub fn run(&mut self) -> Result<()> {
        let timeout = self.session.config.poll_timeout;
        loop {
            if self.session.config.quit_when_done && self.is_complete() {
                info!("all torrents complete");
                return Ok(());
            }
            if self.poll(timeout)? == PollResult::NoWork {
                info!("nothing left to do");
                return Ok(());
            }
        }
    }
}

impl Session {
    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn connect_peer(&mut self, reactor: &mut Reactor, id: TorrentId, addr: SocketAddr) -> Result<Token, PeerError> {
        let token = self.next_token();
        let connection = PeerConnection::connect(addr, token, reactor, &self.config)?;
        let torrent = &mut self.torrents[id];
        let mut peer = PeerClient::outbound(connection, id, torrent);
        let greeting = peer.greet(reactor, torrent, self.peer_id);
        torrent.peers.insert(token);
        self.connections.insert(token, peer);
        if let Err(e) = greeting {
            self.kill_peer(reactor, token, e);
        }
        Ok(token)
    }

    // Tops the torrent up to `max_peers` from its candidate addresses.
    fn connect_more(&mut self, reactor: &mut Reactor, id: TorrentId) {
        while self.torrents[id].peers.len() < self.config.max_peers {
            let Some(addr) = self.torrents[id].candidates.pop_front() else {
                break;
            };
            if self.connections.values().any(|p| p.connection().addr() == addr) {
                continue;
            }
            if let Err(e) = self.connect_peer(reactor, id, addr) {
                debug!(peer = %addr, error = %e, "connect failed");
            }
        }
    }

    fn accept_all(&mut self, reactor: &mut Reactor) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let token = self.next_token();
                    match PeerConnection::accept(stream, addr, token, reactor, &self.config) {
                        Ok(connection) => {
                            debug!(peer = %addr, "accepted");
                            self.connections.insert(token, PeerClient::inbound(connection));
                        }
                        Err(e) => warn!(peer = %addr, error = %e, "could not register inbound peer"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    // Re-arm so the connections still queued are not lost.
                    if let Err(e) = reactor.watch_read(&mut self.listener, LISTENER) {
                        warn!(error = %e, "could not re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    /// Handles one read's worth of messages in arrival order, then lets the
    /// strategy react. A fault stops the batch and kills the connection.
    fn process(&mut self, reactor: &mut Reactor, token: Token, messages: Vec<Message>) {
        let mut events = Vec::new();
        let outcome = {
            let Some(peer) = self.connections.get_mut(&token) else {
                return;
            };
            let mut ctx = Context {
                reactor: &mut *reactor,
                torrents: &mut self.torrents,
                peer_id: self.peer_id,
                config: &self.config,
            };
            let mut outcome = Ok(());
            for message in messages {
                match peer.handle_message(message, &mut ctx) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            if outcome.is_ok() {
                outcome = peer.run_strategy(ctx.reactor, ctx.torrents, ctx.config);
            }
            outcome
        };

        self.apply_events(reactor, token, events);
        match outcome {
            Err(e) => self.kill_peer(reactor, token, e),
            Ok(()) => {
                let hung_up = self.connections.get(&token).map_or(false, |p| p.connection().hung_up());
                if hung_up {
                    self.kill_peer(reactor, token, PeerError::ConnectionClosed);
                }
            }
        }
    }

    fn apply_events(&mut self, reactor: &mut Reactor, source: Token, events: Vec<PeerEvent>) {
        let mut failed = Vec::new();
        for event in events {
            match event {
                PeerEvent::Associated(id) => {
                    self.torrents[id].peers.insert(source);
                }
                PeerEvent::PieceVerified(id, index) => {
                    for token in self.torrents[id].peers.iter().filter(|t| **t != source) {
                        if let Some(peer) = self.connections.get_mut(token) {
                            if let Err(e) = peer.connection.send(reactor, [Message::Have(index as u32)]) {
                                failed.push((*token, e));
                            }
                        }
                    }
                    let store = &self.torrents[id].store;
                    info!(
                        piece = index,
                        progress = %format!("{:.1}%", store.percent_complete()),
                        "piece complete"
                    );
                    // Every byte written and every piece hashed.
                    if store.is_complete() && store.all_checked() && !self.torrents[id].complete {
                        self.on_complete(reactor, id);
                    }
                }
            }
        }
        for (token, e) in failed {
            self.kill_peer(reactor, token, e);
        }
    }

    fn on_complete(&mut self, reactor: &mut Reactor, id: TorrentId) {
        let torrent = &mut self.torrents[id];
        torrent.complete = true;
        info!(torrent = %torrent.store.metadata().name, "download complete");
        for token in &torrent.peers {
            if let Some(peer) = self.connections.get_mut(token) {
                peer.finish();
            }
        }
        if torrent.announce_token.is_some() {
            torrent.next_event = Some(AnnounceEvent::Completed);
            self.announce(reactor, id);
        }
    }

    fn kill_peer(&mut self, reactor: &mut Reactor, token: Token, reason: PeerError) {
        let Some(mut peer) = self.connections.remove(&token) else {
            return;
        };
        let addr = peer.connection().addr();
        match reason {
            PeerError::ConnectionClosed | PeerError::ConnectTimeout => debug!(peer = %addr, error = %reason, "peer gone"),
            _ => info!(peer = %addr, error = %reason, "dropping peer"),
        }
        let returned = peer.connection.die(reactor);
        if let Some(id) = peer.torrent_id() {
            let torrent = &mut self.torrents[id];
            for block in &returned {
                torrent.store.return_pending(block);
            }
            torrent.peers.remove(&token);
            self.connect_more(reactor, id);
        }
    }

    fn announce(&mut self, reactor: &mut Reactor, id: TorrentId) {
        let torrent = &mut self.torrents[id];
        let Some(token) = torrent.announce_token else {
            return;
        };
        // Replaces any re-announce already scheduled.
        reactor.cancel_timers(token);

        let store = &torrent.store;
        let left = store.bytes_left();
        let downloaded = store.metadata().length - left;
        let event = torrent.next_event.take();
        let response = TrackerRequest::new(store.metadata(), self.peer_id, self.port, downloaded, left, event)
            .and_then(|request| request.send(TRACKER_TIMEOUT));

        let delay = match response {
            Ok(response) => {
                info!(
                    torrent = %store.metadata().name,
                    peers = response.peers.len(),
                    seeders = response.complete,
                    leechers = response.incomplete,
                    "announced"
                );
                for peer in &response.peers {
                    let addr = peer.socket_addr();
                    if !is_own_addr(addr, self.port) && !torrent.candidates.contains(&addr) {
                        torrent.candidates.push_back(addr);
                    }
                }
                response.next_announce()
            }
            Err(e) => {
                warn!(torrent = %store.metadata().name, error = %format!("{:#}", e), "announce failed");
                torrent.next_event = event;
                ANNOUNCE_RETRY
            }
        };
        reactor.start_timer(delay, token);
        self.connect_more(reactor, id);
    }

    fn service_peer(
        peer: &mut PeerClient,
        reactor: &mut Reactor,
        torrents: &mut [TorrentSession],
        config: &Config,
        now: Instant,
    ) -> Result<(), PeerError> {
        peer.connection.tick(reactor, now)?;
        peer.expire_requests(reactor, torrents, config, now)?;
        peer.run_strategy(reactor, torrents, config)
    }
}

impl EventHandler for Session {
    fn read_event(&mut self, reactor: &mut Reactor, token: Token) {
        if token == LISTENER {
            self.accept_all(reactor);
            return;
        }
        let Some(peer) = self.connections.get_mut(&token) else {
            return;
        };
        match peer.connection.read_event() {
            Ok(messages) => self.process(reactor, token, messages),
            Err(e) => self.kill_peer(reactor, token, e),
        }
    }

    fn write_event(&mut self, reactor: &mut Reactor, token: Token) {
        let Some(peer) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = peer.connection.write_event(reactor) {
            self.kill_peer(reactor, token, e);
        }
    }

    fn timer_event(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(&id) = self.announcers.get(&token) {
            self.announce(reactor, id);
            return;
        }
        let Some(peer) = self.connections.get_mut(&token) else {
            return;
        };
        let outcome = Session::service_peer(peer, reactor, &mut self.torrents, &self.config, Instant::now());
        if let Err(e) = outcome {
            self.kill_peer(reactor, token, e);
        }
    }
}

fn generate_peer_id() -> PeerId {
    let mut peer_id = rand::thread_rng().gen::<PeerId>();
    peer_id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
    peer_id
}

// Trackers often hand our own listening address back to us.
fn is_own_addr(addr: SocketAddr, port: u16) -> bool {
    addr.port() == port && (addr.ip().is_loopback() || addr.ip().is_unspecified())
}
