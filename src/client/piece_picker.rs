use tracing::{debug, trace, warn};

use std::time::Instant;

use super::error::PeerError;
use super::message::Message;
use super::peerclient::PeerClient;
use super::reactor::Reactor;
use super::TorrentSession;
use crate::config::Config;

/// How a peer decides what to ask for. Re-run after every batch of messages
/// and on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    // Inbound, the handshake has not told us the torrent yet.
    AwaitHandshake,
    KeepAsking,
    // Nothing left to download; the connection only serves and keeps alive.
    Finished,
}

impl Strategy {
    pub fn for_torrent(session: &TorrentSession) -> Self {
        if session.store.all_checked() {
            Strategy::Finished
        } else {
            Strategy::KeepAsking
        }
    }
}

impl PeerClient {
    pub fn run_strategy(
        &mut self,
        reactor: &mut Reactor,
        torrents: &mut [TorrentSession],
        config: &Config,
    ) -> Result<(), PeerError> {
        match self.strategy {
            Strategy::AwaitHandshake | Strategy::Finished => Ok(()),
            Strategy::KeepAsking => {
                let Some(id) = self.torrent_id() else {
                    return Ok(());
                };
                self.keep_asking(reactor, &mut torrents[id], config)
            }
        }
    }

    fn keep_asking(&mut self, reactor: &mut Reactor, session: &mut TorrentSession, config: &Config) -> Result<(), PeerError> {
        if !self.state.am_interested {
            debug!(peer = %self.connection.addr(), "sending interested");
            self.connection.send(reactor, [Message::Interested])?;
            self.state.am_interested = true;
        }
        if self.state.am_choked {
            return Ok(());
        }

        let store = &mut session.store;
        let available = config
            .request_only_available
            .then(|| store.peer_availability(&self.state.bitfield));
        while self.connection.outstanding_count() < config.pipeline_depth {
            let Some(block) = store.next_request(available.as_ref(), config.block_size) else {
                break;
            };
            trace!(peer = %self.connection.addr(), ?block, "requesting");
            if let Err(e) = self.connection.send(reactor, [Message::Request(block)]) {
                store.return_pending(&block);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Cancels requests that went unanswered for too long so another peer
    /// can pick them up. Returns how many were cancelled.
    pub fn expire_requests(
        &mut self,
        reactor: &mut Reactor,
        torrents: &mut [TorrentSession],
        config: &Config,
        now: Instant,
    ) -> Result<usize, PeerError> {
        let Some(id) = self.torrent_id() else {
            return Ok(0);
        };
        let stale = self.connection.stale_requests(now, config.request_timeout);
        for request in &stale {
            warn!(
                peer = %self.connection.addr(),
                piece = request.block.piece_index,
                begin = request.block.begin,
                waited = ?now.saturating_duration_since(request.sent_at),
                "request timed out, cancelling"
            );
            self.connection.send(reactor, [Message::Cancel(request.block)])?;
            torrents[id].store.return_pending(&request.block);
        }
        Ok(stale.len())
    }

    pub fn finish(&mut self) {
        if self.strategy != Strategy::Finished {
            debug!(peer = %self.connection.addr(), "switching to finished");
            self.strategy = Strategy::Finished;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::block::BlockInfo;
    use crate::client::peerclient::tests::Fixture;
    use bytes::Bytes;
    use std::time::Duration;

    fn requests(peer: &PeerClient) -> Vec<BlockInfo> {
        peer.connection()
            .queued()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(block) => Some(block),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn asks_interest_once_and_waits_for_unchoke() {
        let mut f = Fixture::new(false);
        let mut peer = f.outbound();
        assert_eq!(peer.strategy(), Strategy::KeepAsking);

        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        assert_eq!(peer.connection().queued(), vec![Message::Interested]);
        assert!(peer.state().am_interested);
    }

    #[test]
    fn fills_pipeline_when_unchoked() {
        let mut f = Fixture::new(false);
        f.config.request_only_available = false;
        f.config.pipeline_depth = 3;
        f.config.block_size = 4096;
        let mut peer = f.outbound();
        peer.handle_message(Message::Unchoke, &mut f.ctx()).unwrap();

        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        assert_eq!(
            requests(&peer),
            vec![
                BlockInfo::new(0, 0, 4096),
                BlockInfo::new(0, 4096, 4096),
                BlockInfo::new(0, 8192, 4096),
            ]
        );
        assert_eq!(peer.connection().outstanding_count(), 3);
        assert_eq!(f.torrents[0].store.pending().count(true), 3 * 4096);
    }

    #[test]
    fn only_asks_for_advertised_pieces() {
        let mut f = Fixture::new(false);
        let mut peer = f.outbound();
        peer.handle_message(Message::Bitfield(Bytes::from_static(&[0x40])), &mut f.ctx())
            .unwrap();
        peer.handle_message(Message::Unchoke, &mut f.ctx()).unwrap();

        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        assert_eq!(requests(&peer), vec![BlockInfo::new(1, 0, 3616)]);
    }

    #[test]
    fn stale_requests_are_cancelled_and_returned() {
        let mut f = Fixture::new(false);
        f.config.request_only_available = false;
        let mut peer = f.outbound();
        peer.handle_message(Message::Unchoke, &mut f.ctx()).unwrap();
        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        assert_eq!(peer.connection().outstanding_count(), 2);

        let now = Instant::now();
        assert_eq!(peer.expire_requests(&mut f.reactor, &mut f.torrents, &f.config, now).unwrap(), 0);
        let later = now + Duration::from_secs(121);
        assert_eq!(peer.expire_requests(&mut f.reactor, &mut f.torrents, &f.config, later).unwrap(), 2);

        assert_eq!(peer.connection().outstanding_count(), 0);
        assert!(f.torrents[0].store.pending().none());
        assert!(matches!(peer.connection().queued().last(), Some(Message::Cancel(_))));
    }

    #[test]
    fn finished_peers_ask_for_nothing() {
        let mut f = Fixture::new(true);
        let mut peer = f.outbound();
        assert_eq!(peer.strategy(), Strategy::Finished);
        peer.handle_message(Message::Unchoke, &mut f.ctx()).unwrap();
        peer.run_strategy(&mut f.reactor, &mut f.torrents, &f.config).unwrap();
        assert!(peer.connection().queued().is_empty());
    }
}
