use tracing::{debug, info, trace};

use super::bitfield;
use super::block::BlockInfo;
use super::connection::PeerConnection;
use super::error::PeerError;
use super::handshake::Handshake;
use super::message::Message;
use super::piece::PieceCheck;
use super::piece_picker::Strategy;
use super::reactor::Reactor;
use super::types::{Bitfield, PeerId, PieceIndex, TorrentId};
use super::TorrentSession;
use crate::config::Config;

/// What we know about the other side of one connection.
#[derive(Debug)]
pub struct PeerProtocolState {
    pub peer_interested: bool,
    pub am_interested: bool,
    // The peer is choking us.
    pub am_choked: bool,
    // We are choking the peer.
    pub peer_choked: bool,
    pub bitfield: Bitfield,
    pub handshake: Option<Handshake>,
}

impl Default for PeerProtocolState {
    fn default() -> Self {
        PeerProtocolState {
            peer_interested: false,
            am_interested: false,
            am_choked: true,
            peer_choked: true,
            bitfield: Bitfield::new(),
            handshake: None,
        }
    }
}

/// Inbound connections do not know their torrent until the handshake names
/// it. The move to `Associated` happens once and never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOwner {
    Unassociated,
    Associated(TorrentId),
}

/// Things a message did that the session has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Associated(TorrentId),
    PieceVerified(TorrentId, PieceIndex),
}

/// Everything outside the connection that message handling touches.
pub struct Context<'a> {
    pub reactor: &'a mut Reactor,
    pub torrents: &'a mut [TorrentSession],
    pub peer_id: PeerId,
    pub config: &'a Config,
}

pub struct PeerClient {
    pub(super) connection: PeerConnection,
    pub(super) owner: ConnectionOwner,
    pub(super) state: PeerProtocolState,
    pub(super) strategy: Strategy,
}

impl PeerClient {
    /// A connection we opened for `torrent`. Call `greet` once it is in the
    /// connection table.
    pub fn outbound(connection: PeerConnection, torrent: TorrentId, session: &TorrentSession) -> Self {
        let mut state = PeerProtocolState::default();
        state.bitfield = Bitfield::repeat(false, session.store.metadata().piece_count());
        PeerClient {
            connection,
            owner: ConnectionOwner::Associated(torrent),
            state,
            strategy: Strategy::for_torrent(session),
        }
    }

    /// Queues our handshake and bitfield. They go out once the connect
    /// completes.
    pub fn greet(&mut self, reactor: &mut Reactor, session: &TorrentSession, peer_id: PeerId) -> Result<(), PeerError> {
        let store = &session.store;
        let handshake = Handshake::new(store.metadata().info_hash, peer_id);
        self.connection.send(
            reactor,
            [Message::Handshake(handshake), Message::Bitfield(store.bitfield())],
        )
    }

    pub fn inbound(connection: PeerConnection) -> Self {
        PeerClient {
            connection,
            owner: ConnectionOwner::Unassociated,
            state: PeerProtocolState::default(),
            strategy: Strategy::AwaitHandshake,
        }
    }

    pub fn connection(&self) -> &PeerConnection {
        &self.connection
    }

    #[cfg(test)]
    pub fn state(&self) -> &PeerProtocolState {
        &self.state
    }

    #[cfg(test)]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn torrent_id(&self) -> Option<TorrentId> {
        match self.owner {
            ConnectionOwner::Associated(id) => Some(id),
            ConnectionOwner::Unassociated => None,
        }
    }

    pub fn handle_message(&mut self, message: Message, ctx: &mut Context) -> Result<Option<PeerEvent>, PeerError> {
        trace!(peer = %self.connection.addr(), ?message, "received");
        match message {
            Message::Handshake(handshake) => self.on_handshake(handshake, ctx),
            // The connection already noted that something arrived.
            Message::KeepAlive => Ok(None),
            Message::Choke => {
                self.state.am_choked = true;
                Ok(None)
            }
            Message::Unchoke => {
                self.state.am_choked = false;
                Ok(None)
            }
            Message::Interested => {
                self.state.peer_interested = true;
                Ok(None)
            }
            Message::NotInterested => {
                self.state.peer_interested = false;
                Ok(None)
            }
            Message::Bitfield(payload) => {
                let id = self.torrent_id().ok_or(PeerError::NotAssociated("bitfield"))?;
                let piece_count = ctx.torrents[id].store.metadata().piece_count();
                self.state.bitfield = bitfield::from_payload(&payload, piece_count);
                Ok(None)
            }
            Message::Have(index) => {
                self.torrent_id().ok_or(PeerError::NotAssociated("have"))?;
                if !bitfield::set_piece(&mut self.state.bitfield, index as usize) {
                    return Err(PeerError::InvalidMessage(format!(
                        "have for piece {} of {}",
                        index,
                        self.state.bitfield.len()
                    )));
                }
                Ok(None)
            }
            Message::Request(block) => {
                let id = self.torrent_id().ok_or(PeerError::NotAssociated("request"))?;
                if !self.state.peer_interested {
                    debug!(peer = %self.connection.addr(), "request without interest, ignoring");
                    return Ok(None);
                }
                let store = &ctx.torrents[id].store;
                match store.read_if_complete(block.piece_index, block.begin, block.length)? {
                    Some(data) => {
                        debug!(peer = %self.connection.addr(), piece = block.piece_index, begin = block.begin, "serving block");
                        self.connection.send(
                            ctx.reactor,
                            [Message::Piece {
                                index: block.piece_index,
                                begin: block.begin,
                                block: data,
                            }],
                        )?;
                    }
                    None => {
                        info!(peer = %self.connection.addr(), ?block, "asked for a block we do not have");
                    }
                }
                Ok(None)
            }
            Message::Piece { index, begin, block } => {
                let id = self.torrent_id().ok_or(PeerError::NotAssociated("piece"))?;
                let store = &mut ctx.torrents[id].store;
                let piece = index as usize;
                if piece >= store.metadata().piece_count()
                    || begin as usize + block.len() > store.metadata().piece_size(piece)
                {
                    return Err(PeerError::InvalidBlock {
                        index,
                        begin,
                        length: block.len(),
                    });
                }
                match self.connection.complete_request(index, begin) {
                    Some(request) if (block.len() as u32) < request.block.length => {
                        // The rest of the request is still pending; hand it back to the picker.
                        let rest = BlockInfo::new(
                            index,
                            begin + block.len() as u32,
                            request.block.length - block.len() as u32,
                        );
                        debug!(peer = %self.connection.addr(), ?rest, "short block, returning the remainder");
                        store.return_pending(&rest);
                    }
                    Some(_) => {}
                    None => {
                        debug!(peer = %self.connection.addr(), piece = index, begin, "block for a request we no longer track");
                    }
                }
                if store.is_checked(piece) {
                    return Ok(None);
                }
                store.record_received(index, begin, &block)?;
                match store.verify_piece(piece, true)? {
                    PieceCheck::Verified => Ok(Some(PeerEvent::PieceVerified(id, piece))),
                    PieceCheck::AlreadyVerified | PieceCheck::Incomplete | PieceCheck::Corrupt => Ok(None),
                }
            }
            Message::Cancel(block) => {
                if self.connection.cancel_queued_piece(&block) {
                    debug!(peer = %self.connection.addr(), ?block, "dropped cancelled block");
                }
                Ok(None)
            }
            Message::Port(port) => {
                debug!(peer = %self.connection.addr(), port, "ignoring dht port");
                Ok(None)
            }
        }
    }

    fn on_handshake(&mut self, handshake: Handshake, ctx: &mut Context) -> Result<Option<PeerEvent>, PeerError> {
        if self.state.handshake.is_some() {
            return Err(PeerError::DuplicateHandshake);
        }
        let (id, event) = match self.owner {
            ConnectionOwner::Associated(id) => {
                if ctx.torrents[id].store.metadata().info_hash != handshake.info_hash {
                    return Err(PeerError::UnknownInfoHash(handshake.info_hash));
                }
                (id, None)
            }
            ConnectionOwner::Unassociated => {
                let id = ctx
                    .torrents
                    .iter()
                    .position(|t| t.store.metadata().info_hash == handshake.info_hash)
                    .ok_or(PeerError::UnknownInfoHash(handshake.info_hash))?;
                (id, Some(PeerEvent::Associated(id)))
            }
        };
        if handshake.peer_id == ctx.peer_id {
            return Err(PeerError::SelfConnection);
        }

        let session = &ctx.torrents[id];
        let store = &session.store;
        if event.is_some() {
            self.owner = ConnectionOwner::Associated(id);
            self.state.bitfield = Bitfield::repeat(false, store.metadata().piece_count());
            self.strategy = Strategy::for_torrent(session);
            let reply = Handshake::new(store.metadata().info_hash, ctx.peer_id);
            self.connection.send(
                ctx.reactor,
                [Message::Handshake(reply), Message::Bitfield(store.bitfield())],
            )?;
        }
        // Whoever completes a handshake with us gets unchoked.
        self.connection.send(ctx.reactor, [Message::Unchoke])?;
        self.state.peer_choked = false;

        debug!(peer = %self.connection.addr(), torrent = %store.metadata().name, "handshake complete");
        self.state.handshake = Some(handshake);
        Ok(event)
    }
}
