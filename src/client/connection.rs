use bytes::{Buf, BytesMut};
use fxhash::FxHashMap;
use mio::net::TcpStream;
use mio::Token;
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use super::block::BlockInfo;
use super::error::PeerError;
use super::message::{decode_all, Message, PeerCodec};
use super::reactor::Reactor;
use crate::config::Config;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct OutstandingRequest {
    pub block: BlockInfo,
    pub sent_at: Instant,
}

/// A TCP connection to one peer, speaking framed wire messages.
///
/// Owned by the client's connection table; every method that touches the
/// socket takes the reactor so interest can follow the buffers.
pub struct PeerConnection {
    addr: SocketAddr,
    token: Token,
    stream: TcpStream,
    codec: PeerCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    send_queue: VecDeque<Message>,
    outstanding_requests: FxHashMap<(u32, u32), OutstandingRequest>,
    connect_started: Instant,
    last_sent: Instant,
    last_received: Option<Instant>,
    // TCP connect has completed.
    live: bool,
    // Peer sent EOF after the last batch of data.
    hung_up: bool,
    dead: bool,
    connect_timeout: Duration,
    keep_alive_interval: Duration,
    tick_interval: Duration,
}

impl PeerConnection {
    pub fn connect(addr: SocketAddr, token: Token, reactor: &mut Reactor, config: &Config) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        debug!(peer = %addr, "connecting");
        let mut connection = PeerConnection::new(addr, token, stream, false, config);
        reactor.register(token);
        reactor.watch_read(&mut connection.stream, token)?;
        reactor.watch_write(&mut connection.stream, token)?;
        reactor.start_timer(connection.tick_interval, token);
        Ok(connection)
    }

    pub fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        token: Token,
        reactor: &mut Reactor,
        config: &Config,
    ) -> io::Result<Self> {
        let mut connection = PeerConnection::new(addr, token, stream, true, config);
        reactor.register(token);
        reactor.watch_read(&mut connection.stream, token)?;
        reactor.start_timer(connection.tick_interval, token);
        Ok(connection)
    }

    fn new(addr: SocketAddr, token: Token, stream: TcpStream, live: bool, config: &Config) -> Self {
        let now = Instant::now();
        PeerConnection {
            addr,
            token,
            stream,
            codec: PeerCodec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            send_queue: VecDeque::new(),
            outstanding_requests: FxHashMap::default(),
            connect_started: now,
            last_sent: now,
            last_received: None,
            live,
            hung_up: false,
            dead: false,
            connect_timeout: config.connect_timeout,
            keep_alive_interval: config.keep_alive_interval,
            tick_interval: config.tick_interval,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.live
    }

    #[cfg(test)]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn hung_up(&self) -> bool {
        self.hung_up
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding_requests.len()
    }

    pub fn send<I>(&mut self, reactor: &mut Reactor, messages: I) -> Result<(), PeerError>
    where
        I: IntoIterator<Item = Message>,
    {
        if self.dead {
            return Err(PeerError::Dead);
        }
        let now = Instant::now();
        for message in messages {
            match &message {
                Message::Request(block) => {
                    self.outstanding_requests.insert(
                        block.key(),
                        OutstandingRequest {
                            block: *block,
                            sent_at: now,
                        },
                    );
                }
                Message::Cancel(block) => {
                    self.outstanding_requests.remove(&block.key());
                }
                _ => {}
            }
            self.send_queue.push_back(message);
        }
        reactor.watch_write(&mut self.stream, self.token)?;
        Ok(())
    }

    pub fn write_event(&mut self, reactor: &mut Reactor) -> Result<(), PeerError> {
        if self.dead {
            return Err(PeerError::Dead);
        }
        if !self.live {
            if let Some(err) = self.stream.take_error()? {
                return Err(err.into());
            }
            match self.stream.peer_addr() {
                Ok(_) => {
                    self.live = true;
                    debug!(peer = %self.addr, "connected");
                }
                // Spurious wakeup; the connect is still in progress.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(message) = self.send_queue.pop_front() {
            trace!(peer = %self.addr, ?message, "sending");
            self.codec.encode(message, &mut self.write_buf)?;
            self.last_sent = Instant::now();
        }
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if self.write_buf.is_empty() {
            reactor.unwatch_write(&mut self.stream, self.token)?;
        }
        Ok(())
    }

    /// Reads everything the socket has and returns the complete messages in
    /// arrival order. Partial frames stay buffered.
    pub fn read_event(&mut self) -> Result<Vec<Message>, PeerError> {
        if self.dead {
            return Err(PeerError::Dead);
        }
        let mut scratch = [0u8; READ_CHUNK];
        let mut received = 0;
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) if received == 0 => return Err(PeerError::ConnectionClosed),
                Ok(0) => {
                    self.hung_up = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    received += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if received > 0 {
            self.last_received = Some(Instant::now());
            // Anything arriving proves the connect went through.
            self.live = true;
        }
        decode_all(&mut self.read_buf)
    }

    /// Periodic housekeeping: connect timeout and keep-alives. Re-arms itself.
    pub fn tick(&mut self, reactor: &mut Reactor, now: Instant) -> Result<(), PeerError> {
        if self.dead {
            return Err(PeerError::Dead);
        }
        if !self.live
            && self.last_received.is_none()
            && now.saturating_duration_since(self.connect_started) >= self.connect_timeout
        {
            return Err(PeerError::ConnectTimeout);
        }
        if self.live
            && self.send_queue.is_empty()
            && now.saturating_duration_since(self.last_sent) >= self.keep_alive_interval / 2
        {
            self.send(reactor, [Message::KeepAlive])?;
        }
        reactor.start_timer(self.tick_interval, self.token);
        Ok(())
    }

    /// Forgets the request a `Piece` answers, if it is still outstanding.
    pub fn complete_request(&mut self, index: u32, begin: u32) -> Option<OutstandingRequest> {
        self.outstanding_requests.remove(&(index, begin))
    }

    pub fn stale_requests(&self, now: Instant, timeout: Duration) -> Vec<OutstandingRequest> {
        self.outstanding_requests
            .values()
            .filter(|r| now.saturating_duration_since(r.sent_at) >= timeout)
            .copied()
            .collect()
    }

    /// Drops a queued, not yet written `Piece` answer for a cancelled request.
    pub fn cancel_queued_piece(&mut self, block: &BlockInfo) -> bool {
        let before = self.send_queue.len();
        self.send_queue.retain(|message| {
            !matches!(message, Message::Piece { index, begin, .. }
                if *index == block.piece_index && *begin == block.begin)
        });
        before != self.send_queue.len()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<Message> {
        self.send_queue.iter().cloned().collect()
    }

    /// Tears the connection down and hands back every request that will now
    /// never be answered. Dying twice is a logic error.
    pub fn die(&mut self, reactor: &mut Reactor) -> Vec<BlockInfo> {
        assert!(!self.dead, "connection to {} died twice", self.addr);
        self.dead = true;
        if let Err(e) = reactor.deregister(&mut self.stream, self.token) {
            debug!(peer = %self.addr, error = %e, "deregister failed");
        }
        reactor.cancel_timers(self.token);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.send_queue.clear();
        self.outstanding_requests.drain().map(|(_, r)| r.block).collect()
    }
}
