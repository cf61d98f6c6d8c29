use thiserror::Error;

use super::types::InfoHash;

/// Faults that end a single peer connection. None of these affect other
/// connections or the torrent session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("send on a dead connection")]
    Dead,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("received a second handshake")]
    DuplicateHandshake,

    #[error("no torrent for info hash {0:02x?}")]
    UnknownInfoHash(InfoHash),

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("{0} before handshake")]
    NotAssociated(&'static str),

    #[error("block {index}:{begin}+{length} lies outside its piece")]
    InvalidBlock { index: u32, begin: u32, length: usize },
}
