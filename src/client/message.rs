use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use super::block::BlockInfo;
use super::error::PeerError;
use super::handshake::{handshake_len, Handshake, PROTOCOL};

// Largest length prefix we accept. A bitfield for a huge torrent or a 16 KiB
// block fit comfortably; anything bigger is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageId {
    // Chokes the receiver
    Choke = 0,
    // Unchokes the receiver
    Unchoke = 1,
    // Whether or not we are interested in anything the peer has. Sent after
    // being unchoked, and requesting blocks.
    Interested = 2,
    // Sender is not interested.
    NotInterested = 3,
    // Have payload is zero indexed of a piece that has been downloaded and
    // verified by hash.
    Have = 4,
    // Sent immediately after handshaking,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // DHT listen port, two bytes.
    Port = 9,
}

/// Wire shape of a message body after its id byte.
#[derive(Debug)]
pub struct Layout {
    pub fixed_len: usize,
    pub has_payload: bool,
}

const LAYOUTS: [Layout; 10] = [
    Layout { fixed_len: 0, has_payload: false },  // choke
    Layout { fixed_len: 0, has_payload: false },  // unchoke
    Layout { fixed_len: 0, has_payload: false },  // interested
    Layout { fixed_len: 0, has_payload: false },  // not interested
    Layout { fixed_len: 4, has_payload: false },  // have
    Layout { fixed_len: 0, has_payload: true },   // bitfield
    Layout { fixed_len: 12, has_payload: false }, // request
    Layout { fixed_len: 8, has_payload: true },   // piece
    Layout { fixed_len: 12, has_payload: false }, // cancel
    Layout { fixed_len: 2, has_payload: false },  // port
];

impl MessageId {
    pub fn layout(self) -> &'static Layout {
        &LAYOUTS[self as usize]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // keep-alive message has zero bytes, no message ID or payload.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel(BlockInfo),
    Port(u16),
    Handshake(Handshake),
}

impl Message {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive | Message::Handshake(_) => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Bitfield(bits) => bits.len(),
            Message::Piece { block, .. } => block.len(),
            _ => 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let message_id = match (self, self.message_id()) {
            (Message::Handshake(handshake), _) => return handshake.encode(buf),
            (_, None) => return buf.put_u32(0),
            (_, Some(id)) => id,
        };

        let body_len = 1 + message_id.layout().fixed_len + self.payload_len();
        buf.reserve(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(message_id as u8);

        match self {
            Message::Have(index) => buf.put_u32(*index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request(block) | Message::Cancel(block) => block.encode(buf),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port(port) => buf.put_u16(*port),
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Frames peer wire messages, including the handshake, on a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerCodec;

impl PeerCodec {
    fn decode_handshake(src: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        let seen = &src[1..src.len().min(1 + PROTOCOL.len())];
        if seen != &PROTOCOL[..seen.len()] {
            return Err(PeerError::InvalidHandshake);
        }
        let frame_len = handshake_len(PROTOCOL.len());
        if src.len() < frame_len {
            return Ok(None);
        }
        let frame = src.split_to(frame_len);
        Ok(Some(Message::Handshake(Handshake::from_frame(&frame))))
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        if src.is_empty() {
            return Ok(None);
        }
        // A length prefix starting with 19 would announce a frame far above
        // MAX_FRAME_LEN, so this byte can only begin a handshake.
        if src[0] as usize == PROTOCOL.len() {
            return Self::decode_handshake(src);
        }
        if src.len() < 4 {
            return Ok(None);
        }

        let body_len = BigEndian::read_u32(&src[..4]) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(body_len));
        }
        if body_len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if src.len() < 4 + body_len {
            return Ok(None);
        }

        let id = src[4];
        let message_id = MessageId::from_u8(id).ok_or(PeerError::InvalidMessageId(id))?;
        let layout = message_id.layout();
        let args_len = body_len - 1;
        let well_formed = if layout.has_payload {
            args_len >= layout.fixed_len
        } else {
            args_len == layout.fixed_len
        };
        if !well_formed {
            return Err(PeerError::InvalidMessage(format!(
                "{:?} with body length {}",
                message_id, body_len
            )));
        }

        src.advance(5);
        let mut body = src.split_to(args_len);
        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(body.get_u32()),
            MessageId::Bitfield => Message::Bitfield(body.freeze()),
            MessageId::Request => Message::Request(BlockInfo::decode(&mut body)),
            MessageId::Piece => {
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: body.freeze(),
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo::decode(&mut body)),
            MessageId::Port => Message::Port(body.get_u16()),
        };
        Ok(Some(message))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), PeerError> {
        item.encode(dst);
        Ok(())
    }
}

/// Decodes every complete frame in `buf`, leaving any trailing partial frame
/// in place for the next read.
pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Message>, PeerError> {
    let mut codec = PeerCodec;
    let mut messages = Vec::new();
    while let Some(message) = codec.decode(buf)? {
        messages.push(message);
    }
    Ok(messages)
}
