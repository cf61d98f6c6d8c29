use bytes::{BufMut, BytesMut};

use super::types::{InfoHash, PeerId};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Length of a handshake frame: 1 + pstr + 8 reserved + 20 info hash + 20 peer id.
pub const fn handshake_len(pstr_len: usize) -> usize {
    49 + pstr_len
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake {
            pstr: PROTOCOL.to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(handshake_len(self.pstr.len()));
        buf.put_u8(self.pstr.len() as u8);
        buf.put_slice(&self.pstr);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    // Expects exactly one complete frame, already validated by the codec.
    pub(crate) fn from_frame(frame: &[u8]) -> Self {
        let pstr_len = frame[0] as usize;
        let pstr = frame[1..1 + pstr_len].to_vec();
        let rest = &frame[1 + pstr_len..];

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&rest[..8]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&rest[8..28]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&rest[28..48]);

        Handshake {
            pstr,
            reserved,
            info_hash,
            peer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_layout() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        handshake.encode(&mut buf);

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL);
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[1; 20]);
        assert_eq!(&buf[48..68], &[2; 20]);
    }

    #[test]
    fn from_frame_reads_fields() {
        let mut handshake = Handshake::new([7; 20], [9; 20]);
        handshake.reserved[5] = 0x10;
        let mut buf = BytesMut::new();
        handshake.encode(&mut buf);
        assert_eq!(Handshake::from_frame(&buf), handshake);
    }
}
