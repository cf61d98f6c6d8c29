use bytes::{Buf, BufMut, BytesMut};

/// A sub-range of a piece, as carried by `Request` and `Cancel` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        BlockInfo {
            piece_index,
            begin,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index);
        buf.put_u32(self.begin);
        buf.put_u32(self.length);
    }

    // Caller guarantees at least 12 bytes are available.
    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        let piece_index = buf.get_u32();
        let begin = buf.get_u32();
        let length = buf.get_u32();
        BlockInfo {
            piece_index,
            begin,
            length,
        }
    }

    /// Key used to match a `Piece` answer back to the request that caused it.
    pub fn key(&self) -> (u32, u32) {
        (self.piece_index, self.begin)
    }

    /// Absolute byte offset of this block within the torrent.
    pub fn offset(&self, piece_length: usize) -> usize {
        self.piece_index as usize * piece_length + self.begin as usize
    }
}
