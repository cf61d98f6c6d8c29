use bitvec::prelude::{BitVec, Msb0};

pub type Bitfield = BitVec<u8, Msb0>;
pub type InfoHash = [u8; 20];
pub type PeerAddr = [u8; 6];
pub type PeerId = [u8; 20];
pub type PieceHash = [u8; 20];
pub type PieceHashes = Vec<PieceHash>;
pub type PieceIndex = usize;

// Index into the client's torrent table. Connections hold this instead of a
// reference to the session that owns them.
pub type TorrentId = usize;
