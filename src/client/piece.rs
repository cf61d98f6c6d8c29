use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use super::block::BlockInfo;
use super::disk::DiskStore;
use super::sparse::RangeBitset;
use super::torrent::TorrentMetadata;
use super::types::{Bitfield, PieceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceCheck {
    AlreadyVerified,
    Verified,
    Incomplete,
    Corrupt,
}

/// Download bookkeeping for one torrent: which bytes are on disk, which are
/// requested from some peer, and which pieces passed their hash check.
pub struct PieceStore {
    meta: TorrentMetadata,
    disk: DiskStore,
    have: RangeBitset,
    pending: RangeBitset,
    checked: RangeBitset,
}

impl PieceStore {
    pub fn new(meta: TorrentMetadata, disk: DiskStore) -> Self {
        assert_eq!(meta.length, disk.len(), "disk store does not match torrent");
        PieceStore {
            have: RangeBitset::new(meta.length),
            pending: RangeBitset::new(meta.length),
            checked: RangeBitset::new(meta.piece_count()),
            meta,
            disk,
        }
    }

    pub fn open(meta: TorrentMetadata, root: &Path) -> io::Result<Self> {
        let disk = DiskStore::open(root, &meta.files)?;
        Ok(PieceStore::new(meta, disk))
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.meta
    }

    #[cfg(test)]
    pub fn have(&self) -> &RangeBitset {
        &self.have
    }

    #[cfg(test)]
    pub fn pending(&self) -> &RangeBitset {
        &self.pending
    }

    pub fn is_checked(&self, index: PieceIndex) -> bool {
        self.checked.get(index)
    }

    pub fn record_received(&mut self, index: u32, begin: u32, block: &[u8]) -> io::Result<()> {
        let start = index as usize * self.meta.piece_length + begin as usize;
        let end = start + block.len();
        self.disk.write(start, block)?;
        self.have.set_range(start, end, true);
        self.pending.set_range(start, end, false);
        Ok(())
    }

    pub fn check_piece(&mut self, index: PieceIndex) -> io::Result<bool> {
        let check = self.verify_piece(index, true)?;
        Ok(matches!(check, PieceCheck::AlreadyVerified | PieceCheck::Verified))
    }

    pub fn verify_piece(&mut self, index: PieceIndex, zero_on_mismatch: bool) -> io::Result<PieceCheck> {
        if self.checked.get(index) {
            return Ok(PieceCheck::AlreadyVerified);
        }
        let range = self.meta.piece_range(index);
        if !self.have.get_range(range.start, range.end).all() {
            return Ok(PieceCheck::Incomplete);
        }

        let data = self.disk.read(range.start, range.end)?;
        let hash: [u8; 20] = Sha1::digest(&data).into();
        if hash == self.meta.piece_hashes[index] {
            self.checked.set_range(index, index + 1, true);
            debug!(piece = index, "piece verified");
            return Ok(PieceCheck::Verified);
        }

        warn!(
            piece = index,
            start = range.start,
            end = range.end,
            "hash check failed, throwing out piece"
        );
        self.have.set_range(range.start, range.end, false);
        self.pending.set_range(range.start, range.end, false);
        if zero_on_mismatch {
            self.disk.zero(range.start, range.end)?;
        }
        Ok(PieceCheck::Corrupt)
    }

    /// Checks every unverified piece; returns how many are verified afterwards.
    pub fn check_all_pieces(&mut self) -> io::Result<usize> {
        for index in 0..self.meta.piece_count() {
            if !self.checked.get(index) {
                self.check_piece(index)?;
            }
        }
        Ok(self.checked.count(true))
    }

    pub fn read_if_complete(&self, index: u32, begin: u32, length: u32) -> io::Result<Option<Bytes>> {
        let start = index as usize * self.meta.piece_length + begin as usize;
        let end = start + length as usize;
        if index as usize >= self.meta.piece_count() || end > self.meta.piece_range(index as usize).end {
            return Ok(None);
        }
        if !self.have.get_range(start, end).all() {
            return Ok(None);
        }
        self.disk.read(start, end).map(|data| Some(Bytes::from(data)))
    }

    /// Picks the next block nobody has requested yet and marks it pending.
    /// With `peer_has`, only bytes the peer advertises are considered.
    pub fn next_request(&mut self, peer_has: Option<&RangeBitset>, block_size: usize) -> Option<BlockInfo> {
        let mut wanted = self.have.union(&self.pending).complement();
        if let Some(available) = peer_has {
            wanted = wanted.intersect(available);
        }
        let start = wanted.find_first(true)?;
        let index = start / self.meta.piece_length;
        let end = (start + block_size)
            .min(self.meta.piece_range(index).end)
            .min(wanted.run_end(start));

        self.pending.set_range(start, end, true);
        let begin = start - index * self.meta.piece_length;
        Some(BlockInfo::new(index as u32, begin as u32, (end - start) as u32))
    }

    /// Makes a request that will never be answered requestable again.
    pub fn return_pending(&mut self, block: &BlockInfo) {
        let start = block.offset(self.meta.piece_length).min(self.meta.length);
        let end = (start + block.length as usize).min(self.meta.length);
        self.pending.set_range(start, end, false);
    }

    /// Byte-granularity view of a peer's piece bitfield.
    pub fn peer_availability(&self, bitfield: &Bitfield) -> RangeBitset {
        let mut flips = Vec::new();
        let mut current = false;
        for index in 0..self.meta.piece_count() {
            let has = bitfield.get(index).map_or(false, |bit| *bit);
            if has != current {
                flips.push(index * self.meta.piece_length);
                current = has;
            }
        }
        RangeBitset::from_flips(self.meta.length, flips)
    }

    /// Verified pieces, packed for a `Bitfield` message.
    pub fn bitfield(&self) -> Bytes {
        let mut bits = Bitfield::repeat(false, self.meta.piece_count());
        for run in self.checked.ones() {
            bits[run].fill(true);
        }
        Bytes::from(bits.into_vec())
    }

    /// Treats whatever is already in the backing files as received and keeps
    /// the pieces whose hashes match. Used when resuming.
    pub fn load_existing(&mut self) -> io::Result<usize> {
        self.have.set_all(true);
        for index in 0..self.meta.piece_count() {
            self.verify_piece(index, false)?;
        }
        let checked = self.checked.count(true);
        info!(checked, pieces = self.meta.piece_count(), "resumed from disk");
        Ok(checked)
    }

    /// Copies a complete copy of a single-file torrent's content into the
    /// store and verifies it.
    pub fn seed_from(&mut self, path: &Path) -> io::Result<usize> {
        let mut source = File::open(path)?;
        let mut buffer = vec![0; self.meta.piece_length];
        for index in 0..self.meta.piece_count() {
            let range = self.meta.piece_range(index);
            let chunk = &mut buffer[..range.len()];
            source.read_exact(chunk)?;
            self.disk.write(range.start, chunk)?;
            self.have.set_range(range.start, range.end, true);
        }
        self.check_all_pieces()
    }

    pub fn checked_count(&self) -> usize {
        self.checked.count(true)
    }

    pub fn all_checked(&self) -> bool {
        self.checked.all()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.meta.length == 0 {
            return 100.0;
        }
        self.have.count(true) as f64 / self.meta.length as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    pub fn bytes_left(&self) -> usize {
        self.have.count(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    pub(crate) fn store(temp: &TempDir, data: &[u8], piece_length: usize) -> PieceStore {
        let meta = TorrentMetadata::for_content("test.bin", piece_length, data);
        PieceStore::open(meta, temp.path()).unwrap()
    }

    pub(crate) fn fill(store: &mut PieceStore, data: &[u8]) {
        let piece_length = store.metadata().piece_length;
        for (index, chunk) in data.chunks(piece_length).enumerate() {
            store.record_received(index as u32, 0, chunk).unwrap();
        }
    }

    fn corrupt_byte(temp: &TempDir, offset: u64) {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(temp.path().join("test.bin"))
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[0xff]).unwrap();
    }

    #[test]
    fn record_then_check() {
        let temp = TempDir::new().unwrap();
        let data = content(20000);
        let mut store = store(&temp, &data, 16384);

        store.record_received(1, 0, &data[16384..18000]).unwrap();
        assert!(!store.check_piece(1).unwrap());
        store.record_received(1, 1616, &data[18000..]).unwrap();
        assert!(store.check_piece(1).unwrap());
        assert!(!store.is_complete());

        store.record_received(0, 0, &data[..16384]).unwrap();
        assert_eq!(store.check_all_pieces().unwrap(), 2);
        assert!(store.is_complete());
        assert_eq!(store.percent_complete(), 100.0);
    }

    #[test]
    fn check_is_idempotent_without_rereading() {
        let temp = TempDir::new().unwrap();
        let data = content(20000);
        let mut store = store(&temp, &data, 16384);
        fill(&mut store, &data);
        assert!(store.check_piece(0).unwrap());

        // A second check must not look at the disk again.
        corrupt_byte(&temp, 10);
        assert_eq!(store.verify_piece(0, true).unwrap(), PieceCheck::AlreadyVerified);
        assert!(store.check_piece(0).unwrap());
        assert!(store.have().get(10));
    }

    #[test]
    fn corruption_resets_exactly_one_piece() {
        let temp = TempDir::new().unwrap();
        let data = content(3 * 1024);
        let mut store = store(&temp, &data, 1024);
        fill(&mut store, &data);
        store.pending.set_all(true);

        corrupt_byte(&temp, 1500);
        assert!(store.check_piece(0).unwrap());
        assert!(!store.check_piece(1).unwrap());
        assert!(store.check_piece(2).unwrap());

        for i in 0..store.metadata().length {
            let in_piece = (1024..2048).contains(&i);
            assert_eq!(store.have().get(i), !in_piece, "have at {}", i);
            assert_eq!(store.pending().get(i), !in_piece, "pending at {}", i);
        }
        assert_eq!(store.disk.read(1024, 2048).unwrap(), vec![0; 1024]);

        let request = store.next_request(None, 16384).unwrap();
        assert_eq!(request, BlockInfo::new(1, 0, 1024));
    }

    #[test]
    fn read_if_complete_requires_whole_range() {
        let temp = TempDir::new().unwrap();
        let data = content(20000);
        let mut store = store(&temp, &data, 16384);
        store.record_received(0, 0, &data[..1000]).unwrap();

        assert_eq!(
            store.read_if_complete(0, 100, 500).unwrap(),
            Some(Bytes::copy_from_slice(&data[100..600]))
        );
        assert_eq!(store.read_if_complete(0, 900, 200).unwrap(), None);
        assert_eq!(store.read_if_complete(1, 0, 5000).unwrap(), None);
        assert_eq!(store.read_if_complete(7, 0, 1).unwrap(), None);
    }

    #[test]
    fn next_request_clamps_to_piece_and_torrent() {
        let temp = TempDir::new().unwrap();
        let data = content(20000);
        let mut store = store(&temp, &data, 16384);

        assert_eq!(store.next_request(None, 10000), Some(BlockInfo::new(0, 0, 10000)));
        assert_eq!(store.next_request(None, 10000), Some(BlockInfo::new(0, 10000, 6384)));
        assert_eq!(store.next_request(None, 10000), Some(BlockInfo::new(1, 0, 3616)));
        assert_eq!(store.next_request(None, 10000), None);

        store.return_pending(&BlockInfo::new(0, 10000, 6384));
        assert_eq!(store.next_request(None, 16384), Some(BlockInfo::new(0, 10000, 6384)));
    }

    #[test]
    fn next_request_respects_peer_availability() {
        let temp = TempDir::new().unwrap();
        let data = content(4 * 100);
        let mut store = store(&temp, &data, 100);

        let mut bitfield = Bitfield::repeat(false, 4);
        bitfield.set(2, true);
        let available = store.peer_availability(&bitfield);
        assert_eq!(available.find_first(true), Some(200));
        assert_eq!(available.run_end(200), 300);

        assert_eq!(store.next_request(Some(&available), 64), Some(BlockInfo::new(2, 0, 64)));
        assert_eq!(store.next_request(Some(&available), 64), Some(BlockInfo::new(2, 64, 36)));
        assert_eq!(store.next_request(Some(&available), 64), None);
    }

    #[test]
    fn bitfield_reflects_checked_pieces() {
        let temp = TempDir::new().unwrap();
        let data = content(10 * 10);
        let mut store = store(&temp, &data, 10);
        store.record_received(0, 0, &data[..10]).unwrap();
        store.record_received(9, 0, &data[90..]).unwrap();
        store.check_all_pieces().unwrap();
        assert_eq!(&store.bitfield()[..], &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn load_existing_and_seed_from() {
        let temp = TempDir::new().unwrap();
        let data = content(20000);
        let source = temp.path().join("source.bin");
        std::fs::write(&source, &data).unwrap();

        let out = TempDir::new().unwrap();
        {
            let mut seeder = store(&out, &data, 16384);
            assert_eq!(seeder.seed_from(&source).unwrap(), 2);
            assert!(seeder.is_complete());
        }
        let mut resumed = store(&out, &data, 16384);
        assert_eq!(resumed.load_existing().unwrap(), 2);

        let empty = TempDir::new().unwrap();
        let mut fresh = store(&empty, &data, 16384);
        assert_eq!(fresh.load_existing().unwrap(), 0);
        assert!(fresh.have().none());
    }
}
