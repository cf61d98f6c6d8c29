use anyhow::{anyhow, bail, Context, Result};
use serde_bencode::{de, value::Value};
use serde_bytes::ByteBuf;
use serde_derive::Deserialize;
use sha1::{Digest, Sha1};

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::types::{InfoHash, PieceHash, PieceHashes};

#[derive(Debug, Deserialize)]
struct BencodeFile {
    length: usize,
    path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BencodeInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: usize,
    pieces: ByteBuf,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default)]
    files: Option<Vec<BencodeFile>>,
    #[serde(default)]
    private: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct BencodeTorrent {
    info: BencodeInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

// The info hash has to cover the info dictionary exactly as it appeared in
// the file, including keys we never look at. Decoding it a second time as a
// generic value and re-encoding that keeps every key.
#[derive(Debug, Deserialize)]
struct RawTorrent {
    info: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub announce: Option<String>,
    pub name: String,
    pub info_hash: InfoHash,
    pub piece_length: usize,
    pub piece_hashes: PieceHashes,
    pub length: usize,
    pub files: Vec<FileEntry>,
    pub private: bool,
    pub creation_date: Option<i64>,
    pub created_by: Option<String>,
}

impl TorrentMetadata {
    pub fn open(path: &Path) -> Result<Self> {
        let buffer = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_bytes(&buffer).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let torrent = de::from_bytes::<BencodeTorrent>(buffer)?;
        let raw = de::from_bytes::<RawTorrent>(buffer)?;
        let info_hash: InfoHash = Sha1::digest(serde_bencode::to_bytes(&raw.info)?).into();

        let info = torrent.info;
        if info.piece_length == 0 {
            bail!("piece length is zero");
        }
        let piece_hashes = split_piece_hashes(&info.pieces)?;

        let files = match (info.length, info.files) {
            (Some(length), None) => vec![FileEntry {
                path: PathBuf::from(&info.name),
                length,
            }],
            (None, Some(files)) => files
                .into_iter()
                .map(|f| FileEntry {
                    path: f.path.iter().fold(PathBuf::from(&info.name), |p, c| p.join(c)),
                    length: f.length,
                })
                .collect(),
            _ => bail!("info must have exactly one of `length` and `files`"),
        };
        let length = files.iter().map(|f| f.length).sum();

        if length > piece_hashes.len() * info.piece_length {
            bail!(
                "total length {} exceeds {} pieces of {} bytes",
                length,
                piece_hashes.len(),
                info.piece_length
            );
        }

        Ok(TorrentMetadata {
            announce: torrent.announce,
            name: info.name,
            info_hash,
            piece_length: info.piece_length,
            piece_hashes,
            length,
            files,
            private: info.private.unwrap_or(0) != 0,
            creation_date: torrent.creation_date,
            created_by: torrent.created_by,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_range(&self, index: usize) -> Range<usize> {
        let start = index * self.piece_length;
        let end = (start + self.piece_length).min(self.length);
        start..end
    }

    pub fn piece_size(&self, index: usize) -> usize {
        self.piece_range(index).len()
    }

    #[cfg(test)]
    pub(crate) fn for_content(name: &str, piece_length: usize, content: &[u8]) -> Self {
        let piece_hashes = content
            .chunks(piece_length)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        TorrentMetadata {
            announce: None,
            name: name.to_string(),
            info_hash: Sha1::digest(name.as_bytes()).into(),
            piece_length,
            piece_hashes,
            length: content.len(),
            files: vec![FileEntry {
                path: PathBuf::from(name),
                length: content.len(),
            }],
            private: false,
            creation_date: None,
            created_by: None,
        }
    }
}

fn split_piece_hashes(pieces: &[u8]) -> Result<PieceHashes> {
    let hash_len = 20;
    if pieces.len() % hash_len != 0 {
        return Err(anyhow!("malformed pieces of length {}", pieces.len()));
    }
    Ok(pieces
        .chunks_exact(hash_len)
        .map(|chunk| {
            let mut hash: PieceHash = [0; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bstr(s: &[u8]) -> Vec<u8> {
        let mut out = format!("{}:", s.len()).into_bytes();
        out.extend_from_slice(s);
        out
    }

    fn single_file_info(length: usize, pieces: usize) -> Vec<u8> {
        let mut info = b"d".to_vec();
        info.extend(format!("6:lengthi{}e", length).bytes());
        info.extend(bstr(b"name"));
        info.extend(bstr(b"test.bin"));
        info.extend(bstr(b"piece length"));
        info.extend(b"i16384e");
        info.extend(bstr(b"pieces"));
        info.extend(bstr(&vec![0xab; 20 * pieces]));
        info.extend(bstr(b"x-extra"));
        info.extend(bstr(b"kept for the hash"));
        info.push(b'e');
        info
    }

    fn wrap(info: &[u8]) -> Vec<u8> {
        let mut torrent = b"d".to_vec();
        torrent.extend(bstr(b"announce"));
        torrent.extend(bstr(b"http://tracker.test/announce"));
        torrent.extend(bstr(b"created by"));
        torrent.extend(bstr(b"trickle"));
        torrent.extend(bstr(b"creation date"));
        torrent.extend(b"i1600000000e");
        torrent.extend(bstr(b"info"));
        torrent.extend_from_slice(info);
        torrent.push(b'e');
        torrent
    }

    #[test]
    fn parses_single_file() {
        let info = single_file_info(20000, 2);
        let meta = TorrentMetadata::from_bytes(&wrap(&info)).unwrap();

        assert_eq!(meta.announce.as_deref(), Some("http://tracker.test/announce"));
        assert_eq!(meta.created_by.as_deref(), Some("trickle"));
        assert_eq!(meta.creation_date, Some(1_600_000_000));
        assert_eq!(meta.piece_length, 16384);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.length, 20000);
        assert_eq!(
            meta.files,
            vec![FileEntry {
                path: PathBuf::from("test.bin"),
                length: 20000
            }]
        );
        let expected: InfoHash = Sha1::digest(&info).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn piece_ranges_clamp_last_piece() {
        let meta = TorrentMetadata::from_bytes(&wrap(&single_file_info(20000, 2))).unwrap();
        assert_eq!(meta.piece_range(0), 0..16384);
        assert_eq!(meta.piece_range(1), 16384..20000);
        assert_eq!(meta.piece_size(1), 3616);
    }

    #[test]
    fn parses_multi_file() {
        let mut info = b"d".to_vec();
        info.extend(bstr(b"files"));
        info.extend(b"l");
        for (len, name) in [(100usize, &b"a.txt"[..]), (50, &b"b.txt"[..])] {
            info.extend(b"d");
            info.extend(format!("6:lengthi{}e", len).bytes());
            info.extend(bstr(b"path"));
            info.extend(b"l");
            info.extend(bstr(b"sub"));
            info.extend(bstr(name));
            info.extend(b"ee");
        }
        info.extend(b"e");
        info.extend(bstr(b"name"));
        info.extend(bstr(b"bundle"));
        info.extend(bstr(b"piece length"));
        info.extend(b"i64e");
        info.extend(bstr(b"pieces"));
        info.extend(bstr(&vec![1; 60]));
        info.extend(bstr(b"private"));
        info.extend(b"i1e");
        info.push(b'e');

        let meta = TorrentMetadata::from_bytes(&wrap(&info)).unwrap();
        assert_eq!(meta.length, 150);
        assert!(meta.private);
        assert_eq!(meta.files[0].path, PathBuf::from("bundle/sub/a.txt"));
        assert_eq!(meta.files[1].path, PathBuf::from("bundle/sub/b.txt"));
    }

    #[test]
    fn rejects_length_beyond_pieces() {
        let torrent = wrap(&single_file_info(40000, 2));
        assert!(TorrentMetadata::from_bytes(&torrent).is_err());
    }
}
