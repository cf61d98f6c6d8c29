use super::peer::Peer;
use super::torrent::TorrentMetadata;
use super::types::{InfoHash, PeerId};

use anyhow::{anyhow, Context, Result};
use serde_bencode::de;
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
        }
    }
}

// The plain query parameters. info_hash and peer_id are raw bytes and get
// percent-encoded by hand.
#[derive(Debug, Serialize)]
struct AnnounceParams {
    port: u16,
    uploaded: usize,
    downloaded: usize,
    left: usize,
    compact: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
}

#[derive(Debug)]
pub struct TrackerRequest {
    announce: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    params: AnnounceParams,
}

impl TrackerRequest {
    pub fn new(
        meta: &TorrentMetadata,
        peer_id: PeerId,
        port: u16,
        downloaded: usize,
        left: usize,
        event: Option<AnnounceEvent>,
    ) -> Result<Self> {
        let announce = meta
            .announce
            .clone()
            .ok_or_else(|| anyhow!("torrent has no announce url"))?;
        Ok(TrackerRequest {
            announce,
            info_hash: meta.info_hash,
            peer_id,
            params: AnnounceParams {
                port,
                uploaded: 0,
                downloaded,
                left,
                compact: 1,
                event: event.map(AnnounceEvent::as_str),
            },
        })
    }

    pub fn url(&self) -> Result<String> {
        let query = serde_urlencoded::to_string(&self.params)?;
        let separator = if self.announce.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}info_hash={}&peer_id={}&{}",
            self.announce,
            separator,
            percent_encode(&self.info_hash),
            percent_encode(&self.peer_id),
            query
        ))
    }

    pub fn send(&self, timeout: Duration) -> Result<TrackerResponse> {
        let url = self.url()?;
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        let body = client
            .get(&url)
            .send()
            .and_then(|res| res.error_for_status())
            .and_then(|res| res.bytes())
            .with_context(|| format!("announcing to {}", self.announce))?;
        TrackerResponse::from_bytes(&body)
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|v| format!("%{:02X}", v)).collect::<String>()
}

#[derive(Debug, Deserialize)]
struct BencodeResponse {
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<ByteBuf>,
}

#[derive(Debug)]
pub struct TrackerResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub complete: u64,
    pub incomplete: u64,
    pub peers: Vec<Peer>,
}

impl TrackerResponse {
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let res = de::from_bytes::<BencodeResponse>(body).context("decoding tracker response")?;
        if let Some(reason) = res.failure_reason {
            return Err(anyhow!("tracker failure: {}", reason));
        }
        Ok(TrackerResponse {
            interval: Duration::from_secs(res.interval.unwrap_or(1800)),
            min_interval: res.min_interval.map(Duration::from_secs),
            complete: res.complete.unwrap_or(0),
            incomplete: res.incomplete.unwrap_or(0),
            peers: res
                .peers
                .map(|blob| Peer::parse_compact(&blob))
                .unwrap_or_default(),
        })
    }

    /// How long to wait before announcing again. Never sooner than the
    /// tracker's `min interval`.
    pub fn next_announce(&self) -> Duration {
        self.min_interval.map_or(self.interval, |min| self.interval.max(min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_binary_fields() {
        let mut meta = TorrentMetadata::for_content("a.bin", 4, b"abcdefgh");
        meta.announce = Some("http://tracker.test/announce".to_string());
        meta.info_hash = [0xab; 20];
        let req = TrackerRequest::new(&meta, [b'-'; 20], 6881, 0, 8, Some(AnnounceEvent::Started)).unwrap();
        let url = req.url().unwrap();

        assert!(url.starts_with("http://tracker.test/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=%2D%2D"));
        assert!(url.ends_with("port=6881&uploaded=0&downloaded=0&left=8&compact=1&event=started"));
    }

    #[test]
    fn missing_announce_is_an_error() {
        let meta = TorrentMetadata::for_content("a.bin", 4, b"abcd");
        assert!(TrackerRequest::new(&meta, [0; 20], 6881, 0, 4, None).is_err());
    }

    #[test]
    fn parses_compact_response() {
        let mut body = b"d8:completei3e10:incompletei1e8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]);
        body.push(b'e');
        let res = TrackerResponse::from_bytes(&body).unwrap();

        assert_eq!(res.interval, Duration::from_secs(900));
        assert_eq!(res.complete, 3);
        assert_eq!(res.incomplete, 1);
        assert_eq!(res.peers.len(), 2);
        assert_eq!(res.peers[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn min_interval_bounds_the_reannounce() {
        let res = TrackerResponse::from_bytes(b"d8:intervali60e12:min intervali300e5:peers0:e").unwrap();
        assert_eq!(res.min_interval, Some(Duration::from_secs(300)));
        assert_eq!(res.next_announce(), Duration::from_secs(300));

        let res = TrackerResponse::from_bytes(b"d8:intervali900e12:min intervali300ee").unwrap();
        assert_eq!(res.next_announce(), Duration::from_secs(900));

        let res = TrackerResponse::from_bytes(b"de").unwrap();
        assert_eq!(res.min_interval, None);
        assert_eq!(res.next_announce(), Duration::from_secs(1800));
        assert!(res.peers.is_empty());
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason12:unregisterede";
        let err = TrackerResponse::from_bytes(body).unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }
}
