use super::types::PeerAddr;

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A peer address as handed out by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    /// Splits a compact peer list into addresses. A trailing partial entry is
    /// ignored.
    pub fn parse_compact(blob: &[u8]) -> Vec<Peer> {
        blob.chunks_exact(6)
            .map(|chunk| {
                let mut addr: PeerAddr = [0; 6];
                addr.copy_from_slice(chunk);
                Peer::from(addr)
            })
            .collect()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<PeerAddr> for Peer {
    // Peers are given as chunks of 6 bytes in compact mode, like so:
    // [192, 0, 2, 123, 26, 225].  The first four bytes are the IP, and the
    // last two are the port in BigEndian format.
    // Eg: [26, 225] or [0x1A, 0xE1] -> 6881
    fn from(peer_addr: PeerAddr) -> Self {
        let addr = Ipv4Addr::new(peer_addr[0], peer_addr[1], peer_addr[2], peer_addr[3]);
        let port = BigEndian::read_u16(&peer_addr[4..6]);
        Peer { addr, port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bytes() {
        let addr: PeerAddr = [192, 0, 2, 123, 26, 225];
        let peer = Peer::from(addr);
        let expected = Peer {
            addr: Ipv4Addr::new(192, 0, 2, 123),
            port: 6881,
        };
        assert_eq!(peer, expected);
    }

    #[test]
    fn format() {
        let addr: PeerAddr = [192, 0, 2, 123, 26, 225];
        let peer = Peer::from(addr);
        assert_eq!(peer.to_string(), "192.0.2.123:6881");
        assert_eq!(peer.socket_addr().to_string(), "192.0.2.123:6881");
    }

    #[test]
    fn compact_list() {
        let blob = [10, 0, 0, 1, 0, 80, 10, 0, 0, 2, 0x1a, 0xe1, 99];
        let peers = Peer::parse_compact(&blob);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "10.0.0.1:80");
        assert_eq!(peers[1].to_string(), "10.0.0.2:6881");
    }
}
