//! Peer identities, their addresses, and the routing table entry.
use std::fmt::{self, Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::common::KadId;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Opaque identity of a peer, as handed to us by the identity layer.
pub struct PeerId(Bytes);

impl PeerId {
    pub fn from_bytes<T: Into<Bytes>>(bytes: T) -> PeerId {
        PeerId(bytes.into())
    }

    /// Identity of the owner of a public key: the SHA-256 digest of the key bytes.
    pub fn from_public_key(public_key: &[u8]) -> PeerId {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        let digest: [u8; 32] = hasher.finalize().into();

        PeerId(Bytes::copy_from_slice(&digest))
    }

    pub fn random() -> PeerId {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 32] = rng.gen();

        PeerId(Bytes::copy_from_slice(&random_bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Position of this peer in the Kademlia key space.
    pub fn kad_id(&self) -> KadId {
        KadId::digest(&self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(8) {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
/// A textual multiaddr such as `/ip4/1.2.3.4/tcp/4001` or `/dns4/example.com/tcp/443`.
pub struct Multiaddr(String);

impl Multiaddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first `(protocol, value)` pair of this address.
    fn first_tuple(&self) -> Option<(&str, &str)> {
        let mut parts = self.0.split('/').skip(1);

        Some((parts.next()?, parts.next().unwrap_or_default()))
    }

    /// The IP address of this multiaddr, if it starts with `/ip4` or `/ip6`.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.first_tuple()? {
            ("ip4", value) => value.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
            ("ip6", value) => value.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
            _ => None,
        }
    }

    /// Returns `true` for relayed addresses.
    pub fn is_circuit(&self) -> bool {
        self.0.split('/').any(|part| part == "p2p-circuit")
    }

    /// Returns `true` if this address is probably reachable from the public internet.
    ///
    /// DNS addresses are assumed to be public.
    pub fn is_public(&self) -> bool {
        match self.first_tuple() {
            Some(("dns" | "dns4" | "dns6" | "dnsaddr", host)) => host != "localhost",
            Some(("ip4" | "ip6", _)) => self.ip().map(|ip| !is_private_ip(&ip)).unwrap_or(false),
            _ => false,
        }
    }

    /// Returns `true` for addresses only reachable on the local network.
    pub fn is_private(&self) -> bool {
        match self.first_tuple() {
            Some((_, "localhost")) => true,
            Some(("ip4" | "ip6", _)) => self.ip().map(|ip| is_private_ip(&ip)).unwrap_or(false),
            _ => false,
        }
    }
}

impl Debug for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self.0)
    }
}

impl Display for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Multiaddr {
    fn from(addr: &str) -> Self {
        Multiaddr::new(addr)
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            let [a, b, ..] = ip.octets();

            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || ip.is_documentation()
                // Shared address space (carrier grade NAT)
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];

            ip.is_loopback()
                || ip.is_unspecified()
                // Unique local fc00::/7
                || (first & 0xfe00) == 0xfc00
                // Link local fe80::/10
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer id and the addresses it can be reached at.
pub struct PeerInfo {
    pub id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, multiaddrs: Vec<Multiaddr>) -> Self {
        Self { id, multiaddrs }
    }

    /// A peer whose addresses are unknown (to be resolved by the peer store).
    pub fn without_addrs(id: PeerId) -> Self {
        Self {
            id,
            multiaddrs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Routing table entry.
///
/// Owns no addresses; those are looked up in the peer store.
pub struct Peer {
    pub kad_id: KadId,
    pub peer_id: PeerId,
}

impl Peer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            kad_id: peer_id.kad_id(),
            peer_id,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kad_id_is_digest_of_peer_id() {
        let peer_id = PeerId::from_bytes(&b"peer"[..]);

        assert_eq!(peer_id.kad_id(), KadId::digest(b"peer"));
        assert_eq!(Peer::new(peer_id.clone()).kad_id, peer_id.kad_id());
    }

    #[test]
    fn public_and_private_addresses() {
        let public = Multiaddr::new("/ip4/8.8.8.8/tcp/4001");
        let private = Multiaddr::new("/ip4/192.168.1.10/tcp/4001");
        let loopback = Multiaddr::new("/ip4/127.0.0.1/tcp/4001");
        let cgnat = Multiaddr::new("/ip4/100.72.0.1/tcp/4001");
        let ula = Multiaddr::new("/ip6/fd00::1/tcp/4001");
        let dns = Multiaddr::new("/dns4/example.com/tcp/443");
        let localhost = Multiaddr::new("/dns4/localhost/tcp/443");

        assert!(public.is_public());
        assert!(!public.is_private());
        assert!(private.is_private());
        assert!(!private.is_public());
        assert!(loopback.is_private());
        assert!(cgnat.is_private());
        assert!(ula.is_private());
        assert!(dns.is_public());
        assert!(!dns.is_private());
        assert!(localhost.is_private());
        assert!(!localhost.is_public());
    }

    #[test]
    fn circuit_addresses() {
        let relayed = Multiaddr::new("/ip4/8.8.8.8/tcp/4001/p2p/QmRelay/p2p-circuit");

        assert!(relayed.is_circuit());
        assert!(!Multiaddr::new("/ip4/8.8.8.8/tcp/4001").is_circuit());
    }
}
