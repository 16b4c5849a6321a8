//! Peer identifiers and the address forms hopline needs.
//!
//! Only three shapes matter to the relay layer:
//!
//! - transport endpoints: `/ip4/1.2.3.4/udp/9091`, `/ip6/::1/tcp/9091`,
//!   optionally followed by `/p2p/<peer>`
//! - bare identities: `/p2p/<peer>`
//! - relay hops: `/p2p/<relay>/p2p-circuit/p2p/<peer>`

use crate::error::AddrError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// 32-byte peer identifier, displayed as hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Wrap raw bytes
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random identifier, mostly useful in tests
    #[must_use]
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &hex::encode(self.0)[..8])
    }
}

impl FromStr for PeerId {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| AddrError::InvalidPeerId(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddrError::InvalidPeerId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Transport protocol of an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// UDP endpoint, usable as a STUN server
    Udp,
    /// TCP endpoint
    Tcp,
}

/// Parsed peer address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// IP endpoint, optionally bound to a peer identity
    Endpoint {
        /// Socket address
        addr: SocketAddr,
        /// Transport protocol
        protocol: Protocol,
        /// Trailing `/p2p/<peer>`, if any
        peer: Option<PeerId>,
    },
    /// Identity only, no reachable endpoint
    Peer(PeerId),
    /// Hop through a relay
    Circuit {
        /// Relaying peer
        relay: PeerId,
        /// Destination peer
        peer: PeerId,
    },
}

impl PeerAddr {
    /// Relay-hop address for `peer` through `relay`
    #[must_use]
    pub fn circuit(relay: PeerId, peer: PeerId) -> Self {
        Self::Circuit { relay, peer }
    }

    /// UDP socket address if this is a UDP endpoint
    #[must_use]
    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        match self {
            Self::Endpoint {
                addr,
                protocol: Protocol::Udp,
                ..
            } => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint {
                addr,
                protocol,
                peer,
            } => {
                let family = if addr.is_ipv4() { "ip4" } else { "ip6" };
                let proto = match protocol {
                    Protocol::Udp => "udp",
                    Protocol::Tcp => "tcp",
                };
                write!(f, "/{}/{}/{}/{}", family, addr.ip(), proto, addr.port())?;
                if let Some(peer) = peer {
                    write!(f, "/p2p/{peer}")?;
                }
                Ok(())
            }
            Self::Peer(peer) => write!(f, "/p2p/{peer}"),
            Self::Circuit { relay, peer } => write!(f, "/p2p/{relay}/p2p-circuit/p2p/{peer}"),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddrError::Invalid(s.to_string());

        let parts: Vec<&str> = s
            .strip_prefix('/')
            .ok_or_else(invalid)?
            .split('/')
            .collect();

        match parts.as_slice() {
            ["p2p", relay, "p2p-circuit", "p2p", peer] => Ok(Self::Circuit {
                relay: relay.parse()?,
                peer: peer.parse()?,
            }),
            ["p2p", peer] => Ok(Self::Peer(peer.parse()?)),
            [family @ ("ip4" | "ip6"), ip, rest @ ..] => {
                let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
                if (*family == "ip4") != ip.is_ipv4() {
                    return Err(invalid());
                }

                let (protocol, port, peer) = match rest {
                    // An IP with only an identity attached has no usable endpoint
                    ["p2p", peer] => return Ok(Self::Peer(peer.parse()?)),
                    [proto, port] => (*proto, *port, None),
                    [proto, port, "p2p", peer] => (*proto, *port, Some(peer.parse()?)),
                    _ => return Err(invalid()),
                };

                let protocol = match protocol {
                    "udp" => Protocol::Udp,
                    "tcp" => Protocol::Tcp,
                    _ => return Err(invalid()),
                };
                let port: u16 = port.parse().map_err(|_| invalid())?;

                Ok(Self::Endpoint {
                    addr: SocketAddr::new(ip, port),
                    protocol,
                    peer,
                })
            }
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrip() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_invalid() {
        assert!("zz".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_parse_udp_endpoint() {
        let addr: PeerAddr = "/ip4/1.2.3.4/udp/12345".parse().unwrap();
        assert_eq!(addr.udp_endpoint(), Some("1.2.3.4:12345".parse().unwrap()));
        assert_eq!(addr.to_string(), "/ip4/1.2.3.4/udp/12345");
    }

    #[test]
    fn test_parse_tcp_endpoint_has_no_udp() {
        let addr: PeerAddr = "/ip6/::1/tcp/9091".parse().unwrap();
        assert_eq!(addr.udp_endpoint(), None);
    }

    #[test]
    fn test_parse_ip_with_identity_only() {
        let peer = PeerId::new([7u8; 32]);
        let addr: PeerAddr = format!("/ip4/1.2.3.4/p2p/{peer}").parse().unwrap();
        assert_eq!(addr, PeerAddr::Peer(peer));
        assert_eq!(addr.udp_endpoint(), None);
    }

    #[test]
    fn test_circuit_roundtrip() {
        let relay = PeerId::new([1u8; 32]);
        let peer = PeerId::new([2u8; 32]);
        let addr = PeerAddr::circuit(relay, peer);
        let parsed: PeerAddr = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
        assert!(addr.to_string().contains("/p2p-circuit/"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<PeerAddr>().is_err());
        assert!("ip4/1.2.3.4/udp/1".parse::<PeerAddr>().is_err());
        assert!("/ip4/::1/udp/1".parse::<PeerAddr>().is_err());
        assert!("/ip4/1.2.3.4/sctp/1".parse::<PeerAddr>().is_err());
        assert!("/ip4/1.2.3.4/udp/notaport".parse::<PeerAddr>().is_err());
    }
}
