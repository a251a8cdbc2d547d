//! Component B: the fixed on-wire encoding for a UDP peer address, used
//! both for the `p.udp_address` default-peer slot on a socket and for the
//! source/destination trailer carried on UDP sends and `Event::Udp`.
//!
//! Layout: `[protocol_tag: u8][port: u16 BE][addr: 4 or 16 bytes]`. An IPv4
//! address encodes to 7 bytes, an IPv6 address to 19 — `UDP_ADDRESS_SIZE`
//! is the storage ceiling, not a fixed frame length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::protocol::Protocol;

pub const UDP_ADDRESS_SIZE: usize = 19;

#[derive(Debug, thiserror::Error)]
pub enum UdpAddrError {
    #[error("udp address frame too short: {0} bytes")]
    Truncated(usize),
    #[error("unrecognised udp address family tag {0}")]
    BadFamily(u8),
}

/// A decoded or to-be-encoded UDP peer address, stored in its wire form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpAddr {
    bytes: [u8; UDP_ADDRESS_SIZE],
    len: usize,
}

impl UdpAddr {
    pub fn encode(addr: SocketAddr) -> Self {
        let mut bytes = [0u8; UDP_ADDRESS_SIZE];
        let port = addr.port().to_be_bytes();
        let len = match addr.ip() {
            IpAddr::V4(v4) => {
                bytes[0] = Protocol::Udp as u8;
                bytes[1..3].copy_from_slice(&port);
                bytes[3..7].copy_from_slice(&v4.octets());
                7
            }
            IpAddr::V6(v6) => {
                bytes[0] = Protocol::UdpV6 as u8;
                bytes[1..3].copy_from_slice(&port);
                bytes[3..19].copy_from_slice(&v6.octets());
                19
            }
        };
        Self { bytes, len }
    }

    /// Decode a wire frame (exactly 7 or 19 bytes, as produced by
    /// [`Self::encode`] or received as an inbound datagram trailer).
    pub fn decode(wire: &[u8]) -> Result<Self, UdpAddrError> {
        if wire.is_empty() {
            return Err(UdpAddrError::Truncated(0));
        }
        let needed = match Protocol::from_u8(wire[0]) {
            Protocol::Udp => 7,
            Protocol::UdpV6 => 19,
            _ => return Err(UdpAddrError::BadFamily(wire[0])),
        };
        if wire.len() < needed {
            return Err(UdpAddrError::Truncated(wire.len()));
        }
        let mut bytes = [0u8; UDP_ADDRESS_SIZE];
        bytes[..needed].copy_from_slice(&wire[..needed]);
        Ok(Self { bytes, len: needed })
    }

    pub const fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.bytes[0])
    }

    /// Wire-length slice: 7 bytes for an IPv4 peer, 19 for IPv6.
    pub fn as_wire(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let port = u16::from_be_bytes([self.bytes[1], self.bytes[2]]);
        match self.protocol() {
            Protocol::Udp => {
                let octets: [u8; 4] = self.bytes[3..7].try_into().unwrap();
                SocketAddr::from((Ipv4Addr::from(octets), port))
            }
            _ => {
                let octets: [u8; 16] = self.bytes[3..19].try_into().unwrap();
                SocketAddr::from((Ipv6Addr::from(octets), port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_v4() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let enc = UdpAddr::encode(addr);
        assert_eq!(enc.as_wire().len(), 7);
        let dec = UdpAddr::decode(enc.as_wire()).unwrap();
        assert_eq!(dec.socket_addr(), addr);
    }

    #[test]
    fn round_trips_v6() {
        let addr: SocketAddr = "[::1]:4000".parse().unwrap();
        let enc = UdpAddr::encode(addr);
        assert_eq!(enc.as_wire().len(), 19);
        let dec = UdpAddr::decode(enc.as_wire()).unwrap();
        assert_eq!(dec.socket_addr(), addr);
    }

    #[test]
    fn rejects_bad_family() {
        let err = UdpAddr::decode(&[9, 0, 0]).unwrap_err();
        assert!(matches!(err, UdpAddrError::BadFamily(9)));
    }

    #[test]
    fn rejects_truncated_frame() {
        let err = UdpAddr::decode(&[0, 0]).unwrap_err();
        assert!(matches!(err, UdpAddrError::Truncated(2)));
    }
}
