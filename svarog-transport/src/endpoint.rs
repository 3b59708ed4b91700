//! Endpoints and raw peer addresses
//!
//! Accept hands back the peer address in the transport's native,
//! sockaddr-shaped form ([`RawAddr`]: family tag, address bytes, port). The
//! acceptor decodes that into an [`Endpoint`] at accept time, for both
//! address families.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family of a raw peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// Native form of a peer address as reported by the transport at accept time.
///
/// For `V4` only the first four bytes of `addr` are meaningful; for `V6` all
/// sixteen are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddr {
    pub family: AddrFamily,
    pub addr: [u8; 16],
    pub port: u16,
}

impl RawAddr {
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        let mut addr = [0u8; 16];
        match endpoint.addr {
            IpAddr::V4(v4) => {
                addr[..4].copy_from_slice(&v4.octets());
                RawAddr {
                    family: AddrFamily::V4,
                    addr,
                    port: endpoint.port,
                }
            }
            IpAddr::V6(v6) => {
                addr.copy_from_slice(&v6.octets());
                RawAddr {
                    family: AddrFamily::V6,
                    addr,
                    port: endpoint.port,
                }
            }
        }
    }
}

/// A transport-level address: v4 or v6 numeric address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Endpoint { addr, port }
    }

    pub fn v4(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint::new(IpAddr::V4(addr), port)
    }

    pub fn v6(addr: Ipv6Addr, port: u16) -> Self {
        Endpoint::new(IpAddr::V6(addr), port)
    }

    /// Decode a native peer address per its family tag.
    pub fn from_raw(raw: &RawAddr) -> Self {
        match raw.family {
            AddrFamily::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&raw.addr[..4]);
                Endpoint::v4(Ipv4Addr::from(octets), raw.port)
            }
            AddrFamily::V6 => Endpoint::v6(Ipv6Addr::from(raw.addr), raw.port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}
