//! Cluster networking: advertised prefixes and WireGuard keys.

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use snafu::Snafu;

/// Default network from which nodes may advertise prefixes.
pub const DEFAULT_CLUSTER_NETWORK: &str = "10.192.0.0/11";

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PrefixError {
    #[snafu(display("'{input}' is not in address/length notation"))]
    MissingLength { input: String },

    #[snafu(display("'{input}' has an invalid address"))]
    InvalidAddress { input: String },

    #[snafu(display("'{input}' has an invalid prefix length"))]
    InvalidLength { input: String },

    #[snafu(display("'{input}' is not canonical, expected '{canonical}'"))]
    NotCanonical { input: String, canonical: String },
}

/// An IP network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    addr: IpAddr,
    bits: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, bits: u8) -> Result<Self, PrefixError> {
        if bits > max_bits(&addr) {
            return InvalidLengthSnafu {
                input: format!("{addr}/{bits}"),
            }
            .fail();
        }
        Ok(Self { addr, bits })
    }

    /// A prefix covering exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            bits: max_bits(&addr),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Parse and require that no host bits are set.
    pub fn parse_canonical(input: &str) -> Result<Self, PrefixError> {
        let prefix: IpPrefix = input.parse()?;
        let canonical = prefix.network();
        if canonical != prefix {
            return NotCanonicalSnafu {
                input,
                canonical: canonical.to_string(),
            }
            .fail();
        }
        Ok(prefix)
    }

    /// The prefix with all host bits cleared.
    pub fn network(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_u32(self.bits))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_u128(self.bits))),
        };
        Self { addr, bits: self.bits }
    }

    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = mask_u32(self.bits);
                u32::from(net) & mask == u32::from(a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = mask_u128(self.bits);
                u128::from(net) & mask == u128::from(a) & mask
            }
            _ => false,
        }
    }

    /// Whether `other` lies entirely within this prefix.
    pub fn contains(&self, other: &IpPrefix) -> bool {
        other.bits >= self.bits && self.contains_addr(other.addr)
    }
}

fn max_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_u32(bits: u8) -> u32 {
    if bits == 0 { 0 } else { u32::MAX << (32 - u32::from(bits)) }
}

fn mask_u128(bits: u8) -> u128 {
    if bits == 0 { 0 } else { u128::MAX << (128 - u32::from(bits)) }
}

impl FromStr for IpPrefix {
    type Err = PrefixError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (addr, bits) = input.split_once('/').ok_or_else(|| MissingLengthSnafu { input }.build())?;
        let addr: IpAddr = addr.parse().map_err(|_| InvalidAddressSnafu { input }.build())?;
        let bits: u8 = bits.parse().map_err(|_| InvalidLengthSnafu { input }.build())?;
        if bits > max_bits(&addr) {
            return InvalidLengthSnafu { input }.fail();
        }
        Ok(Self { addr, bits })
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

/// Decode a base64 WireGuard public key.
pub fn parse_wireguard_key(key: &str) -> Option<[u8; 32]> {
    let bytes = STANDARD.decode(key).ok()?;
    <[u8; 32]>::try_from(bytes.as_slice()).ok()
}

/// Check one advertised prefix against the cluster network and the node's own address.
///
/// A prefix is allowed if it lies within `cluster_network`, or if it is the
/// single-address prefix of `external_address`.
pub fn check_prefix(prefix: &str, cluster_network: &IpPrefix, external_address: Option<IpAddr>) -> Result<(), String> {
    let parsed = IpPrefix::parse_canonical(prefix).map_err(|e| e.to_string())?;
    if cluster_network.contains(&parsed) {
        return Ok(());
    }
    if external_address.map(IpPrefix::host) == Some(parsed) {
        return Ok(());
    }
    Err(format!("prefix {prefix} must be within cluster network {cluster_network} or equal to the node's external address"))
}
