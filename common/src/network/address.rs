//! # IPv6 Address Model
//!
//! Addresses are stored as raw big-endian octets so that the derived ordering
//! matches numeric ordering and the on-disk record is the value itself.
//!
//! The discovery model looks at an address as 32 **nibbles** (4-bit segments),
//! most significant first. A [`NetworkPrefix`] pins the leading nibbles of a
//! cluster; the remaining positions are the ones the model samples.

use std::fmt;
use std::net::{AddrParseError, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Size of one address record in bytes.
pub const ADDRESS_BYTES: usize = 16;

/// Number of 4-bit segments in an address.
pub const NIBBLES: usize = ADDRESS_BYTES * 2;

/// A 128-bit IPv6 address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_BYTES]);

impl Address {
    pub const fn from_octets(octets: [u8; ADDRESS_BYTES]) -> Self {
        Self(octets)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn octets(&self) -> [u8; ADDRESS_BYTES] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    pub const fn to_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// Returns the nibble at `idx` (0 is the most significant).
    pub fn nibble(&self, idx: usize) -> u8 {
        let byte = self.0[idx / 2];
        if idx % 2 == 0 { byte >> 4 } else { byte & 0x0f }
    }

    /// Assembles an address from 32 nibbles. Values above `0xf` are masked.
    pub fn from_nibbles(nibbles: &[u8; NIBBLES]) -> Self {
        let mut octets = [0u8; ADDRESS_BYTES];
        for (i, pair) in nibbles.chunks_exact(2).enumerate() {
            octets[i] = ((pair[0] & 0x0f) << 4) | (pair[1] & 0x0f);
        }
        Self(octets)
    }

    pub fn nibbles(&self) -> [u8; NIBBLES] {
        let mut out = [0u8; NIBBLES];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.nibble(i);
        }
        out
    }

    /// The cluster this address belongs to at the given prefix length.
    pub fn prefix(&self, len: u8) -> NetworkPrefix {
        NetworkPrefix::new(*self, len)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        Ipv6Addr::from(addr.0)
    }
}

impl FromStr for Address {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<Ipv6Addr>().map(Address::from)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(*self).fmt(f)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Network mask with the top `len` bits set.
pub fn mask(len: u8) -> u128 {
    match len {
        0 => 0,
        l if l >= 128 => u128::MAX,
        l => u128::MAX << (128 - l),
    }
}

/// A fixed-length bit prefix. Every address maps to exactly one prefix per length.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkPrefix {
    bits: u128,
    len: u8,
}

impl NetworkPrefix {
    /// Lengths above 128 are clamped.
    pub fn new(addr: Address, len: u8) -> Self {
        let len = len.min(128);
        Self {
            bits: addr.to_u128() & mask(len),
            len,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// First address of the block.
    pub fn network(&self) -> Address {
        Address::from_u128(self.bits)
    }

    /// Last address of the block.
    pub fn last(&self) -> Address {
        Address::from_u128(self.bits | !mask(self.len))
    }

    pub fn contains(&self, addr: &Address) -> bool {
        addr.to_u128() & mask(self.len) == self.bits
    }

    /// Number of leading nibbles fully determined by the prefix.
    pub fn fixed_nibbles(&self) -> usize {
        self.len as usize / 4
    }
}

impl fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.len)
    }
}

impl fmt::Debug for NetworkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkPrefix({self})")
    }
}
