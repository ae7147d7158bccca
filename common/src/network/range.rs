//! # IPv6 Range Model
//!
//! Inclusive ranges of IPv6 addresses, used by the blacklist to describe
//! excluded blocks such as `2001:db8::/32` or `2001:db8::1-2001:db8::ff`.

use std::net::Ipv6Addr;
use std::str::FromStr;

use anyhow;
use pnet::ipnetwork::Ipv6Network;

use super::address::{Address, NetworkPrefix};

/// Represents a continuous range of IPv6 addresses, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn single(addr: Address) -> Self {
        Self::new(addr, addr)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.start <= *addr && *addr <= self.end
    }

    /// True when `other` overlaps this range or starts right after it.
    /// `other` must not start before `self`.
    pub fn touches(&self, other: &AddressRange) -> bool {
        other.start <= self.end || self.end.to_u128().checked_add(1) == Some(other.start.to_u128())
    }
}

impl From<NetworkPrefix> for AddressRange {
    fn from(prefix: NetworkPrefix) -> Self {
        Self::new(prefix.network(), prefix.last())
    }
}

/// Creates a range from an address and a CIDR prefix (e.g., 2001:db8::/32).
///
/// Returns the range covering the entire network block.
pub fn cidr_range(ip: Ipv6Addr, prefix: u8) -> anyhow::Result<AddressRange> {
    if prefix > 128 {
        anyhow::bail!("Invalid prefix: {prefix} > 128");
    }
    let network = Ipv6Network::new(ip, prefix)?;
    let block = Address::from(network.network()).prefix(network.prefix());
    Ok(AddressRange::from(block))
}

impl FromStr for AddressRange {
    type Err = anyhow::Error;

    /// Supported formats:
    /// * **Host**: `2001:db8::1`
    /// * **CIDR**: `2001:db8::/32`
    /// * **Range**: `2001:db8::1-2001:db8::ff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let ip = ip_str
                .parse::<Ipv6Addr>()
                .map_err(|e| anyhow::anyhow!("Invalid network address '{ip_str}': {e}"))?;
            let prefix = prefix_str
                .parse::<u8>()
                .map_err(|e| anyhow::anyhow!("Invalid prefix '{prefix_str}': {e}"))?;
            return cidr_range(ip, prefix);
        }

        if let Some((start_str, end_str)) = s.split_once('-') {
            let start: Address = start_str
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid start IP in range '{start_str}': {e}"))?;
            let end: Address = end_str
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid end IP in range '{end_str}': {e}"))?;
            if start > end {
                anyhow::bail!("Range start {start} is after end {end}");
            }
            return Ok(AddressRange::new(start, end));
        }

        let addr: Address = s
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid address: {s}: {e}"))?;
        Ok(AddressRange::single(addr))
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
