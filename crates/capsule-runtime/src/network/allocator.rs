//! IPv4 subnets and per-network address allocation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use capsule_common::error::{CapsuleError, Result};

/// Smallest prefix length accepted; bounds the allocator at 65536 bits.
pub const MIN_PREFIX: u8 = 16;
/// Largest prefix length that still leaves a usable host address.
pub const MAX_PREFIX: u8 = 30;

/// An IPv4 subnet in CIDR notation, normalized to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Returns the network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Returns the prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block, including network and broadcast.
    #[must_use]
    pub const fn size(&self) -> u32 {
        1 << (32 - self.prefix)
    }

    /// Returns the broadcast address.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | (self.size() - 1))
    }

    /// Returns the offset of `addr` within the block, if it belongs to it.
    #[must_use]
    pub fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        u32::from(addr)
            .checked_sub(u32::from(self.network))
            .filter(|offset| *offset < self.size())
    }

    /// Returns the address at `offset` within the block.
    #[must_use]
    pub fn address_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + offset)
    }
}

impl FromStr for Subnet {
    type Err = CapsuleError;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |why: &str| CapsuleError::Config {
            message: format!("invalid subnet {spec:?}: {why}"),
        };
        let (addr, prefix) = spec.split_once('/').ok_or_else(|| invalid("expected a.b.c.d/n"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
            return Err(invalid(&format!(
                "prefix must be between /{MIN_PREFIX} and /{MAX_PREFIX}"
            )));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }
}

impl TryFrom<String> for Subnet {
    type Error = CapsuleError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Bitset of assigned host offsets within a subnet.
///
/// Offset 0 (the network address) and the last offset (broadcast) are never
/// handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocator {
    size: u32,
    bits: Vec<u64>,
}

impl IpAllocator {
    /// Creates an empty allocator for `subnet`.
    #[must_use]
    pub fn new(subnet: &Subnet) -> Self {
        let size = subnet.size();
        Self {
            size,
            bits: vec![0; size.div_ceil(64) as usize],
        }
    }

    fn is_set(&self, offset: u32) -> bool {
        self.bits[(offset / 64) as usize] & (1 << (offset % 64)) != 0
    }

    fn set(&mut self, offset: u32, value: bool) {
        let word = &mut self.bits[(offset / 64) as usize];
        if value {
            *word |= 1 << (offset % 64);
        } else {
            *word &= !(1 << (offset % 64));
        }
    }

    fn is_host(&self, offset: u32) -> bool {
        offset > 0 && offset < self.size - 1
    }

    /// Takes the lowest free host offset.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ResourceSetup`] if every host address is taken.
    pub fn allocate(&mut self) -> Result<u32> {
        let offset = (1..self.size - 1)
            .find(|offset| !self.is_set(*offset))
            .ok_or_else(|| CapsuleError::setup("ip allocation", "subnet exhausted"))?;
        self.set(offset, true);
        Ok(offset)
    }

    /// Marks a specific host offset as taken, such as the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if the offset is not a host offset
    /// or is already taken.
    pub fn reserve(&mut self, offset: u32) -> Result<()> {
        if !self.is_host(offset) {
            return Err(CapsuleError::Config {
                message: format!("offset {offset} is not a host address"),
            });
        }
        if self.is_set(offset) {
            return Err(CapsuleError::Config {
                message: format!("offset {offset} is already assigned"),
            });
        }
        self.set(offset, true);
        Ok(())
    }

    /// Returns a host offset to the pool. Releasing a free offset is a no-op.
    pub fn release(&mut self, offset: u32) {
        if self.is_host(offset) {
            self.set(offset, false);
        }
    }

    /// Returns the number of assigned offsets.
    #[must_use]
    pub fn assigned(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}
