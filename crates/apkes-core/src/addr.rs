//! Link-layer addressing.
//!
//! Peers are identified by an EUI-64-style extended address; after the
//! handshake each side also knows the peer's two-byte short address and a
//! pair of one-byte table indices for compact on-wire references.

use std::fmt;

/// Length of an extended address in bytes
pub const EXTENDED_ADDR_LEN: usize = 8;

/// Length of a short address in bytes
pub const SHORT_ADDR_LEN: usize = 2;

/// EUI-64-style extended link-layer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExtendedAddr([u8; EXTENDED_ADDR_LEN]);

impl ExtendedAddr {
    /// Wrap raw address bytes
    #[must_use]
    pub fn new(bytes: [u8; EXTENDED_ADDR_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw address bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; EXTENDED_ADDR_LEN] {
        &self.0
    }
}

impl From<[u8; EXTENDED_ADDR_LEN]> for ExtendedAddr {
    fn from(bytes: [u8; EXTENDED_ADDR_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ExtendedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ExtendedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedAddr({})", hex::encode(self.0))
    }
}

/// Two-byte short address used on the wire after the handshake
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShortAddr(u16);

impl ShortAddr {
    /// Wrap a raw short address
    #[must_use]
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// The raw short address value
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Little-endian wire encoding
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; SHORT_ADDR_LEN] {
        self.0.to_le_bytes()
    }

    /// Decode from little-endian wire bytes
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; SHORT_ADDR_LEN]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }
}

impl fmt::Display for ShortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Debug for ShortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortAddr({:#06x})", self.0)
    }
}

/// The identity pair stored per neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborIds {
    /// Unique peer identifier, used for table lookup
    pub extended_addr: ExtendedAddr,
    /// Compact handle used on the wire after the handshake
    pub short_addr: ShortAddr,
}

impl NeighborIds {
    /// Build an identity pair
    #[must_use]
    pub fn new(extended_addr: ExtendedAddr, short_addr: ShortAddr) -> Self {
        Self {
            extended_addr,
            short_addr,
        }
    }
}
