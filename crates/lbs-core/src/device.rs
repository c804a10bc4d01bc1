//! Device addressing — permanent identities, short addresses, link addresses.

use std::fmt;
use std::str::FromStr;

/// Permanent 8-byte device identity (EUI-64).
///
/// Primary key for every table in the bootstrap server. All-zero is the
/// "no identity" marker used by empty registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceIdentity(pub [u8; 8]);

impl DeviceIdentity {
    pub const NONE: DeviceIdentity = DeviceIdentity([0u8; 8]);

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Low 16 bits, big-endian — the last two bytes of the EUI-64.
    pub fn low_u16(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 8]> for DeviceIdentity {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for DeviceIdentity {
    type Error = IdentityParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 8] = value
            .try_into()
            .map_err(|_| IdentityParseError::Length(value.len()))?;
        Ok(Self(bytes))
    }
}

impl FromStr for DeviceIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityParseError::NotHex)?;
        Self::try_from(bytes.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("device identity must be 8 bytes, got {0}")]
    Length(usize),
    #[error("device identity is not valid hex")]
    NotHex,
}

/// 16-bit network address handed out on a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShortAddress(pub u16);

impl ShortAddress {
    /// Reserved sentinel — no address assigned.
    pub const UNASSIGNED: ShortAddress = ShortAddress(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for ShortAddress {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// Link-layer address of the neighbour a frame came from or goes to.
///
/// A joining device that is a direct neighbour of the coordinator has no
/// short address yet and is reached by its extended address. Devices further
/// away are reached through an already-joined relay, addressed by short
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkAddress {
    Short(ShortAddress),
    Extended(DeviceIdentity),
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkAddress::Short(s) => write!(f, "short:{s}"),
            LinkAddress::Extended(id) => write!(f, "ext:{id}"),
        }
    }
}
