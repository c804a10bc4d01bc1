//! LBP wire format — the bootstrapping frames exchanged with joining devices.
//!
//! Every frame starts with a fixed 10-byte header followed by an opaque
//! handshake payload (an EAP message, see `eap`):
//!
//!   byte 0     bits 7-4 message type, bit 3 media type, bit 2 disable
//!              backup medium, bits 1-0 reserved (zero)
//!   byte 1     transaction id
//!   bytes 2-9  device identity the frame is about
//!   bytes 10.. handshake payload
//!
//! The high bit of the message type is the direction bit: codes below 0x8
//! travel device → coordinator, codes from 0x8 up travel coordinator → device.
//! JOINING and the device's own KICK are only meaningful inbound, so the
//! decoder takes the expected direction and returns an explicit tag.
//!
//! Pure functions, no shared state. There is no unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::device::DeviceIdentity;

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed LBP header. Wire size: 10 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LbpHeader {
    /// Message type in the high nibble, media flags in the low nibble.
    pub control: u8,
    /// Transaction id. Always zero in this engine's usage.
    pub transaction_id: u8,
    /// Target (or originating) device identity.
    pub identity: [u8; 8],
}

assert_eq_size!(LbpHeader, [u8; 10]);

/// Header length in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest frame the engine builds. Handshake messages are far below this.
pub const MAX_FRAME_LEN: usize = 1280;

const DIRECTION_BIT: u8 = 0x8;
const MEDIA_TYPE_BIT: u8 = 0x08;
const DISABLE_BACKUP_BIT: u8 = 0x04;
const RESERVED_BITS: u8 = 0x03;

// ── Message types ─────────────────────────────────────────────────────────────

/// Which way a frame travels relative to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device (or its relay) → coordinator.
    FromDevice,
    /// Coordinator → device.
    ToDevice,
}

/// LBP message types, already disambiguated by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Join request or handshake response from a device.
    Joining = 0x0,
    /// Device announces it is leaving the network.
    KickFromDevice = 0x4,
    /// Successful end of a join (or a rekey activation notice).
    Accepted = 0x9,
    /// Handshake request to a device.
    Challenge = 0xA,
    /// Join refused.
    Decline = 0xB,
    /// Coordinator evicts a device.
    KickToDevice = 0xC,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn direction(self) -> Direction {
        if self.code() & DIRECTION_BIT != 0 {
            Direction::ToDevice
        } else {
            Direction::FromDevice
        }
    }

    /// Resolve a type code seen on the wire in the given direction.
    pub fn from_code(code: u8, direction: Direction) -> Result<Self, LbpError> {
        let kind = match code {
            0x0 => MessageType::Joining,
            0x4 => MessageType::KickFromDevice,
            0x9 => MessageType::Accepted,
            0xA => MessageType::Challenge,
            0xB => MessageType::Decline,
            0xC => MessageType::KickToDevice,
            other => return Err(LbpError::UnknownType(other)),
        };
        if kind.direction() != direction {
            return Err(LbpError::WrongDirection(code));
        }
        Ok(kind)
    }
}

/// Media flags, carried in the low nibble when the hybrid profile is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LbpFlags {
    /// Frame was received on (or is to be sent over) the secondary medium.
    pub media_type: bool,
    /// The device must not fall back to the backup medium.
    pub disable_backup_medium: bool,
}

impl LbpFlags {
    pub const NONE: LbpFlags = LbpFlags {
        media_type: false,
        disable_backup_medium: false,
    };

    fn bits(self) -> u8 {
        let mut b = 0;
        if self.media_type {
            b |= MEDIA_TYPE_BIT;
        }
        if self.disable_backup_medium {
            b |= DISABLE_BACKUP_BIT;
        }
        b
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            media_type: bits & MEDIA_TYPE_BIT != 0,
            disable_backup_medium: bits & DISABLE_BACKUP_BIT != 0,
        }
    }
}

// ── Decoded frame ─────────────────────────────────────────────────────────────

/// A decoded LBP frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbpFrame<'a> {
    pub message_type: MessageType,
    pub flags: LbpFlags,
    pub transaction_id: u8,
    pub identity: DeviceIdentity,
    pub payload: &'a [u8],
}

/// Decode a frame travelling in `direction`.
pub fn decode(buf: &[u8], direction: Direction) -> Result<LbpFrame<'_>, LbpError> {
    let header = LbpHeader::read_from_prefix(buf).ok_or(LbpError::TooShort(buf.len()))?;
    let control = header.control;
    if control & RESERVED_BITS != 0 {
        return Err(LbpError::ReservedBitsSet(control));
    }
    let message_type = MessageType::from_code(control >> 4, direction)?;
    Ok(LbpFrame {
        message_type,
        flags: LbpFlags::from_bits(control & 0x0F),
        transaction_id: header.transaction_id,
        identity: DeviceIdentity(header.identity),
        payload: &buf[HEADER_LEN..],
    })
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a frame of any type into `out`. Returns the encoded length.
pub fn encode(
    message_type: MessageType,
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, LbpError> {
    let len = HEADER_LEN + payload.len();
    if out.len() < len {
        return Err(LbpError::BufferTooSmall {
            needed: len,
            available: out.len(),
        });
    }
    write_header(message_type, identity, flags, &mut out[..HEADER_LEN]);
    out[HEADER_LEN..len].copy_from_slice(payload);
    Ok(len)
}

fn write_header(
    message_type: MessageType,
    identity: &DeviceIdentity,
    flags: LbpFlags,
    out: &mut [u8],
) {
    let header = LbpHeader {
        control: (message_type.code() << 4) | flags.bits(),
        transaction_id: 0,
        identity: identity.0,
    };
    out.copy_from_slice(header.as_bytes());
}

pub fn encode_joining(
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, LbpError> {
    encode(MessageType::Joining, identity, flags, payload, out)
}

pub fn encode_challenge(
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, LbpError> {
    encode(MessageType::Challenge, identity, flags, payload, out)
}

pub fn encode_accepted(
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, LbpError> {
    encode(MessageType::Accepted, identity, flags, payload, out)
}

pub fn encode_decline(
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, LbpError> {
    encode(MessageType::Decline, identity, flags, payload, out)
}

/// Encode a payload-less KICK. `direction` picks the device's or the
/// coordinator's variant.
pub fn encode_kick(
    identity: &DeviceIdentity,
    direction: Direction,
    out: &mut [u8],
) -> Result<usize, LbpError> {
    let kind = match direction {
        Direction::FromDevice => MessageType::KickFromDevice,
        Direction::ToDevice => MessageType::KickToDevice,
    };
    encode(kind, identity, LbpFlags::NONE, &[], out)
}

/// Encode into a freshly allocated buffer.
pub fn frame(
    message_type: MessageType,
    identity: &DeviceIdentity,
    flags: LbpFlags,
    payload: &[u8],
) -> Bytes {
    let mut out = vec![0u8; HEADER_LEN + payload.len()];
    write_header(message_type, identity, flags, &mut out[..HEADER_LEN]);
    out[HEADER_LEN..].copy_from_slice(payload);
    Bytes::from(out)
}

// ── Classification ────────────────────────────────────────────────────────────

fn outbound_type(buf: &[u8]) -> Option<MessageType> {
    decode(buf, Direction::ToDevice).ok().map(|f| f.message_type)
}

pub fn is_decline(buf: &[u8]) -> bool {
    outbound_type(buf) == Some(MessageType::Decline)
}

pub fn is_challenge(buf: &[u8]) -> bool {
    outbound_type(buf) == Some(MessageType::Challenge)
}

pub fn is_accepted(buf: &[u8]) -> bool {
    outbound_type(buf) == Some(MessageType::Accepted)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LbpError {
    #[error("frame of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),

    #[error("unknown LBP message type 0x{0:x}")]
    UnknownType(u8),

    #[error("LBP message type 0x{0:x} not valid in this direction")]
    WrongDirection(u8),

    #[error("reserved control bits set: 0x{0:02x}")]
    ReservedBitsSet(u8),

    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
