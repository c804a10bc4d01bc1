//! EAP-PSK messages carried as the LBP handshake payload.
//!
//! The coordinator is the EAP server. It sends message 1 and 3 inside
//! CHALLENGE frames; the device answers with 2 and 4 inside JOINING frames.
//!
//!   EAP header   code(1) identifier(1) length(2, BE)
//!   PSK header   type(1) = 47, flags(1) — bits 7-6 are the message number
//!   msg1 body    RAND_S(16) ID_S
//!   msg2 body    RAND_S(16) RAND_P(16) MAC_P(16) ID_P
//!   msg3 body    RAND_S(16) MAC_S(16) PCHANNEL
//!   msg4 body    RAND_S(16) PCHANNEL
//!
//! PCHANNEL is `nonce(4, BE) tag(16) ciphertext`. Its plaintext starts with a
//! result byte and, when the extension bit is set, an extension type byte and
//! the configuration parameters the device needs (short address, group key).
//!
//! Success and Failure are bare 4-byte EAP headers.

use crate::device::ShortAddress;

// ── Constants ─────────────────────────────────────────────────────────────────

pub const EAP_TYPE_PSK: u8 = 47;

pub const RAND_LEN: usize = 16;
pub const MAC_LEN: usize = 16;
pub const KEY_LEN: usize = 16;

/// EAP header length.
pub const EAP_HEADER_LEN: usize = 4;
/// EAP header + type + flags + RAND_S. Also the PCHANNEL associated data.
pub const AAD_LEN: usize = EAP_HEADER_LEN + 2 + RAND_LEN;

pub const PCHANNEL_NONCE_LEN: usize = 4;
pub const PCHANNEL_TAG_LEN: usize = 16;
pub const PCHANNEL_OVERHEAD: usize = PCHANNEL_NONCE_LEN + PCHANNEL_TAG_LEN;

/// Extension type for configuration parameters inside PCHANNEL.
pub const EXT_TYPE_CONFIG: u8 = 0x02;

const RESULT_SHIFT: u8 = 6;
const EXTENSION_BIT: u8 = 0x20;

// Configuration parameter attribute ids.
pub const ATTR_SHORT_ADDRESS: u8 = 0x1D;
pub const ATTR_GMK: u8 = 0x27;
pub const ATTR_GMK_ACTIVATION: u8 = 0x2B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl TryFrom<u8> for EapCode {
    type Error = EapError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EapCode::Request),
            2 => Ok(EapCode::Response),
            3 => Ok(EapCode::Success),
            4 => Ok(EapCode::Failure),
            other => Err(EapError::UnknownCode(other)),
        }
    }
}

/// Result indication inside the protected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PskResult {
    Continue = 1,
    DoneSuccess = 2,
    DoneFailure = 3,
}

impl TryFrom<u8> for PskResult {
    type Error = EapError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PskResult::Continue),
            2 => Ok(PskResult::DoneSuccess),
            3 => Ok(PskResult::DoneFailure),
            other => Err(EapError::BadResult(other)),
        }
    }
}

// ── Parsed messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message1<'a> {
    pub identifier: u8,
    pub rand_s: [u8; RAND_LEN],
    pub id_s: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message2<'a> {
    pub identifier: u8,
    pub rand_s: [u8; RAND_LEN],
    pub rand_p: [u8; RAND_LEN],
    pub mac_p: [u8; MAC_LEN],
    pub id_p: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message3<'a> {
    pub identifier: u8,
    pub rand_s: [u8; RAND_LEN],
    pub mac_s: [u8; MAC_LEN],
    /// First `AAD_LEN` bytes of the raw message.
    pub aad: &'a [u8],
    pub pchannel: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message4<'a> {
    pub identifier: u8,
    pub rand_s: [u8; RAND_LEN],
    pub aad: &'a [u8],
    pub pchannel: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapMessage<'a> {
    Message1(Message1<'a>),
    Message2(Message2<'a>),
    Message3(Message3<'a>),
    Message4(Message4<'a>),
    Success { identifier: u8 },
    Failure { identifier: u8 },
}

impl EapMessage<'_> {
    /// EAP-PSK message number (0..=3), None for Success/Failure.
    pub fn number(&self) -> Option<u8> {
        match self {
            EapMessage::Message1(_) => Some(0),
            EapMessage::Message2(_) => Some(1),
            EapMessage::Message3(_) => Some(2),
            EapMessage::Message4(_) => Some(3),
            _ => None,
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn rand_at(buf: &[u8], at: usize) -> [u8; RAND_LEN] {
    let mut out = [0u8; RAND_LEN];
    out.copy_from_slice(&buf[at..at + RAND_LEN]);
    out
}

/// Parse one EAP message. Never panics on arbitrary input.
pub fn parse(buf: &[u8]) -> Result<EapMessage<'_>, EapError> {
    if buf.len() < EAP_HEADER_LEN {
        return Err(EapError::Truncated(buf.len()));
    }
    let code = EapCode::try_from(buf[0])?;
    let identifier = buf[1];
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length != buf.len() {
        return Err(EapError::LengthMismatch {
            declared: length,
            actual: buf.len(),
        });
    }

    match code {
        EapCode::Success | EapCode::Failure => {
            if length != EAP_HEADER_LEN {
                return Err(EapError::LengthMismatch {
                    declared: length,
                    actual: EAP_HEADER_LEN,
                });
            }
            return Ok(if code == EapCode::Success {
                EapMessage::Success { identifier }
            } else {
                EapMessage::Failure { identifier }
            });
        }
        EapCode::Request | EapCode::Response => {}
    }

    if buf.len() < AAD_LEN {
        return Err(EapError::Truncated(buf.len()));
    }
    if buf[4] != EAP_TYPE_PSK {
        return Err(EapError::UnsupportedType(buf[4]));
    }
    let number = buf[5] >> RESULT_SHIFT;
    let expected_code = if number % 2 == 0 {
        EapCode::Request
    } else {
        EapCode::Response
    };
    if code != expected_code {
        return Err(EapError::UnexpectedCode { number, code: buf[0] });
    }

    let rand_s = rand_at(buf, 6);
    let body = &buf[AAD_LEN..];
    match number {
        0 => Ok(EapMessage::Message1(Message1 {
            identifier,
            rand_s,
            id_s: body,
        })),
        1 => {
            if body.len() < RAND_LEN + MAC_LEN {
                return Err(EapError::Truncated(buf.len()));
            }
            Ok(EapMessage::Message2(Message2 {
                identifier,
                rand_s,
                rand_p: rand_at(body, 0),
                mac_p: rand_at(body, RAND_LEN),
                id_p: &body[RAND_LEN + MAC_LEN..],
            }))
        }
        2 => {
            if body.len() < MAC_LEN + PCHANNEL_OVERHEAD + 1 {
                return Err(EapError::Truncated(buf.len()));
            }
            Ok(EapMessage::Message3(Message3 {
                identifier,
                rand_s,
                mac_s: rand_at(body, 0),
                aad: &buf[..AAD_LEN],
                pchannel: &body[MAC_LEN..],
            }))
        }
        _ => {
            if body.len() < PCHANNEL_OVERHEAD + 1 {
                return Err(EapError::Truncated(buf.len()));
            }
            Ok(EapMessage::Message4(Message4 {
                identifier,
                rand_s,
                aad: &buf[..AAD_LEN],
                pchannel: body,
            }))
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Write the 22-byte prefix shared by every EAP-PSK message.
///
/// `total_len` is the full message length; it is part of the associated data
/// of the protected channel, so it must be known before sealing.
pub fn psk_prefix(
    code: EapCode,
    identifier: u8,
    number: u8,
    total_len: usize,
    rand_s: &[u8; RAND_LEN],
) -> [u8; AAD_LEN] {
    let mut out = [0u8; AAD_LEN];
    out[0] = code as u8;
    out[1] = identifier;
    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[4] = EAP_TYPE_PSK;
    out[5] = number << RESULT_SHIFT;
    out[6..].copy_from_slice(rand_s);
    out
}

pub fn encode_message1(identifier: u8, rand_s: &[u8; RAND_LEN], id_s: &[u8]) -> Vec<u8> {
    let total = AAD_LEN + id_s.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&psk_prefix(EapCode::Request, identifier, 0, total, rand_s));
    out.extend_from_slice(id_s);
    out
}

pub fn encode_message2(
    identifier: u8,
    rand_s: &[u8; RAND_LEN],
    rand_p: &[u8; RAND_LEN],
    mac_p: &[u8; MAC_LEN],
    id_p: &[u8],
) -> Vec<u8> {
    let total = AAD_LEN + RAND_LEN + MAC_LEN + id_p.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&psk_prefix(EapCode::Response, identifier, 1, total, rand_s));
    out.extend_from_slice(rand_p);
    out.extend_from_slice(mac_p);
    out.extend_from_slice(id_p);
    out
}

/// Total length of message 3 for a protected plaintext of `plaintext_len`.
pub fn message3_len(plaintext_len: usize) -> usize {
    AAD_LEN + MAC_LEN + PCHANNEL_OVERHEAD + plaintext_len
}

/// Total length of message 4 for a protected plaintext of `plaintext_len`.
pub fn message4_len(plaintext_len: usize) -> usize {
    AAD_LEN + PCHANNEL_OVERHEAD + plaintext_len
}

/// Assemble message 3 from its prefix (see `psk_prefix`), MAC_S and the
/// already sealed PCHANNEL.
pub fn encode_message3(prefix: &[u8; AAD_LEN], mac_s: &[u8; MAC_LEN], pchannel: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AAD_LEN + MAC_LEN + pchannel.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(mac_s);
    out.extend_from_slice(pchannel);
    out
}

pub fn encode_message4(prefix: &[u8; AAD_LEN], pchannel: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AAD_LEN + pchannel.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(pchannel);
    out
}

pub fn encode_success(identifier: u8) -> [u8; EAP_HEADER_LEN] {
    [EapCode::Success as u8, identifier, 0, EAP_HEADER_LEN as u8]
}

pub fn encode_failure(identifier: u8) -> [u8; EAP_HEADER_LEN] {
    [EapCode::Failure as u8, identifier, 0, EAP_HEADER_LEN as u8]
}

// ── Protected data ────────────────────────────────────────────────────────────

/// Plaintext of the protected channel: result byte plus optional parameters.
pub fn encode_protected(result: PskResult, params: &[ConfigParam]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut flags = (result as u8) << RESULT_SHIFT;
    if !params.is_empty() {
        flags |= EXTENSION_BIT;
    }
    out.push(flags);
    if !params.is_empty() {
        out.push(EXT_TYPE_CONFIG);
        encode_params(params, &mut out);
    }
    out
}

pub fn decode_protected(buf: &[u8]) -> Result<(PskResult, Vec<ConfigParam>), EapError> {
    let (&flags, rest) = buf.split_first().ok_or(EapError::Truncated(0))?;
    let result = PskResult::try_from(flags >> RESULT_SHIFT)?;
    if flags & EXTENSION_BIT == 0 {
        return Ok((result, Vec::new()));
    }
    let (&ext_type, params) = rest.split_first().ok_or(EapError::Truncated(buf.len()))?;
    if ext_type != EXT_TYPE_CONFIG {
        return Err(EapError::UnknownExtension(ext_type));
    }
    Ok((result, decode_params(params)?))
}

// ── Configuration parameters ──────────────────────────────────────────────────

/// Network configuration handed to a device during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigParam {
    ShortAddress(ShortAddress),
    Gmk { index: u8, key: [u8; KEY_LEN] },
    GmkActivation { index: u8 },
}

pub fn encode_params(params: &[ConfigParam], out: &mut Vec<u8>) {
    for p in params {
        match p {
            ConfigParam::ShortAddress(addr) => {
                out.extend_from_slice(&[ATTR_SHORT_ADDRESS, 2]);
                out.extend_from_slice(&addr.to_be_bytes());
            }
            ConfigParam::Gmk { index, key } => {
                out.extend_from_slice(&[ATTR_GMK, 1 + KEY_LEN as u8, *index]);
                out.extend_from_slice(key);
            }
            ConfigParam::GmkActivation { index } => {
                out.extend_from_slice(&[ATTR_GMK_ACTIVATION, 1, *index]);
            }
        }
    }
}

/// Decode a TLV run. Unknown attributes are skipped.
pub fn decode_params(mut buf: &[u8]) -> Result<Vec<ConfigParam>, EapError> {
    let mut params = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(EapError::BadParameter(buf[0]));
        }
        let (attr, len) = (buf[0], buf[1] as usize);
        let value = buf.get(2..2 + len).ok_or(EapError::BadParameter(attr))?;
        match attr {
            ATTR_SHORT_ADDRESS => {
                let v: [u8; 2] = value.try_into().map_err(|_| EapError::BadParameter(attr))?;
                params.push(ConfigParam::ShortAddress(ShortAddress(u16::from_be_bytes(v))));
            }
            ATTR_GMK => {
                if value.len() != 1 + KEY_LEN {
                    return Err(EapError::BadParameter(attr));
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&value[1..]);
                params.push(ConfigParam::Gmk {
                    index: value[0],
                    key,
                });
            }
            ATTR_GMK_ACTIVATION => {
                if value.len() != 1 {
                    return Err(EapError::BadParameter(attr));
                }
                params.push(ConfigParam::GmkActivation { index: value[0] });
            }
            _ => {}
        }
        buf = &buf[2 + len..];
    }
    Ok(params)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EapError {
    #[error("EAP message truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unknown EAP code {0}")]
    UnknownCode(u8),

    #[error("EAP length field {declared} does not match {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unsupported EAP method type {0}")]
    UnsupportedType(u8),

    #[error("EAP-PSK message {number} carried with code {code}")]
    UnexpectedCode { number: u8, code: u8 },

    #[error("invalid PCHANNEL result value {0}")]
    BadResult(u8),

    #[error("unknown PCHANNEL extension type 0x{0:02x}")]
    UnknownExtension(u8),

    #[error("malformed configuration parameter 0x{0:02x}")]
    BadParameter(u8),
}
