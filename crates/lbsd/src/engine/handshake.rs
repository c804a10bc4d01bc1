//! Coordinator side of the EAP-PSK exchange for one slot.
//!
//! Message 1 carries RAND_S and ID_S. Message 2 is checked for the echoed
//! identifier and RAND_S, the expected ID_P and a valid MAC_P; that fixes
//! RAND_P and therefore the TEK. Message 3 proves the server (MAC_S) and
//! carries the configuration parameters sealed under the TEK. Message 4 must
//! come back sealed with the next nonce and a DONE_SUCCESS result.

use lbs_core::crypto::{self, CryptoError, PskKeys, Tek};
use lbs_core::eap::{self, ConfigParam, EapCode, EapError, EapMessage, PskResult, RAND_LEN};
use lbs_core::DeviceIdentity;

pub struct ServerHandshake {
    identifier: u8,
    rand_s: [u8; RAND_LEN],
    rand_p: Option<[u8; RAND_LEN]>,
    tek: Option<Tek>,
    nonce: u32,
}

impl ServerHandshake {
    /// Start an exchange whose first request uses `identifier`.
    pub fn new(identifier: u8) -> Self {
        Self {
            identifier,
            rand_s: crypto::generate_rand(),
            rand_p: None,
            tek: None,
            nonce: rand::random(),
        }
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    pub fn message1(&self, id_s: &DeviceIdentity) -> Vec<u8> {
        eap::encode_message1(self.identifier, &self.rand_s, id_s.as_bytes())
    }

    /// Verify a message 2 from `expected`.
    pub fn accept_message2(
        &mut self,
        keys: &PskKeys,
        id_s: &DeviceIdentity,
        expected: &DeviceIdentity,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        let m2 = match eap::parse(payload)? {
            EapMessage::Message2(m) => m,
            other => return Err(HandshakeError::Unexpected(other.number())),
        };
        if m2.identifier != self.identifier {
            return Err(HandshakeError::Identifier {
                expected: self.identifier,
                got: m2.identifier,
            });
        }
        if m2.rand_s != self.rand_s {
            return Err(HandshakeError::RandMismatch);
        }
        if m2.id_p != expected.as_bytes() {
            return Err(HandshakeError::IdentityMismatch);
        }
        let mac = keys.mac_p(m2.id_p, id_s.as_bytes(), &self.rand_s, &m2.rand_p);
        if !crypto::mac_eq(&mac, &m2.mac_p) {
            return Err(HandshakeError::MacMismatch);
        }
        self.tek = Some(keys.tek(&m2.rand_p));
        self.rand_p = Some(m2.rand_p);
        Ok(())
    }

    /// Build message 3 carrying `params`. Only valid after message 2.
    pub fn message3(
        &mut self,
        keys: &PskKeys,
        id_s: &DeviceIdentity,
        params: &[ConfigParam],
    ) -> Result<Vec<u8>, HandshakeError> {
        let rand_p = self.rand_p.ok_or(HandshakeError::NoContext)?;
        let tek = self.tek.as_ref().ok_or(HandshakeError::NoContext)?;
        self.identifier = self.identifier.wrapping_add(1);

        let plain = eap::encode_protected(PskResult::DoneSuccess, params);
        let total = eap::message3_len(plain.len());
        let prefix = eap::psk_prefix(EapCode::Request, self.identifier, 2, total, &self.rand_s);
        let pchannel = tek.seal(self.nonce, &prefix, &plain)?;
        let mac_s = keys.mac_s(id_s.as_bytes(), &rand_p);
        Ok(eap::encode_message3(&prefix, &mac_s, &pchannel))
    }

    /// Verify message 4 against the message 3 just sent.
    pub fn accept_message4(&self, payload: &[u8]) -> Result<(), HandshakeError> {
        let tek = self.tek.as_ref().ok_or(HandshakeError::NoContext)?;
        let m4 = match eap::parse(payload)? {
            EapMessage::Message4(m) => m,
            other => return Err(HandshakeError::Unexpected(other.number())),
        };
        if m4.identifier != self.identifier {
            return Err(HandshakeError::Identifier {
                expected: self.identifier,
                got: m4.identifier,
            });
        }
        if m4.rand_s != self.rand_s {
            return Err(HandshakeError::RandMismatch);
        }
        let (nonce, plain) = tek.open(m4.aad, m4.pchannel)?;
        let expected = self.nonce.wrapping_add(1);
        if nonce != expected {
            return Err(HandshakeError::Nonce { expected, got: nonce });
        }
        match eap::decode_protected(&plain)?.0 {
            PskResult::DoneSuccess => Ok(()),
            other => Err(HandshakeError::Result(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unexpected EAP message {0:?}")]
    Unexpected(Option<u8>),

    #[error("EAP identifier {got}, expected {expected}")]
    Identifier { expected: u8, got: u8 },

    #[error("RAND_S not echoed")]
    RandMismatch,

    #[error("ID_P does not match the joining device")]
    IdentityMismatch,

    #[error("MAC_P verification failed")]
    MacMismatch,

    #[error("PCHANNEL nonce {got}, expected {expected}")]
    Nonce { expected: u32, got: u32 },

    #[error("device reported {0:?}")]
    Result(PskResult),

    #[error("no message 2 accepted yet")]
    NoContext,

    #[error(transparent)]
    Eap(#[from] EapError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
