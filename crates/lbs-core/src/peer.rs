//! Device side of the EAP-PSK exchange.
//!
//! The coordinator never runs this. It exists so device simulators and
//! tests can answer CHALLENGE frames exactly as a real node would: message 1
//! is answered with message 2, message 3 is verified and opened and answered
//! with message 4.

use crate::crypto::{self, CryptoError, Psk, PskKeys, Tek};
use crate::device::DeviceIdentity;
use crate::eap::{self, ConfigParam, EapCode, EapError, EapMessage, PskResult, RAND_LEN};

/// One device's view of an in-progress handshake.
pub struct PeerHandshake {
    keys: PskKeys,
    identity: DeviceIdentity,
    rand_p: [u8; RAND_LEN],
    rand_s: Option<[u8; RAND_LEN]>,
    id_s: Vec<u8>,
    tek: Option<Tek>,
}

impl PeerHandshake {
    pub fn new(psk: &Psk, identity: DeviceIdentity) -> Self {
        Self {
            keys: PskKeys::derive(psk),
            identity,
            rand_p: crypto::generate_rand(),
            rand_s: None,
            id_s: Vec::new(),
            tek: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Answer message 1 with message 2.
    pub fn answer_message1(&mut self, payload: &[u8]) -> Result<Vec<u8>, PeerError> {
        let m1 = match eap::parse(payload)? {
            EapMessage::Message1(m) => m,
            other => return Err(PeerError::Unexpected(other.number())),
        };
        self.rand_p = crypto::generate_rand();
        self.rand_s = Some(m1.rand_s);
        self.id_s = m1.id_s.to_vec();
        self.tek = Some(self.keys.tek(&self.rand_p));

        let mac_p = self
            .keys
            .mac_p(self.identity.as_bytes(), &self.id_s, &m1.rand_s, &self.rand_p);
        Ok(eap::encode_message2(
            m1.identifier,
            &m1.rand_s,
            &self.rand_p,
            &mac_p,
            self.identity.as_bytes(),
        ))
    }

    /// Verify and open message 3, answer with message 4.
    ///
    /// Returns the configuration parameters the coordinator sent.
    pub fn answer_message3(
        &mut self,
        payload: &[u8],
    ) -> Result<(Vec<ConfigParam>, Vec<u8>), PeerError> {
        let m3 = match eap::parse(payload)? {
            EapMessage::Message3(m) => m,
            other => return Err(PeerError::Unexpected(other.number())),
        };
        let rand_s = self.rand_s.ok_or(PeerError::Unexpected(Some(2)))?;
        if m3.rand_s != rand_s {
            return Err(PeerError::RandMismatch);
        }
        let expected = self.keys.mac_s(&self.id_s, &self.rand_p);
        if !crypto::mac_eq(&expected, &m3.mac_s) {
            return Err(PeerError::ServerMac);
        }
        let tek = self.tek.as_ref().ok_or(PeerError::Unexpected(Some(2)))?;
        let (counter, plain) = tek.open(m3.aad, m3.pchannel)?;
        let (_, params) = eap::decode_protected(&plain)?;

        let reply = eap::encode_protected(PskResult::DoneSuccess, &[]);
        let total = eap::message4_len(reply.len());
        let prefix = eap::psk_prefix(EapCode::Response, m3.identifier, 3, total, &rand_s);
        let pchannel = tek.seal(counter.wrapping_add(1), &prefix, &reply)?;
        Ok((params, eap::encode_message4(&prefix, &pchannel)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("unexpected EAP message {0:?}")]
    Unexpected(Option<u8>),

    #[error("RAND_S does not match message 1")]
    RandMismatch,

    #[error("server MAC verification failed")]
    ServerMac,

    #[error(transparent)]
    Eap(#[from] EapError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
