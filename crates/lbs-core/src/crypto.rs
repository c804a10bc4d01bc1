//! Cryptographic primitives for the bootstrap handshake.
//!
//! Provides three things:
//!   1. Key derivation — AK and KDK from the pre-shared key, TEK per exchange
//!   2. MAC_P / MAC_S — keyed BLAKE3, truncated to 16 bytes
//!   3. PCHANNEL — ChaCha20-Poly1305 over the configuration parameters
//!
//! The handshake engine decides when these are called; nothing here keeps
//! state between calls.
//!
//! All key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::eap::{KEY_LEN, MAC_LEN, PCHANNEL_NONCE_LEN, PCHANNEL_OVERHEAD, RAND_LEN};

const AK_CONTEXT: &str = "lbs eap-psk authentication key v1";
const KDK_CONTEXT: &str = "lbs eap-psk key derivation key v1";
const TEK_LABEL: &[u8] = b"tek";

// ── Random values ─────────────────────────────────────────────────────────────

/// Generate a fresh 16-byte handshake random (RAND_S / RAND_P).
pub fn generate_rand() -> [u8; RAND_LEN] {
    let mut r = [0u8; RAND_LEN];
    rand::thread_rng().fill_bytes(&mut r);
    r
}

/// Generate a random 16-byte group key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut k = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut k);
    k
}

/// Constant-time comparison for MAC values.
pub fn mac_eq(a: &[u8; MAC_LEN], b: &[u8; MAC_LEN]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Pre-shared key ────────────────────────────────────────────────────────────

/// The 16-byte secret shared between the coordinator and every device.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk([u8; KEY_LEN]);

impl Psk {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Psk(..)")
    }
}

/// Long-lived keys derived once from the PSK.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PskKeys {
    ak: [u8; 32],
    kdk: [u8; 32],
}

impl PskKeys {
    pub fn derive(psk: &Psk) -> Self {
        Self {
            ak: blake3::derive_key(AK_CONTEXT, psk.as_bytes()),
            kdk: blake3::derive_key(KDK_CONTEXT, psk.as_bytes()),
        }
    }

    /// MAC_P = MAC(AK, ID_P ‖ ID_S ‖ RAND_S ‖ RAND_P)
    pub fn mac_p(
        &self,
        id_p: &[u8],
        id_s: &[u8],
        rand_s: &[u8; RAND_LEN],
        rand_p: &[u8; RAND_LEN],
    ) -> [u8; MAC_LEN] {
        let mut h = blake3::Hasher::new_keyed(&self.ak);
        h.update(id_p);
        h.update(id_s);
        h.update(rand_s);
        h.update(rand_p);
        truncate(h.finalize())
    }

    /// MAC_S = MAC(AK, ID_S ‖ RAND_P)
    pub fn mac_s(&self, id_s: &[u8], rand_p: &[u8; RAND_LEN]) -> [u8; MAC_LEN] {
        let mut h = blake3::Hasher::new_keyed(&self.ak);
        h.update(id_s);
        h.update(rand_p);
        truncate(h.finalize())
    }

    /// Transient key for one exchange, bound to the device's random.
    pub fn tek(&self, rand_p: &[u8; RAND_LEN]) -> Tek {
        let mut h = blake3::Hasher::new_keyed(&self.kdk);
        h.update(TEK_LABEL);
        h.update(rand_p);
        Tek(*h.finalize().as_bytes())
    }
}

fn truncate(hash: blake3::Hash) -> [u8; MAC_LEN] {
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&hash.as_bytes()[..MAC_LEN]);
    out
}

// ── Protected channel ─────────────────────────────────────────────────────────

/// Transient encryption key protecting messages 3 and 4.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Tek([u8; 32]);

impl Tek {
    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    fn nonce(counter: u32) -> Nonce {
        let mut n = [0u8; 12];
        n[8..].copy_from_slice(&counter.to_be_bytes());
        Nonce::clone_from_slice(&n)
    }

    /// Seal `plaintext` into a PCHANNEL: `nonce(4) tag(16) ciphertext`.
    pub fn seal(&self, counter: u32, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut body = plaintext.to_vec();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(&Self::nonce(counter), aad, &mut body)
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(PCHANNEL_OVERHEAD + body.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(tag.as_slice());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open a PCHANNEL. Returns the sender's nonce counter and the plaintext.
    pub fn open(&self, aad: &[u8], pchannel: &[u8]) -> Result<(u32, Vec<u8>), CryptoError> {
        if pchannel.len() < PCHANNEL_OVERHEAD {
            return Err(CryptoError::TooShort(pchannel.len()));
        }
        let mut counter = [0u8; PCHANNEL_NONCE_LEN];
        counter.copy_from_slice(&pchannel[..PCHANNEL_NONCE_LEN]);
        let counter = u32::from_be_bytes(counter);
        let tag = Tag::from_slice(&pchannel[PCHANNEL_NONCE_LEN..PCHANNEL_OVERHEAD]);

        let mut body = pchannel[PCHANNEL_OVERHEAD..].to_vec();
        self.cipher()
            .decrypt_in_place_detached(&Self::nonce(counter), aad, &mut body, tag)
            .map_err(|_| CryptoError::Open)?;
        Ok((counter, body))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("PCHANNEL too short ({0} bytes, need at least {PCHANNEL_OVERHEAD})")]
    TooShort(usize),

    #[error("PCHANNEL encryption failed")]
    Seal,

    #[error("PCHANNEL authentication failed")]
    Open,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
