//! Key store — the pre-shared key and the two group key slots.
//!
//! Exactly one of the two GMK slots is current. A rekey distributes the
//! pending key to every device, then `activate_pending` copies it into the
//! other slot and flips the index.

use lbs_core::crypto::{self, Psk};
use lbs_core::eap::KEY_LEN;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type GroupKey = [u8; KEY_LEN];

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyStore {
    psk: Psk,
    keys: [GroupKey; 2],
    #[zeroize(skip)]
    current_index: u8,
    pending: Option<GroupKey>,
}

impl KeyStore {
    /// Build a store with `gmk` in slot 0, or a random key when `None`.
    pub fn new(psk: Psk, gmk: Option<GroupKey>) -> Self {
        let mut keys = [[0u8; KEY_LEN]; 2];
        keys[0] = gmk.unwrap_or_else(crypto::generate_key);
        Self {
            psk,
            keys,
            current_index: 0,
            pending: None,
        }
    }

    pub fn psk(&self) -> &Psk {
        &self.psk
    }

    pub fn set_psk(&mut self, psk: Psk) {
        self.psk = psk;
    }

    pub fn current_index(&self) -> u8 {
        self.current_index
    }

    /// Index the next rekey will distribute into.
    pub fn next_index(&self) -> u8 {
        1 - self.current_index
    }

    pub fn current(&self) -> &GroupKey {
        &self.keys[self.current_index as usize]
    }

    pub fn key(&self, index: u8) -> Option<&GroupKey> {
        self.keys.get(index as usize)
    }

    /// Overwrite one key slot. Index must be 0 or 1.
    pub fn set_key(&mut self, index: u8, key: GroupKey) -> bool {
        match self.keys.get_mut(index as usize) {
            Some(slot) => {
                *slot = key;
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> Option<&GroupKey> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, key: GroupKey) {
        self.pending = Some(key);
    }

    /// Return the pending key, generating a random one if none is set.
    pub fn ensure_pending(&mut self) -> GroupKey {
        *self.pending.get_or_insert_with(crypto::generate_key)
    }

    /// Flip to the pending key. Returns the new current index, or `None`
    /// when nothing was pending.
    pub fn activate_pending(&mut self) -> Option<u8> {
        let key = self.pending.take()?;
        let next = self.next_index();
        self.keys[next as usize] = key;
        self.current_index = next;
        Some(next)
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("current_index", &self.current_index)
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}
