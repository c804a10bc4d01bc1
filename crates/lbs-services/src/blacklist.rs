//! Blacklist — identities that are declined on sight.
//!
//! Bounded by the registry capacity. Entries come from the config file at
//! startup and from the administrative parameter surface at runtime; nothing
//! is persisted.

use std::collections::HashSet;

use lbs_core::DeviceIdentity;

pub struct Blacklist {
    entries: HashSet<DeviceIdentity>,
    capacity: usize,
}

impl Blacklist {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Seed from config. Entries past capacity are skipped with a warning.
    pub fn apply_config(&mut self, identities: &[DeviceIdentity]) {
        for id in identities {
            match self.add(*id) {
                Ok(()) => tracing::info!(device = %id, "blacklisted from config"),
                Err(e) => tracing::warn!(device = %id, error = %e, "blacklist entry skipped"),
            }
        }
    }

    /// Add an identity. Adding one already listed is a no-op.
    pub fn add(&mut self, identity: DeviceIdentity) -> Result<(), BlacklistError> {
        if identity.is_none() {
            return Err(BlacklistError::NoIdentity);
        }
        if self.entries.contains(&identity) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(BlacklistError::Full(self.capacity));
        }
        self.entries.insert(identity);
        Ok(())
    }

    /// Returns whether the identity was listed.
    pub fn remove(&mut self, identity: &DeviceIdentity) -> bool {
        self.entries.remove(identity)
    }

    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.entries.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All listed identities, sorted.
    pub fn list(&self) -> Vec<DeviceIdentity> {
        let mut out: Vec<_> = self.entries.iter().copied().collect();
        out.sort();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlacklistError {
    #[error("blacklist full ({0} entries)")]
    Full(usize),
    #[error("the all-zero identity cannot be blacklisted")]
    NoIdentity,
}
