//! Address registry: which device holds which short address.
//!
//! A fixed table of `capacity` entries; entry `i` describes address
//! `base + i`. An entry is active when its identity is non-zero. Addresses
//! are reserved when a join starts and committed when the device's ACCEPTED
//! frame is confirmed, so two in-flight joins can never receive the same
//! address.
//!
//! In derived mode the address is computed from the identity instead and
//! entries are filled first-free; lookups by address then scan.

use lbs_core::{DeviceIdentity, ShortAddress};

/// Largest unicast short address.
pub const MAX_UNICAST: u16 = 0x7FFF;

/// One row of the registry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryEntry {
    pub identity: DeviceIdentity,
    pub address: ShortAddress,
    pub hop_count: u8,
    /// Held by an in-flight join, not yet committed.
    pub reserved: bool,
}

impl RegistryEntry {
    pub fn is_active(&self) -> bool {
        !self.identity.is_none()
    }

    fn is_free(&self) -> bool {
        !self.is_active() && !self.reserved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `base + index`, handed out by the registry.
    Allocated,
    /// Low 15 bits of the device identity.
    Derived,
}

pub struct AddressRegistry {
    base: u16,
    entries: Vec<RegistryEntry>,
    /// Entries below this index have been handed out at least once.
    high_water: usize,
    occupancy: usize,
    mode: AddressMode,
}

impl AddressRegistry {
    pub fn new(base: u16, capacity: u16) -> Self {
        Self {
            base,
            entries: vec![RegistryEntry::default(); capacity as usize],
            high_water: 0,
            occupancy: 0,
            mode: AddressMode::Allocated,
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of active (committed) entries.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    /// Switch address mode. Only allowed while nothing is active or reserved.
    pub fn set_mode(&mut self, mode: AddressMode) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| !e.is_free()) {
            return Err(RegistryError::Busy);
        }
        self.mode = mode;
        self.high_water = 0;
        Ok(())
    }

    /// Move the allocation window. Only allowed while empty.
    pub fn set_base(&mut self, base: u16) -> Result<(), RegistryError> {
        if base == 0 || u32::from(base) + self.entries.len() as u32 > u32::from(MAX_UNICAST) + 1 {
            return Err(RegistryError::OutOfRange(ShortAddress(base)));
        }
        if self.entries.iter().any(|e| !e.is_free()) {
            return Err(RegistryError::Busy);
        }
        self.base = base;
        self.high_water = 0;
        Ok(())
    }

    fn index_of(&self, address: ShortAddress) -> Option<usize> {
        match self.mode {
            AddressMode::Allocated => {
                let idx = address.0.checked_sub(self.base)? as usize;
                (idx < self.entries.len()).then_some(idx)
            }
            AddressMode::Derived => self
                .entries
                .iter()
                .position(|e| (e.is_active() || e.reserved) && e.address == address),
        }
    }

    fn address_at(&self, idx: usize) -> ShortAddress {
        ShortAddress(self.base + idx as u16)
    }

    // ── Allocation ────────────────────────────────────────────────────────────

    /// Reserve an address for `identity`.
    pub fn allocate(&mut self, identity: DeviceIdentity) -> Result<ShortAddress, RegistryError> {
        match self.mode {
            AddressMode::Allocated => self.allocate_sequential(),
            AddressMode::Derived => self.allocate_derived(identity),
        }
    }

    fn allocate_sequential(&mut self) -> Result<ShortAddress, RegistryError> {
        let idx = if self.high_water < self.entries.len() {
            let idx = self.high_water;
            self.high_water += 1;
            idx
        } else {
            self.entries
                .iter()
                .position(RegistryEntry::is_free)
                .ok_or(RegistryError::Exhausted)?
        };
        let address = self.address_at(idx);
        let entry = &mut self.entries[idx];
        entry.reserved = true;
        entry.address = address;
        Ok(address)
    }

    fn allocate_derived(&mut self, identity: DeviceIdentity) -> Result<ShortAddress, RegistryError> {
        let address = ShortAddress(identity.low_u16() & MAX_UNICAST);
        if !address.is_assigned() {
            return Err(RegistryError::Underivable(identity));
        }
        if let Some(idx) = self.index_of(address) {
            let e = &self.entries[idx];
            if e.identity != identity || e.reserved {
                return Err(RegistryError::Conflict(address));
            }
            return Ok(address);
        }
        let idx = self
            .entries
            .iter()
            .position(RegistryEntry::is_free)
            .ok_or(RegistryError::Exhausted)?;
        let entry = &mut self.entries[idx];
        entry.reserved = true;
        entry.address = address;
        Ok(address)
    }

    /// Drop a reservation that never got committed.
    pub fn cancel(&mut self, address: ShortAddress) {
        let idx = match self.mode {
            AddressMode::Allocated => self.index_of(address),
            AddressMode::Derived => self
                .entries
                .iter()
                .position(|e| e.reserved && e.address == address),
        };
        if let Some(idx) = idx {
            let entry = &mut self.entries[idx];
            if entry.reserved {
                entry.reserved = false;
                if !entry.is_active() {
                    entry.address = ShortAddress::UNASSIGNED;
                }
            }
        }
    }

    // ── Commit / release ──────────────────────────────────────────────────────

    /// Bind `address` to `identity`.
    ///
    /// Re-committing the same pair only refreshes the hop count.
    pub fn commit(
        &mut self,
        identity: DeviceIdentity,
        address: ShortAddress,
        hop_count: u8,
    ) -> Result<(), RegistryError> {
        if let Some(held) = self.lookup_by_identity(identity) {
            if held != address {
                return Err(RegistryError::IdentityElsewhere { identity, held });
            }
        }
        let idx = match self.mode {
            AddressMode::Allocated => self
                .index_of(address)
                .ok_or(RegistryError::OutOfRange(address))?,
            AddressMode::Derived => {
                if !address.is_assigned() || address.0 > MAX_UNICAST {
                    return Err(RegistryError::OutOfRange(address));
                }
                match self.index_of(address) {
                    Some(idx) => idx,
                    None => self
                        .entries
                        .iter()
                        .position(RegistryEntry::is_free)
                        .ok_or(RegistryError::Exhausted)?,
                }
            }
        };
        self.store(idx, identity, address, hop_count)
    }

    /// Like [`commit`](Self::commit), but the binding must land at table
    /// `index`.
    pub fn commit_at(
        &mut self,
        index: usize,
        identity: DeviceIdentity,
        address: ShortAddress,
        hop_count: u8,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(RegistryError::OutOfRange(address))?;
        if let Some(held) = self.lookup_by_identity(identity) {
            if held != address {
                return Err(RegistryError::IdentityElsewhere { identity, held });
            }
        }
        match self.mode {
            AddressMode::Allocated => {
                if self.index_of(address) != Some(index) {
                    return Err(RegistryError::Misplaced { address, index });
                }
            }
            AddressMode::Derived => {
                if !address.is_assigned() || address.0 > MAX_UNICAST {
                    return Err(RegistryError::OutOfRange(address));
                }
                match self.index_of(address) {
                    Some(i) if i != index => {
                        return Err(RegistryError::Misplaced { address, index })
                    }
                    Some(_) => {}
                    None if !entry.is_free() => return Err(RegistryError::Conflict(address)),
                    None => {}
                }
            }
        }
        self.store(index, identity, address, hop_count)
    }

    fn store(
        &mut self,
        idx: usize,
        identity: DeviceIdentity,
        address: ShortAddress,
        hop_count: u8,
    ) -> Result<(), RegistryError> {
        let entry = &mut self.entries[idx];
        if entry.is_active() && entry.identity != identity {
            return Err(RegistryError::Conflict(address));
        }
        if !entry.is_active() {
            self.occupancy += 1;
        }
        *entry = RegistryEntry {
            identity,
            address,
            hop_count,
            reserved: false,
        };
        if self.mode == AddressMode::Allocated && idx >= self.high_water {
            self.high_water = idx + 1;
        }
        Ok(())
    }

    /// Free an active address. Returns the identity that held it.
    pub fn release(&mut self, address: ShortAddress) -> Result<DeviceIdentity, RegistryError> {
        let idx = self
            .index_of(address)
            .ok_or(RegistryError::OutOfRange(address))?;
        let entry = &mut self.entries[idx];
        if !entry.is_active() {
            return Err(RegistryError::Inactive(address));
        }
        let identity = entry.identity;
        *entry = RegistryEntry::default();
        self.occupancy -= 1;
        Ok(identity)
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub fn lookup_by_address(&self, address: ShortAddress) -> Option<&RegistryEntry> {
        self.index_of(address)
            .map(|i| &self.entries[i])
            .filter(|e| e.is_active())
    }

    pub fn lookup_by_identity(&self, identity: DeviceIdentity) -> Option<ShortAddress> {
        if identity.is_none() {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .map(|e| e.address)
    }

    /// Raw table access, active or not.
    pub fn entry_at(&self, index: usize) -> Option<&RegistryEntry> {
        self.entries.get(index)
    }

    /// Active entries in address order.
    pub fn iter_active(&self) -> impl Iterator<Item = &RegistryEntry> + '_ {
        let mut active: Vec<&RegistryEntry> =
            self.entries.iter().filter(|e| e.is_active()).collect();
        if self.mode == AddressMode::Derived {
            active.sort_by_key(|e| e.address);
        }
        active.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("address pool exhausted")]
    Exhausted,

    #[error("address {0} outside the registry range")]
    OutOfRange(ShortAddress),

    #[error("address {0} already held by another device")]
    Conflict(ShortAddress),

    #[error("device {identity} already holds {held}")]
    IdentityElsewhere {
        identity: DeviceIdentity,
        held: ShortAddress,
    },

    #[error("address {0} is not active")]
    Inactive(ShortAddress),

    #[error("cannot derive an address from {0}")]
    Underivable(DeviceIdentity),

    #[error("address {address} does not belong at index {index}")]
    Misplaced { address: ShortAddress, index: usize },

    #[error("registry has active entries")]
    Busy,
}
