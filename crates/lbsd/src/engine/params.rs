//! Administrative attribute surface.
//!
//! Values are raw big-endian byte strings, the way a management shell or a
//! host interface would carry them:
//!
//!   DeviceListEntry      identity(8) address(2) hop_count(1), indexed by table slot
//!   InitialShortAddress  address(2)
//!   BlacklistAdd/Remove  identity(8), write only
//!   Psk                  key(16)
//!   Gmk                  key(16), index 0 or 1
//!   PendingGmk           key(16)
//!   AddressFromIdentity  flag(1)
//!   MsgTimeout           seconds(2)
//!   MaxRetries           count(1)

use std::time::Duration;

use lbs_core::crypto::{Psk as PreSharedKey, PskKeys};
use lbs_core::eap::KEY_LEN;
use lbs_core::{DeviceIdentity, ShortAddress};
use lbs_services::{AddressMode, BlacklistError, RegistryEntry};

use super::BootstrapEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamAttribute {
    DeviceListEntry = 0x00,
    InitialShortAddress = 0x01,
    BlacklistAdd = 0x02,
    BlacklistRemove = 0x03,
    Psk = 0x04,
    Gmk = 0x05,
    PendingGmk = 0x06,
    AddressFromIdentity = 0x07,
    MsgTimeout = 0x08,
    MaxRetries = 0x09,
}

impl TryFrom<u8> for ParamAttribute {
    type Error = ParamStatus;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => ParamAttribute::DeviceListEntry,
            0x01 => ParamAttribute::InitialShortAddress,
            0x02 => ParamAttribute::BlacklistAdd,
            0x03 => ParamAttribute::BlacklistRemove,
            0x04 => ParamAttribute::Psk,
            0x05 => ParamAttribute::Gmk,
            0x06 => ParamAttribute::PendingGmk,
            0x07 => ParamAttribute::AddressFromIdentity,
            0x08 => ParamAttribute::MsgTimeout,
            0x09 => ParamAttribute::MaxRetries,
            _ => return Err(ParamStatus::UnsupportedParameter),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamStatus {
    Ok = 0,
    UnsupportedParameter = 1,
    InvalidIndex = 2,
    InvalidLength = 3,
    InvalidValue = 4,
    Failure = 5,
}

const DEVICE_ENTRY_LEN: usize = 11;

fn entry_bytes(e: &RegistryEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(DEVICE_ENTRY_LEN);
    out.extend_from_slice(e.identity.as_bytes());
    if e.is_active() {
        out.extend_from_slice(&e.address.to_be_bytes());
        out.push(e.hop_count);
    } else {
        out.extend_from_slice(&[0, 0, 0]);
    }
    out
}

fn key_of(value: &[u8]) -> Result<[u8; KEY_LEN], ParamStatus> {
    value.try_into().map_err(|_| ParamStatus::InvalidLength)
}

fn identity_of(value: &[u8]) -> Result<DeviceIdentity, ParamStatus> {
    let id = DeviceIdentity::try_from(value).map_err(|_| ParamStatus::InvalidLength)?;
    if id.is_none() {
        return Err(ParamStatus::InvalidValue);
    }
    Ok(id)
}

fn u16_of(value: &[u8]) -> Result<u16, ParamStatus> {
    let b: [u8; 2] = value.try_into().map_err(|_| ParamStatus::InvalidLength)?;
    Ok(u16::from_be_bytes(b))
}

fn u8_of(value: &[u8]) -> Result<u8, ParamStatus> {
    match value {
        [b] => Ok(*b),
        _ => Err(ParamStatus::InvalidLength),
    }
}

impl BootstrapEngine {
    pub fn get_param(&self, attribute: u8, index: u16) -> Result<Vec<u8>, ParamStatus> {
        use ParamAttribute::*;
        let attribute = ParamAttribute::try_from(attribute)?;
        if !matches!(attribute, DeviceListEntry | Gmk) && index != 0 {
            return Err(ParamStatus::InvalidIndex);
        }
        match attribute {
            DeviceListEntry => self
                .registry
                .entry_at(index as usize)
                .map(entry_bytes)
                .ok_or(ParamStatus::InvalidIndex),
            InitialShortAddress => Ok(self.registry.base().to_be_bytes().to_vec()),
            BlacklistAdd | BlacklistRemove => Err(ParamStatus::UnsupportedParameter),
            Psk => Ok(self.keys.psk().as_bytes().to_vec()),
            Gmk => {
                let idx = u8::try_from(index).map_err(|_| ParamStatus::InvalidIndex)?;
                self.keys
                    .key(idx)
                    .map(|k| k.to_vec())
                    .ok_or(ParamStatus::InvalidIndex)
            }
            PendingGmk => self
                .keys
                .pending()
                .map(|k| k.to_vec())
                .ok_or(ParamStatus::Failure),
            AddressFromIdentity => Ok(vec![(self.registry.mode() == AddressMode::Derived) as u8]),
            MsgTimeout => {
                let secs = u16::try_from(self.msg_timeout.as_secs()).unwrap_or(u16::MAX);
                Ok(secs.to_be_bytes().to_vec())
            }
            MaxRetries => Ok(vec![self.max_retries]),
        }
    }

    pub fn set_param(&mut self, attribute: u8, index: u16, value: &[u8]) -> ParamStatus {
        match self.try_set_param(attribute, index, value) {
            Ok(()) => ParamStatus::Ok,
            Err(status) => {
                tracing::debug!(attribute, index, ?status, "set_param refused");
                status
            }
        }
    }

    fn try_set_param(&mut self, attribute: u8, index: u16, value: &[u8]) -> Result<(), ParamStatus> {
        use ParamAttribute::*;
        let attribute = ParamAttribute::try_from(attribute)?;
        if !matches!(attribute, DeviceListEntry | Gmk) && index != 0 {
            return Err(ParamStatus::InvalidIndex);
        }
        match attribute {
            DeviceListEntry => self.set_device_entry(index as usize, value),
            InitialShortAddress => {
                let base = u16_of(value)?;
                self.registry.set_base(base).map_err(|e| match e {
                    lbs_services::RegistryError::Busy => ParamStatus::Failure,
                    _ => ParamStatus::InvalidValue,
                })
            }
            BlacklistAdd => {
                let id = identity_of(value)?;
                self.blacklist.add(id).map_err(|e| match e {
                    BlacklistError::Full(_) => ParamStatus::Failure,
                    BlacklistError::NoIdentity => ParamStatus::InvalidValue,
                })?;
                tracing::info!(device = %id, "device blacklisted");
                Ok(())
            }
            BlacklistRemove => {
                let id = identity_of(value)?;
                if self.blacklist.remove(&id) {
                    tracing::info!(device = %id, "device removed from blacklist");
                }
                Ok(())
            }
            Psk => {
                let key = key_of(value)?;
                self.keys.set_psk(PreSharedKey::new(key));
                self.psk_keys = PskKeys::derive(self.keys.psk());
                tracing::info!("pre-shared key replaced");
                Ok(())
            }
            Gmk => {
                let idx = u8::try_from(index)
                    .ok()
                    .filter(|i| *i <= 1)
                    .ok_or(ParamStatus::InvalidIndex)?;
                let key = key_of(value)?;
                if self.rekey.is_some() {
                    return Err(ParamStatus::Failure);
                }
                self.keys.set_key(idx, key);
                Ok(())
            }
            PendingGmk => {
                let key = key_of(value)?;
                if self.rekey.is_some() {
                    return Err(ParamStatus::Failure);
                }
                self.keys.set_pending(key);
                Ok(())
            }
            AddressFromIdentity => {
                let mode = match u8_of(value)? {
                    0 => AddressMode::Allocated,
                    1 => AddressMode::Derived,
                    _ => return Err(ParamStatus::InvalidValue),
                };
                self.registry.set_mode(mode).map_err(|_| ParamStatus::Failure)
            }
            MsgTimeout => match u16_of(value)? {
                0 => Err(ParamStatus::InvalidValue),
                secs => {
                    self.msg_timeout = Duration::from_secs(u64::from(secs));
                    Ok(())
                }
            },
            MaxRetries => {
                self.max_retries = u8_of(value)?;
                Ok(())
            }
        }
    }

    /// Write `identity address [hop]` into table entry `index`. The address
    /// must be the one that entry stands for. A zero identity removes the
    /// device currently at `index`.
    fn set_device_entry(&mut self, index: usize, value: &[u8]) -> Result<(), ParamStatus> {
        if self.registry.entry_at(index).is_none() {
            return Err(ParamStatus::InvalidIndex);
        }
        if value.len() != DEVICE_ENTRY_LEN && value.len() != DEVICE_ENTRY_LEN - 1 {
            return Err(ParamStatus::InvalidLength);
        }
        let identity = DeviceIdentity::try_from(&value[..8]).map_err(|_| ParamStatus::InvalidLength)?;
        let address = ShortAddress(u16_of(&value[8..10])?);
        let hop_count = value.get(10).copied().unwrap_or(1);

        if identity.is_none() {
            let current = self
                .registry
                .entry_at(index)
                .filter(|e| e.is_active())
                .copied()
                .ok_or(ParamStatus::InvalidValue)?;
            let released = self
                .registry
                .release(current.address)
                .map_err(|_| ParamStatus::Failure)?;
            if let Some(idx) = self.slot_of(&released) {
                self.finish(idx, false);
            }
            tracing::info!(device = %released, address = %current.address, "device removed by admin");
            if let Some(obs) = &self.observer {
                obs.on_departed(released, current.address);
            }
            return Ok(());
        }

        self.registry
            .commit_at(index, identity, address, hop_count)
            .map_err(|_| ParamStatus::InvalidValue)?;
        tracing::info!(device = %identity, address = %address, "device registered by admin");
        Ok(())
    }
}
