//! Confirmation correlator — send handles and their matching.

use super::slot::{BootstrapSlot, HandleMatch};

/// Wrapping 8-bit handle source shared by every outbound frame.
#[derive(Debug, Default)]
pub struct Correlator {
    next: u8,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_handle(&mut self) -> u8 {
        let h = self.next;
        self.next = self.next.wrapping_add(1);
        h
    }

    /// Find the slot a confirmation belongs to.
    ///
    /// A current-handle match wins over a secondary one if handles have
    /// wrapped around onto each other.
    pub fn locate(&self, slots: &[BootstrapSlot], handle: u8) -> Option<(usize, HandleMatch)> {
        let mut secondary = None;
        for (idx, slot) in slots.iter().enumerate() {
            match slot.matches(handle) {
                Some(HandleMatch::Current) => return Some((idx, HandleMatch::Current)),
                Some(HandleMatch::Secondary) if secondary.is_none() => {
                    secondary = Some((idx, HandleMatch::Secondary))
                }
                _ => {}
            }
        }
        secondary
    }
}
