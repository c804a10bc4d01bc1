//! Two-phase group key rotation.
//!
//! Distribute: every joined device, one at a time in address order, runs a
//! full handshake whose message 3 carries the pending key under the unused
//! key index. Activate: every device that received the key gets an ACCEPTED
//! naming the new index. Then the coordinator flips its own index.
//!
//! The rotation borrows ordinary bootstrap slots, one at a time, so joins
//! keep being served while it runs.

use std::time::Instant;

use lbs_core::eap::{self, ConfigParam};
use lbs_core::lbp::MessageType;
use lbs_core::{DeviceIdentity, LinkAddress, ShortAddress};

use super::handshake::ServerHandshake;
use super::slot::{Phase, Purpose};
use super::{BootstrapEngine, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyPhase {
    Distribute,
    Activate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyTarget {
    pub address: ShortAddress,
    pub identity: DeviceIdentity,
    pub distributed: bool,
    pub activated: bool,
}

pub struct RekeyState {
    phase: RekeyPhase,
    targets: Vec<RekeyTarget>,
    cursor: usize,
    in_flight: Option<usize>,
    key_index: u8,
    failed: usize,
    started_at: Instant,
}

impl RekeyState {
    pub fn new(
        devices: impl IntoIterator<Item = (ShortAddress, DeviceIdentity)>,
        key_index: u8,
        now: Instant,
    ) -> Self {
        Self {
            phase: RekeyPhase::Distribute,
            targets: devices
                .into_iter()
                .map(|(address, identity)| RekeyTarget {
                    address,
                    identity,
                    distributed: false,
                    activated: false,
                })
                .collect(),
            cursor: 0,
            in_flight: None,
            key_index,
            failed: 0,
            started_at: now,
        }
    }

    pub fn phase(&self) -> RekeyPhase {
        self.phase
    }

    pub fn key_index(&self) -> u8 {
        self.key_index
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Next target for the current phase, without consuming it.
    ///
    /// Distribute skips devices that already hold the key; activate only
    /// visits devices that received it.
    pub fn peek(&mut self) -> Option<RekeyTarget> {
        while let Some(t) = self.targets.get(self.cursor) {
            let done = match self.phase {
                RekeyPhase::Distribute => t.distributed,
                RekeyPhase::Activate => !t.distributed,
            };
            if done {
                self.cursor += 1;
                continue;
            }
            return Some(*t);
        }
        None
    }

    /// A device that got the pending key while joining. It still needs the
    /// activation.
    pub fn enroll(&mut self, address: ShortAddress, identity: DeviceIdentity) {
        let pos = self.targets.iter().position(|t| t.identity == identity);
        match pos {
            Some(i) if i >= self.cursor => {
                let t = &mut self.targets[i];
                t.address = address;
                t.distributed = true;
            }
            _ => self.targets.push(RekeyTarget {
                address,
                identity,
                distributed: true,
                activated: false,
            }),
        }
    }

    /// Mark the peeked target as running.
    pub fn begin(&mut self) {
        self.in_flight = Some(self.cursor);
        self.cursor += 1;
    }

    /// Skip the peeked target without running it.
    pub fn skip(&mut self) {
        self.failed += 1;
        self.cursor += 1;
    }

    /// Record the outcome of the running target.
    pub fn finish(&mut self, success: bool) {
        let Some(idx) = self.in_flight.take() else {
            return;
        };
        if !success {
            self.failed += 1;
            return;
        }
        let t = &mut self.targets[idx];
        match self.phase {
            RekeyPhase::Distribute => t.distributed = true,
            RekeyPhase::Activate => t.activated = true,
        }
    }

    /// Move from distribute to activate. False when already activating.
    pub fn enter_activate(&mut self) -> bool {
        if self.phase == RekeyPhase::Activate {
            return false;
        }
        self.phase = RekeyPhase::Activate;
        self.cursor = 0;
        true
    }

    pub fn is_running(&self, identity: &DeviceIdentity) -> bool {
        self.in_flight
            .and_then(|i| self.targets.get(i))
            .is_some_and(|t| t.identity == *identity)
    }

    pub fn progress(&self) -> RekeyProgress {
        RekeyProgress {
            phase: self.phase,
            total: self.targets.len(),
            distributed: self.targets.iter().filter(|t| t.distributed).count(),
            activated: self.targets.iter().filter(|t| t.activated).count(),
            failed: self.failed,
            key_index: self.key_index,
        }
    }
}

/// Snapshot of a running rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyProgress {
    pub phase: RekeyPhase,
    pub total: usize,
    pub distributed: usize,
    pub activated: usize,
    pub failed: usize,
    pub key_index: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RekeyError {
    #[error("no joined devices to rekey")]
    NoDevices,
    #[error("a rekey is already running")]
    AlreadyRunning,
}

// ── Engine integration ────────────────────────────────────────────────────────

impl BootstrapEngine {
    /// Start rotating the group key to the pending key (random if unset).
    pub fn launch_rekey(&mut self, now: Instant) -> Result<(), RekeyError> {
        if self.rekey.is_some() {
            return Err(RekeyError::AlreadyRunning);
        }
        if self.registry.occupancy() == 0 {
            return Err(RekeyError::NoDevices);
        }
        self.keys.ensure_pending();
        let key_index = self.keys.next_index();
        let mut devices: Vec<_> = self
            .registry
            .iter_active()
            .map(|e| (e.address, e.identity))
            .collect();
        // Joins whose message 3 already went out with the current key only.
        let joining: Vec<_> = self
            .slots
            .iter()
            .filter(|s| s.purpose == Purpose::Join && s.handshake_past_message3())
            .filter(|s| !devices.iter().any(|(_, id)| *id == s.identity))
            .map(|s| (s.address, s.identity))
            .collect();
        devices.extend(joining);
        tracing::info!(devices = devices.len(), key_index, "rekey started");
        self.rekey = Some(RekeyState::new(devices, key_index, now));
        self.drive_rekey(now);
        Ok(())
    }

    pub fn is_rekeying(&self) -> bool {
        self.rekey.is_some()
    }

    pub fn rekey_progress(&self) -> Option<RekeyProgress> {
        self.rekey.as_ref().map(RekeyState::progress)
    }

    /// Start the next rekey step if nothing is in flight.
    pub(super) fn drive_rekey(&mut self, now: Instant) {
        loop {
            let (target, phase, key_index) = {
                let Some(rekey) = self.rekey.as_mut() else {
                    return;
                };
                if rekey.is_busy() {
                    return;
                }
                match rekey.peek() {
                    Some(t) => (t, rekey.phase(), rekey.key_index()),
                    None => {
                        // Joins holding the pending key must land first.
                        if self
                            .slots
                            .iter()
                            .any(|s| s.purpose == Purpose::Join && s.carried_pending)
                        {
                            return;
                        }
                        if !rekey.enter_activate() {
                            self.complete_rekey(now);
                            return;
                        }
                        if rekey.progress().distributed == 0 {
                            self.abandon_rekey();
                            return;
                        }
                        tracing::info!(
                            key_index = rekey.key_index(),
                            "rekey distribution done, activating"
                        );
                        continue;
                    }
                }
            };

            // Device is busy with a join of its own; try again later.
            if self.slot_of(&target.identity).is_some() {
                return;
            }
            let still_joined = self
                .registry
                .lookup_by_address(target.address)
                .is_some_and(|e| e.identity == target.identity);
            if !still_joined {
                tracing::debug!(device = %target.identity, "rekey target left, skipped");
                if let Some(rekey) = self.rekey.as_mut() {
                    rekey.skip();
                }
                continue;
            }
            let Some(idx) = self.idle_slot() else {
                return;
            };
            if let Some(rekey) = self.rekey.as_mut() {
                rekey.begin();
            }
            self.start_rekey_slot(idx, target, phase, key_index, now);
            return;
        }
    }

    fn start_rekey_slot(
        &mut self,
        idx: usize,
        target: RekeyTarget,
        phase: RekeyPhase,
        key_index: u8,
        now: Instant,
    ) {
        let route = Route {
            max_hops: self.link.max_hops(),
            discover_route: true,
            security_enabled: true,
        };
        let eap_id = self.next_eap_identifier();
        let slot = &mut self.slots[idx];
        slot.identity = target.identity;
        slot.address = target.address;
        slot.destination = LinkAddress::Short(target.address);
        slot.reserved = false;
        slot.hop_count = self
            .registry
            .lookup_by_address(target.address)
            .map_or(1, |e| e.hop_count);

        match phase {
            RekeyPhase::Distribute => {
                slot.purpose = Purpose::RekeyDistribute;
                let hs = ServerHandshake::new(eap_id);
                let m1 = hs.message1(&self.server_identity);
                slot.handshake = Some(hs);
                tracing::debug!(device = %target.identity, address = %target.address, "rekey distribute");
                self.transmit(idx, MessageType::Challenge, &m1, route, Phase::Sent1, now);
            }
            RekeyPhase::Activate => {
                slot.purpose = Purpose::RekeyActivate;
                let mut payload = Vec::new();
                eap::encode_params(&[ConfigParam::GmkActivation { index: key_index }], &mut payload);
                tracing::debug!(device = %target.identity, address = %target.address, "rekey activate");
                self.transmit(idx, MessageType::Accepted, &payload, route, Phase::SentAccepted, now);
            }
        }
    }

    fn complete_rekey(&mut self, now: Instant) {
        let Some(rekey) = self.rekey.take() else {
            return;
        };
        let p = rekey.progress();
        let elapsed = now.saturating_duration_since(rekey.started_at);
        match self.keys.activate_pending() {
            Some(index) => {
                tracing::info!(
                    key_index = index,
                    devices = p.total,
                    activated = p.activated,
                    failed = p.failed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "rekey complete"
                );
                if let Some(obs) = &self.observer {
                    obs.on_rekey_completed(index);
                }
            }
            None => tracing::warn!("rekey finished without a pending key"),
        }
    }

    fn abandon_rekey(&mut self) {
        if let Some(rekey) = self.rekey.take() {
            let p = rekey.progress();
            tracing::warn!(devices = p.total, failed = p.failed, "rekey reached no device, key kept");
        }
    }
}
