//! Bootstrap engine — the coordinator's join authority.
//!
//! A plain synchronous state machine. Every stimulus (inbound frame, link
//! confirmation, periodic tick, admin call) is a method taking `now`; the
//! engine never sleeps, never blocks and never spawns. `service` wraps it
//! in a tokio task for the daemon; tests drive it directly.
//!
//! Flow for one join:
//!
//!   JOINING(empty)  → CHALLENGE(msg1)   Sent1 → WaitMsg2
//!   JOINING(msg2)   → CHALLENGE(msg3)   Sent3 → WaitMsg4
//!   JOINING(msg4)   → ACCEPTED(success) SentAccepted → Idle, address committed

pub mod correlator;
pub mod handshake;
pub mod params;
pub mod rekey;
pub mod slot;

use std::sync::Arc;
use std::time::{Duration, Instant};

use lbs_core::config::ConfigError;
use lbs_core::crypto::PskKeys;
use lbs_core::eap::{self, ConfigParam};
use lbs_core::lbp::{self, Direction, LbpFlags, MessageType};
use lbs_core::{BootstrapConfig, DeviceIdentity, LinkAddress, ShortAddress};
use lbs_services::{
    AddressMode, AddressRegistry, Blacklist, BootstrapObserver, Confirmation, Indication,
    KeyStore, LinkLayer, RegistryEntry, RegistryError, SendRequest,
};

use correlator::Correlator;
use handshake::ServerHandshake;
use rekey::RekeyState;
use slot::{transition, BootstrapSlot, HandleMatch, Phase, Purpose, SlotStatus, Stimulus};

pub use params::{ParamAttribute, ParamStatus};
pub use rekey::{RekeyError, RekeyPhase, RekeyProgress};

/// Delivery options for one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    pub max_hops: u8,
    pub discover_route: bool,
    pub security_enabled: bool,
}

impl Route {
    fn of(request: &SendRequest) -> Self {
        Self {
            max_hops: request.max_hops,
            discover_route: request.discover_route,
            security_enabled: request.security_enabled,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no device holds {0}")]
    UnknownAddress(ShortAddress),
}

pub struct BootstrapEngine {
    config: BootstrapConfig,
    server_identity: DeviceIdentity,
    link: Arc<dyn LinkLayer>,
    observer: Option<Arc<dyn BootstrapObserver>>,
    slots: Vec<BootstrapSlot>,
    registry: AddressRegistry,
    blacklist: Blacklist,
    keys: KeyStore,
    psk_keys: PskKeys,
    correlator: Correlator,
    eap_identifier: u8,
    rekey: Option<RekeyState>,
    msg_timeout: Duration,
    max_retries: u8,
}

impl BootstrapEngine {
    pub fn new(config: &BootstrapConfig, link: Arc<dyn LinkLayer>) -> Result<Self, EngineError> {
        config.validate()?;
        let b = &config.bootstrap;

        let keys = KeyStore::new(config.psk()?, config.gmk()?);
        let psk_keys = PskKeys::derive(keys.psk());

        let mut registry = AddressRegistry::new(b.short_address_base, b.capacity);
        if b.derived_addresses {
            registry.set_mode(AddressMode::Derived)?;
        }
        let mut blacklist = Blacklist::new(b.capacity as usize);
        blacklist.apply_config(&config.blacklist()?);

        Ok(Self {
            server_identity: config.server_identity()?,
            link,
            observer: None,
            slots: (0..b.slots).map(|_| BootstrapSlot::default()).collect(),
            registry,
            blacklist,
            keys,
            psk_keys,
            correlator: Correlator::new(),
            eap_identifier: rand::random(),
            rekey: None,
            msg_timeout: config.msg_timeout(),
            max_retries: b.max_retries,
            config: config.clone(),
        })
    }

    /// Drop every slot, registration and runtime setting; start over from
    /// the configuration the engine was built with.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let fresh = Self::new(&self.config, self.link.clone())?;
        let observer = self.observer.take();
        *self = fresh;
        self.observer = observer;
        tracing::info!("bootstrap engine reset");
        Ok(())
    }

    pub fn set_observer(&mut self, observer: Arc<dyn BootstrapObserver>) {
        self.observer = Some(observer);
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn joined_count(&self) -> usize {
        self.registry.occupancy()
    }

    /// Active registry entry at table index `index`.
    pub fn device_at(&self, index: usize) -> Option<RegistryEntry> {
        self.registry
            .entry_at(index)
            .filter(|e| e.is_active())
            .copied()
    }

    pub fn extended_address(&self, address: ShortAddress) -> Option<DeviceIdentity> {
        self.registry.lookup_by_address(address).map(|e| e.identity)
    }

    pub fn short_address(&self, identity: DeviceIdentity) -> Option<ShortAddress> {
        self.registry.lookup_by_identity(identity)
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| s.status(i))
            .collect()
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn server_identity(&self) -> DeviceIdentity {
        self.server_identity
    }

    // ── Inbound frames ────────────────────────────────────────────────────────

    pub fn handle_indication(&mut self, indication: &Indication, now: Instant) {
        let frame = match lbp::decode(&indication.payload, Direction::FromDevice) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(source = %indication.source, error = %e, "malformed LBP frame dropped");
                return;
            }
        };
        if frame.identity.is_none() {
            tracing::debug!(source = %indication.source, "frame without device identity dropped");
            return;
        }

        match frame.message_type {
            MessageType::Joining => {
                let identity = frame.identity;
                match self.slot_of(&identity) {
                    Some(idx) if frame.payload.is_empty() => {
                        tracing::debug!(device = %identity, slot = idx, "duplicate join ignored");
                    }
                    Some(idx) => self.continue_handshake(idx, frame.payload, now),
                    None if frame.payload.is_empty() => {
                        self.start_join(identity, indication.source, frame.flags, now)
                    }
                    None => {
                        tracing::debug!(device = %identity, "handshake message without a session dropped");
                    }
                }
            }
            MessageType::KickFromDevice => self.on_device_kick(frame.identity, now),
            other => {
                tracing::debug!(kind = ?other, "unexpected inbound LBP message");
            }
        }
        self.drive_rekey(now);
    }

    fn start_join(
        &mut self,
        identity: DeviceIdentity,
        source: LinkAddress,
        inbound: LbpFlags,
        now: Instant,
    ) {
        let flags = self.response_flags(inbound);
        if self.blacklist.contains(&identity) {
            tracing::warn!(device = %identity, "blacklisted device declined");
            self.send_decline(identity, source, flags, now);
            return;
        }
        let Some(idx) = self.idle_slot() else {
            tracing::warn!(device = %identity, "no free bootstrap slot, join ignored");
            return;
        };

        let (address, reserved) = match self.registry.lookup_by_identity(identity) {
            Some(a) => (a, false),
            None => match self.registry.allocate(identity) {
                Ok(a) => (a, true),
                Err(e) => {
                    tracing::warn!(device = %identity, error = %e, "no short address, join declined");
                    self.send_decline(identity, source, flags, now);
                    return;
                }
            },
        };

        let hop_count = self.hop_count(source);
        let route = self.join_route();
        let eap_id = self.next_eap_identifier();
        let hs = ServerHandshake::new(eap_id);
        let m1 = hs.message1(&self.server_identity);

        let slot = &mut self.slots[idx];
        slot.identity = identity;
        slot.purpose = Purpose::Join;
        slot.destination = source;
        slot.address = address;
        slot.reserved = reserved;
        slot.hop_count = hop_count;
        slot.flags = flags;
        slot.handshake = Some(hs);

        tracing::info!(device = %identity, address = %address, hop_count, source = %source, "join started");
        self.transmit(idx, MessageType::Challenge, &m1, route, Phase::Sent1, now);
    }

    fn continue_handshake(&mut self, idx: usize, payload: &[u8], now: Instant) {
        let number = match eap::parse(payload) {
            Ok(m) => m.number(),
            Err(e) => {
                tracing::debug!(device = %self.slots[idx].identity, error = %e, "malformed EAP message dropped");
                return;
            }
        };
        match number {
            Some(1) => self.on_message2(idx, payload, now),
            Some(3) => self.on_message4(idx, payload, now),
            _ => self.abort(idx, "unexpected EAP message"),
        }
    }

    fn on_message2(&mut self, idx: usize, payload: &[u8], now: Instant) {
        let outcome = {
            let slot = &mut self.slots[idx];
            let Some(next) = transition(slot.phase, slot.purpose, Stimulus::Message2) else {
                return self.abort(idx, "message 2 out of sequence");
            };
            let params = match slot.purpose {
                Purpose::Join => {
                    let index = self.keys.current_index();
                    let mut params = vec![
                        ConfigParam::ShortAddress(slot.address),
                        ConfigParam::Gmk {
                            index,
                            key: *self.keys.current(),
                        },
                    ];
                    // A rotation in flight: hand over the next key as well,
                    // activation follows once the device is registered.
                    slot.carried_pending = false;
                    if self.rekey.is_some() {
                        if let Some(key) = self.keys.pending() {
                            params.push(ConfigParam::Gmk {
                                index: self.keys.next_index(),
                                key: *key,
                            });
                            slot.carried_pending = true;
                        }
                    }
                    params.push(ConfigParam::GmkActivation { index });
                    params
                }
                _ => match self.keys.pending() {
                    Some(key) => vec![ConfigParam::Gmk {
                        index: self.keys.next_index(),
                        key: *key,
                    }],
                    None => return self.abort(idx, "no pending key to distribute"),
                },
            };
            let Some(hs) = slot.handshake.as_mut() else {
                return self.abort(idx, "no handshake context");
            };
            hs.accept_message2(&self.psk_keys, &self.server_identity, &slot.identity, payload)
                .and_then(|()| hs.message3(&self.psk_keys, &self.server_identity, &params))
                .map(|m3| (next, m3))
        };

        match outcome {
            Ok((next, m3)) => {
                let route = self.slot_route(idx);
                self.transmit(idx, MessageType::Challenge, &m3, route, next, now);
            }
            Err(e) => {
                tracing::warn!(device = %self.slots[idx].identity, error = %e, "message 2 rejected");
                self.finish(idx, false);
            }
        }
    }

    fn on_message4(&mut self, idx: usize, payload: &[u8], now: Instant) {
        let slot = &self.slots[idx];
        let Some(next) = transition(slot.phase, slot.purpose, Stimulus::Message4) else {
            return self.abort(idx, "message 4 out of sequence");
        };
        let verified = match &slot.handshake {
            Some(hs) => hs.accept_message4(payload).map(|()| hs.identifier()),
            None => return self.abort(idx, "no handshake context"),
        };
        let identifier = match verified {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(device = %slot.identity, error = %e, "message 4 rejected");
                self.finish(idx, false);
                return;
            }
        };

        match slot.purpose {
            Purpose::Join => {
                let route = self.slot_route(idx);
                let success = eap::encode_success(identifier);
                self.transmit(idx, MessageType::Accepted, &success, route, next, now);
            }
            _ => {
                tracing::debug!(device = %slot.identity, "rekey key delivered");
                self.finish(idx, true);
            }
        }
    }

    fn on_device_kick(&mut self, identity: DeviceIdentity, now: Instant) {
        match self.registry.lookup_by_identity(identity) {
            Some(address) => {
                tracing::info!(device = %identity, address = %address, "device left the network");
                self.depart(identity, address, now);
            }
            None => {
                if let Some(idx) = self.slot_of(&identity) {
                    self.finish(idx, false);
                }
                tracing::debug!(device = %identity, "kick from unregistered device");
            }
        }
    }

    // ── Confirmations and timers ──────────────────────────────────────────────

    pub fn handle_confirmation(&mut self, confirmation: &Confirmation, now: Instant) {
        let handle = confirmation.handle;
        let Some((idx, matched)) = self.correlator.locate(&self.slots, handle) else {
            tracing::debug!(handle, status = ?confirmation.status, "unmatched confirmation discarded");
            return;
        };
        let slot = &mut self.slots[idx];
        slot.confirm(matched);
        if matched == HandleMatch::Secondary {
            tracing::debug!(device = %slot.identity, handle, status = ?confirmation.status, "earlier frame confirmed");
            return;
        }
        if !confirmation.status.is_success() {
            tracing::warn!(device = %slot.identity, handle, status = ?confirmation.status, phase = ?slot.phase, "link send failed");
            self.finish(idx, false);
            self.drive_rekey(now);
            return;
        }

        match transition(slot.phase, slot.purpose, Stimulus::Confirmed) {
            Some(Phase::Idle) => self.complete(idx),
            Some(next) => {
                slot.phase = next;
                slot.deadline = Some(now + self.msg_timeout);
            }
            None => {
                tracing::debug!(device = %slot.identity, handle, phase = ?slot.phase, "confirmation ignored");
            }
        }
        self.drive_rekey(now);
    }

    /// Confirmed terminal frame: apply its effect and free the slot.
    fn complete(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        let (identity, address) = (slot.identity, slot.address);
        match slot.purpose {
            Purpose::Join => match self.registry.commit(identity, address, slot.hop_count) {
                Ok(()) => {
                    slot.reserved = false;
                    if slot.carried_pending {
                        if let Some(rekey) = self.rekey.as_mut() {
                            rekey.enroll(address, identity);
                        }
                    }
                    tracing::info!(device = %identity, address = %address, hop_count = slot.hop_count, "device joined");
                    if let Some(obs) = &self.observer {
                        obs.on_joined(identity, address);
                    }
                    self.finish(idx, true);
                }
                Err(e) => {
                    tracing::warn!(device = %identity, address = %address, error = %e, "address commit failed");
                    self.finish(idx, false);
                }
            },
            Purpose::RekeyActivate => {
                tracing::debug!(device = %identity, "rekey activation delivered");
                self.finish(idx, true);
            }
            Purpose::Decline => {
                tracing::debug!(device = %identity, "decline delivered");
                self.finish(idx, true);
            }
            Purpose::RekeyDistribute => {
                // Distribution ends on message 4, never on a confirmation.
                tracing::debug!(device = %identity, phase = ?slot.phase, "unexpected distribute completion");
                self.finish(idx, false);
            }
        }
    }

    /// Periodic sweep: retransmit or give up on slots past their deadline.
    pub fn tick(&mut self, now: Instant) {
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if slot.is_idle() || slot.deadline.map_or(true, |d| d > now) {
                continue;
            }
            if slot.pending > 0 {
                tracing::debug!(device = %slot.identity, handle = slot.handle, "confirmation overdue, presumed lost");
                slot.clear_pending();
            }
            if slot.retries < self.max_retries {
                self.retransmit(idx, now);
            } else {
                tracing::warn!(device = %slot.identity, phase = ?slot.phase, retries = slot.retries, "retries exhausted");
                self.finish(idx, false);
            }
        }
        self.drive_rekey(now);
    }

    fn retransmit(&mut self, idx: usize, now: Instant) {
        let handle = self.correlator.next_handle();
        let slot = &mut self.slots[idx];
        let next = transition(slot.phase, slot.purpose, Stimulus::Retransmit);
        let (Some(next), Some(mut request)) = (next, slot.last_request.clone()) else {
            return self.abort(idx, "nothing to retransmit");
        };
        request.handle = handle;
        slot.record_send(handle);
        slot.retries += 1;
        slot.phase = next;
        slot.deadline = Some(now + self.msg_timeout);
        slot.last_request = Some(request.clone());
        tracing::info!(device = %slot.identity, handle, retry = slot.retries, phase = ?next, "retransmitting");
        self.link.send(request);
    }

    // ── Admin ─────────────────────────────────────────────────────────────────

    /// Evict the device holding `address`.
    pub fn kick(&mut self, address: ShortAddress, now: Instant) -> Result<DeviceIdentity, EngineError> {
        let identity = self
            .extended_address(address)
            .ok_or(EngineError::UnknownAddress(address))?;
        let request = SendRequest {
            destination: LinkAddress::Short(address),
            payload: lbp::frame(MessageType::KickToDevice, &identity, LbpFlags::NONE, &[]),
            handle: self.correlator.next_handle(),
            max_hops: self.link.max_hops(),
            discover_route: true,
            qos: false,
            security_enabled: true,
        };
        self.link.send(request);
        tracing::info!(device = %identity, address = %address, "device kicked");
        self.depart(identity, address, now);
        Ok(identity)
    }

    fn depart(&mut self, identity: DeviceIdentity, address: ShortAddress, now: Instant) {
        if let Err(e) = self.registry.release(address) {
            tracing::warn!(address = %address, error = %e, "release failed");
        }
        if let Some(idx) = self.slot_of(&identity) {
            self.finish(idx, false);
        }
        if let Some(obs) = &self.observer {
            obs.on_departed(identity, address);
        }
        self.drive_rekey(now);
    }

    // ── Slot plumbing ─────────────────────────────────────────────────────────

    fn slot_of(&self, identity: &DeviceIdentity) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.is_idle() && s.identity == *identity)
    }

    fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(BootstrapSlot::is_idle)
    }

    /// Identifier for a new exchange; the exchange uses it and the next one.
    fn next_eap_identifier(&mut self) -> u8 {
        let id = self.eap_identifier;
        self.eap_identifier = self.eap_identifier.wrapping_add(2);
        id
    }

    fn response_flags(&self, inbound: LbpFlags) -> LbpFlags {
        if self.config.network.hybrid_profile {
            inbound
        } else {
            LbpFlags::NONE
        }
    }

    /// 1 for a direct neighbour, otherwise one more than the relay.
    fn hop_count(&self, source: LinkAddress) -> u8 {
        match source {
            LinkAddress::Extended(_) => 1,
            LinkAddress::Short(relay) => self
                .registry
                .lookup_by_address(relay)
                .map_or(1, |e| e.hop_count.saturating_add(1)),
        }
    }

    fn join_route(&self) -> Route {
        Route {
            max_hops: self.link.max_hops(),
            discover_route: true,
            security_enabled: false,
        }
    }

    fn slot_route(&self, idx: usize) -> Route {
        self.slots[idx]
            .last_request
            .as_ref()
            .map_or_else(|| self.join_route(), Route::of)
    }

    /// Send a new frame from slot `idx` and move it to `phase`.
    fn transmit(
        &mut self,
        idx: usize,
        kind: MessageType,
        payload: &[u8],
        route: Route,
        phase: Phase,
        now: Instant,
    ) {
        let handle = self.correlator.next_handle();
        let slot = &mut self.slots[idx];
        let request = SendRequest {
            destination: slot.destination,
            payload: lbp::frame(kind, &slot.identity, slot.flags, payload),
            handle,
            max_hops: route.max_hops,
            discover_route: route.discover_route,
            qos: false,
            security_enabled: route.security_enabled,
        };
        slot.record_send(handle);
        slot.phase = phase;
        slot.retries = 0;
        slot.deadline = Some(now + self.msg_timeout);
        slot.last_request = Some(request.clone());
        tracing::debug!(device = %slot.identity, handle, kind = ?kind, phase = ?phase, "frame sent");
        self.link.send(request);
    }

    fn send_decline(
        &mut self,
        identity: DeviceIdentity,
        destination: LinkAddress,
        flags: LbpFlags,
        now: Instant,
    ) {
        let failure = eap::encode_failure(self.next_eap_identifier());
        let route = self.join_route();
        match self.idle_slot() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.identity = identity;
                slot.purpose = Purpose::Decline;
                slot.destination = destination;
                slot.flags = flags;
                self.transmit(idx, MessageType::Decline, &failure, route, Phase::SentDeclined, now);
            }
            None => {
                let handle = self.correlator.next_handle();
                tracing::debug!(device = %identity, handle, "untracked decline");
                self.link.send(SendRequest {
                    destination,
                    payload: lbp::frame(MessageType::Decline, &identity, flags, &failure),
                    handle,
                    max_hops: route.max_hops,
                    discover_route: route.discover_route,
                    qos: false,
                    security_enabled: route.security_enabled,
                });
            }
        }
    }

    fn abort(&mut self, idx: usize, reason: &str) {
        let slot = &self.slots[idx];
        tracing::warn!(device = %slot.identity, phase = ?slot.phase, purpose = ?slot.purpose, reason, "bootstrap aborted");
        self.finish(idx, false);
    }

    /// Return slot `idx` to Idle, undoing what it held.
    fn finish(&mut self, idx: usize, success: bool) {
        let slot = &mut self.slots[idx];
        if slot.purpose == Purpose::Join && slot.reserved {
            self.registry.cancel(slot.address);
        }
        if slot.purpose.is_rekey() {
            if let Some(rekey) = self.rekey.as_mut() {
                if rekey.is_running(&slot.identity) {
                    rekey.finish(success);
                }
            }
        }
        slot.reset();
    }
}
