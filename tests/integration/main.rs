//! LBS integration test harness.
//!
//! Tests here drive a real `BootstrapEngine` against simulated devices over
//! an in-memory link. Nothing sleeps: the harness owns the clock and tests
//! advance it explicitly to trigger timeouts.
//!
//!   cargo test --test integration

mod actor;
mod failures;
mod join;
mod rekey;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use lbs_core::crypto::Psk;
use lbs_core::eap::{self, ConfigParam, EapCode};
use lbs_core::lbp::{self, Direction, LbpFlags, LbpFrame, MessageType};
use lbs_core::peer::PeerHandshake;
use lbs_core::{BootstrapConfig, DeviceIdentity, LinkAddress, ShortAddress};
use lbs_services::{
    BootstrapEvent, ChannelObserver, Confirmation, Indication, MemoryLink, SendRequest, SendStatus,
};
use lbsd::BootstrapEngine;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Hop limit the in-memory link reports.
pub const MAX_HOPS: u8 = 6;

pub struct Harness {
    pub engine: BootstrapEngine,
    pub link: Arc<MemoryLink>,
    pub events: mpsc::Receiver<BootstrapEvent>,
    pub now: Instant,
    psk: [u8; 16],
}

impl Harness {
    /// Engine with default settings adjusted by `configure`.
    pub fn new(configure: impl FnOnce(&mut BootstrapConfig)) -> Self {
        let mut config = BootstrapConfig::default();
        configure(&mut config);
        let link = Arc::new(MemoryLink::new(MAX_HOPS));
        let mut engine = BootstrapEngine::new(&config, link.clone()).expect("valid config");
        let (observer, events) = ChannelObserver::new(256);
        engine.set_observer(Arc::new(observer));
        let psk = *config.psk().expect("valid psk").as_bytes();
        Self {
            engine,
            link,
            events,
            now: Instant::now(),
            psk,
        }
    }

    /// A device that shares the coordinator's PSK.
    pub fn device(&self, n: u8) -> SimDevice {
        SimDevice::new(&Psk::new(self.psk), DeviceIdentity::new([0xD0, 0, 0, 0, 0, 0, 0, n]))
    }

    /// A device with a PSK the coordinator does not know.
    pub fn rogue(&self, n: u8) -> SimDevice {
        SimDevice::new(&Psk::new([0xEE; 16]), DeviceIdentity::new([0xBA, 0, 0, 0, 0, 0, 0, n]))
    }

    /// Everything the engine sent since the last call.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.link.take()
    }

    /// A JOINING frame from `device` carrying `payload`.
    pub fn deliver(&mut self, device: &SimDevice, payload: &[u8]) {
        let indication = Indication {
            source: device.source,
            security_enabled: false,
            link_quality: 180,
            payload: lbp::frame(MessageType::Joining, &device.identity, LbpFlags::NONE, payload),
        };
        self.engine.handle_indication(&indication, self.now);
    }

    /// A raw inbound LBP frame.
    pub fn deliver_raw(&mut self, source: LinkAddress, frame: bytes::Bytes) {
        let indication = Indication {
            source,
            security_enabled: false,
            link_quality: 180,
            payload: frame,
        };
        self.engine.handle_indication(&indication, self.now);
    }

    pub fn confirm(&mut self, request: &SendRequest) {
        self.confirm_with(request, SendStatus::Success);
    }

    pub fn confirm_with(&mut self, request: &SendRequest, status: SendStatus) {
        self.engine.handle_confirmation(
            &Confirmation {
                handle: request.handle,
                status,
            },
            self.now,
        );
    }

    /// Move the clock forward and run the periodic sweep.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.engine.tick(self.now);
    }

    /// Confirm every frame the engine sends and let `devices` answer, until
    /// the link goes quiet. Returns the frames seen, in order.
    pub fn pump(&mut self, devices: &mut [&mut SimDevice]) -> Vec<SendRequest> {
        let mut seen = Vec::new();
        for _ in 0..1000 {
            let sent = self.sent();
            if sent.is_empty() {
                return seen;
            }
            for request in sent {
                self.confirm(&request);
                let frame = lbp::decode(&request.payload, Direction::ToDevice)
                    .expect("engine sends well-formed frames");
                if let Some(device) = devices.iter_mut().find(|d| d.identity == frame.identity) {
                    if let Some(reply) = device.respond(&frame) {
                        let device: &SimDevice = device;
                        self.deliver(device, &reply);
                    }
                }
                seen.push(request);
            }
        }
        panic!("link never went quiet");
    }

    /// Run a complete join for `device`.
    pub fn join(&mut self, device: &mut SimDevice) -> Result<ShortAddress> {
        self.deliver(device, &[]);
        self.pump(&mut [&mut *device]);
        match device.address {
            Some(address) if device.accepted => Ok(address),
            _ if device.declined => bail!("{} was declined", device.identity),
            _ => bail!("{} did not finish joining", device.identity),
        }
    }

    pub fn events(&mut self) -> Vec<BootstrapEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }
}

/// Payload of an outbound frame.
pub fn eap_payload(request: &SendRequest) -> Vec<u8> {
    lbp::decode(&request.payload, Direction::ToDevice)
        .expect("well-formed frame")
        .payload
        .to_vec()
}

pub fn kind_of(request: &SendRequest) -> MessageType {
    lbp::decode(&request.payload, Direction::ToDevice)
        .expect("well-formed frame")
        .message_type
}

// ── Simulated device ──────────────────────────────────────────────────────────

/// A joining node as seen from the air: it answers CHALLENGE frames and
/// records what the coordinator told it.
pub struct SimDevice {
    pub identity: DeviceIdentity,
    pub source: LinkAddress,
    peer: PeerHandshake,
    offered: Option<ShortAddress>,
    pub address: Option<ShortAddress>,
    pub keys: [Option<[u8; 16]>; 2],
    pub active_key: Option<u8>,
    pub accepted: bool,
    pub declined: bool,
    pub kicked: bool,
    pub challenges: usize,
}

impl SimDevice {
    pub fn new(psk: &Psk, identity: DeviceIdentity) -> Self {
        Self {
            identity,
            source: LinkAddress::Extended(identity),
            peer: PeerHandshake::new(psk, identity),
            offered: None,
            address: None,
            keys: [None, None],
            active_key: None,
            accepted: false,
            declined: false,
            kicked: false,
            challenges: 0,
        }
    }

    /// Join through an already-joined relay.
    pub fn via(mut self, relay: ShortAddress) -> Self {
        self.source = LinkAddress::Short(relay);
        self
    }

    /// React to a frame addressed to this device. Returns the JOINING
    /// payload to send back, if any.
    pub fn respond(&mut self, frame: &LbpFrame<'_>) -> Option<Vec<u8>> {
        match frame.message_type {
            MessageType::Challenge => {
                self.challenges += 1;
                match eap::parse(frame.payload).ok()?.number() {
                    Some(0) => self.peer.answer_message1(frame.payload).ok(),
                    Some(2) => {
                        let (params, reply) = self.peer.answer_message3(frame.payload).ok()?;
                        self.apply(&params);
                        Some(reply)
                    }
                    _ => None,
                }
            }
            MessageType::Accepted => {
                if frame.payload.first() == Some(&(EapCode::Success as u8)) {
                    self.accepted = true;
                    self.address = self.offered;
                } else if let Ok(params) = eap::decode_params(frame.payload) {
                    self.apply(&params);
                }
                None
            }
            MessageType::Decline => {
                self.declined = true;
                None
            }
            MessageType::KickToDevice => {
                self.kicked = true;
                self.address = None;
                None
            }
            _ => None,
        }
    }

    fn apply(&mut self, params: &[ConfigParam]) {
        for p in params {
            match *p {
                ConfigParam::ShortAddress(a) => self.offered = Some(a),
                ConfigParam::Gmk { index, key } => {
                    if let Some(slot) = self.keys.get_mut(index as usize) {
                        *slot = Some(key);
                    }
                }
                ConfigParam::GmkActivation { index } => self.active_key = Some(index),
            }
        }
    }

    /// Key the device currently encrypts with.
    pub fn active(&self) -> Option<[u8; 16]> {
        self.keys[self.active_key? as usize]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The harness itself: one device joins with default settings.
#[test]
fn test_harness_single_join() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    let address = net.join(&mut dev).unwrap();
    assert_eq!(address, ShortAddress(1));
    assert_eq!(net.engine.joined_count(), 1);
    assert_eq!(dev.active(), Some(*net.engine.keys().current()));
    assert_eq!(
        net.events(),
        vec![BootstrapEvent::Joined {
            identity: dev.identity,
            address
        }]
    );
}
