//! Link-layer contract — what the bootstrap engine sends through and what
//! the adaptation layer below it reports back.
//!
//! The engine never blocks on the link. `send` hands a frame over and
//! returns; the outcome arrives later as a `Confirmation` carrying the same
//! handle. Inbound frames arrive as `Indication`s.

use std::sync::Mutex;

use bytes::Bytes;
use lbs_core::LinkAddress;

/// Outbound frame handed to the link layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub destination: LinkAddress,
    pub payload: Bytes,
    /// Correlates the later `Confirmation`.
    pub handle: u8,
    pub max_hops: u8,
    pub discover_route: bool,
    /// High-priority channel access.
    pub qos: bool,
    pub security_enabled: bool,
}

/// Inbound frame from a device or relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    pub source: LinkAddress,
    pub security_enabled: bool,
    pub link_quality: u8,
    pub payload: Bytes,
}

/// Outcome of an earlier `SendRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub handle: u8,
    pub status: SendStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    NoAck,
    ChannelAccessFailure,
    RouteError,
    /// Any other non-zero status reported by the modem.
    Failed(u8),
}

impl SendStatus {
    pub fn is_success(self) -> bool {
        self == SendStatus::Success
    }

    pub fn code(self) -> u8 {
        match self {
            SendStatus::Success => 0,
            SendStatus::NoAck => 1,
            SendStatus::ChannelAccessFailure => 2,
            SendStatus::RouteError => 3,
            SendStatus::Failed(c) => c,
        }
    }
}

impl From<u8> for SendStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => SendStatus::Success,
            1 => SendStatus::NoAck,
            2 => SendStatus::ChannelAccessFailure,
            3 => SendStatus::RouteError,
            c => SendStatus::Failed(c),
        }
    }
}

/// The adaptation layer beneath the engine.
pub trait LinkLayer: Send + Sync {
    /// Hand a frame to the link. Fire and forget.
    fn send(&self, request: SendRequest);

    /// Hop limit used for frames routed to joined devices.
    fn max_hops(&self) -> u8;
}

/// In-memory link that records every request. Used by simulations and tests.
pub struct MemoryLink {
    sent: Mutex<Vec<SendRequest>>,
    max_hops: u8,
}

impl MemoryLink {
    pub fn new(max_hops: u8) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            max_hops,
        }
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<SendRequest> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LinkLayer for MemoryLink {
    fn send(&self, request: SendRequest) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }

    fn max_hops(&self) -> u8 {
        self.max_hops
    }
}
