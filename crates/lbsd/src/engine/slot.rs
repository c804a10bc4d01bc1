//! Bootstrap slots — one per concurrent join (or rekey) session.
//!
//! `transition` is the whole state machine as a pure function; the engine
//! applies its result and performs the side effects.

use std::time::Instant;

use lbs_core::lbp::LbpFlags;
use lbs_core::{DeviceIdentity, LinkAddress, ShortAddress};
use lbs_services::SendRequest;

use super::handshake::ServerHandshake;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    /// Message 1 handed to the link, confirmation pending.
    Sent1,
    /// Message 1 retransmitted after a timeout.
    WaitAck1,
    /// Message 1 confirmed, waiting for the device's message 2.
    WaitMsg2,
    Sent3,
    WaitAck3,
    WaitMsg4,
    SentAccepted,
    SentDeclined,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Idle,
        Phase::Sent1,
        Phase::WaitAck1,
        Phase::WaitMsg2,
        Phase::Sent3,
        Phase::WaitAck3,
        Phase::WaitMsg4,
        Phase::SentAccepted,
        Phase::SentDeclined,
    ];
}

/// Why a slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Join,
    Decline,
    RekeyDistribute,
    RekeyActivate,
}

impl Purpose {
    pub fn is_rekey(self) -> bool {
        matches!(self, Purpose::RekeyDistribute | Purpose::RekeyActivate)
    }
}

/// Inputs the state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stimulus {
    /// The link confirmed the slot's current frame.
    Confirmed,
    /// A verified message 2 arrived.
    Message2,
    /// A verified message 4 arrived.
    Message4,
    /// The deadline passed and a retry is allowed.
    Retransmit,
}

/// Next phase for `stimulus`, or `None` when it is not valid in `phase`.
pub fn transition(phase: Phase, purpose: Purpose, stimulus: Stimulus) -> Option<Phase> {
    use Phase::*;
    match (stimulus, phase) {
        (Stimulus::Confirmed, Sent1 | WaitAck1) => Some(WaitMsg2),
        (Stimulus::Confirmed, Sent3 | WaitAck3) => Some(WaitMsg4),
        (Stimulus::Confirmed, SentAccepted | SentDeclined) => Some(Idle),

        (Stimulus::Message2, Sent1 | WaitAck1 | WaitMsg2) => match purpose {
            Purpose::Join | Purpose::RekeyDistribute => Some(Sent3),
            _ => None,
        },
        (Stimulus::Message4, Sent3 | WaitAck3 | WaitMsg4) => match purpose {
            Purpose::Join => Some(SentAccepted),
            Purpose::RekeyDistribute => Some(Idle),
            _ => None,
        },

        (Stimulus::Retransmit, Sent1 | WaitAck1 | WaitMsg2) => Some(WaitAck1),
        (Stimulus::Retransmit, Sent3 | WaitAck3 | WaitMsg4) => Some(WaitAck3),
        (Stimulus::Retransmit, SentAccepted) => Some(SentAccepted),
        (Stimulus::Retransmit, SentDeclined) => Some(SentDeclined),

        _ => None,
    }
}

/// Which of a slot's two handles a confirmation matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMatch {
    Current,
    Secondary,
}

pub struct BootstrapSlot {
    pub identity: DeviceIdentity,
    pub phase: Phase,
    pub purpose: Purpose,
    /// Last frame sent, replayed on retransmission with a fresh handle.
    pub last_request: Option<SendRequest>,
    pub destination: LinkAddress,
    /// Address the device is joining with, or the rekey target's address.
    pub address: ShortAddress,
    /// `address` was freshly allocated and must be cancelled on failure.
    pub reserved: bool,
    pub retries: u8,
    pub deadline: Option<Instant>,
    /// Confirmations outstanding: 0, 1, or transiently 2.
    pub pending: u8,
    pub handle: u8,
    pub secondary: Option<u8>,
    pub handshake: Option<ServerHandshake>,
    pub hop_count: u8,
    pub flags: LbpFlags,
    /// Join message 3 also carried the pending key of a running rekey.
    pub carried_pending: bool,
}

impl Default for BootstrapSlot {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::NONE,
            phase: Phase::Idle,
            purpose: Purpose::Join,
            last_request: None,
            destination: LinkAddress::Short(ShortAddress::UNASSIGNED),
            address: ShortAddress::UNASSIGNED,
            reserved: false,
            retries: 0,
            deadline: None,
            pending: 0,
            handle: 0,
            secondary: None,
            handshake: None,
            hop_count: 0,
            flags: LbpFlags::NONE,
            carried_pending: false,
        }
    }
}

impl BootstrapSlot {
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    pub fn reset(&mut self) {
        *self = BootstrapSlot::default();
    }

    /// Message 3 has been built; the keys it carried are fixed.
    pub fn handshake_past_message3(&self) -> bool {
        matches!(
            self.phase,
            Phase::Sent3 | Phase::WaitAck3 | Phase::WaitMsg4 | Phase::SentAccepted
        )
    }

    /// Track a newly sent frame. An unconfirmed earlier frame keeps its
    /// handle as the secondary.
    pub fn record_send(&mut self, handle: u8) {
        if self.pending > 0 {
            self.secondary = Some(self.handle);
            self.pending = 2;
        } else {
            self.secondary = None;
            self.pending = 1;
        }
        self.handle = handle;
    }

    pub fn matches(&self, handle: u8) -> Option<HandleMatch> {
        if self.is_idle() || self.pending == 0 {
            return None;
        }
        if self.handle == handle {
            Some(HandleMatch::Current)
        } else if self.secondary == Some(handle) {
            Some(HandleMatch::Secondary)
        } else {
            None
        }
    }

    /// Account for a matched confirmation.
    pub fn confirm(&mut self, matched: HandleMatch) {
        self.pending = self.pending.saturating_sub(1);
        match matched {
            HandleMatch::Secondary => self.secondary = None,
            HandleMatch::Current => {
                if self.pending == 0 {
                    self.secondary = None;
                }
            }
        }
    }

    /// Forget outstanding confirmations; they are presumed lost.
    pub fn clear_pending(&mut self) {
        self.pending = 0;
        self.secondary = None;
    }

    pub fn status(&self, index: usize) -> SlotStatus {
        SlotStatus {
            index,
            identity: self.identity,
            phase: self.phase,
            purpose: self.purpose,
            address: self.address,
            retries: self.retries,
            pending: self.pending,
        }
    }
}

/// Read-only view of a slot for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub index: usize,
    pub identity: DeviceIdentity,
    pub phase: Phase,
    pub purpose: Purpose,
    pub address: ShortAddress,
    pub retries: u8,
    pub pending: u8,
}
