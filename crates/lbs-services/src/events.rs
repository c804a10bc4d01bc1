//! Join and departure notifications.
//!
//! The engine calls the observer synchronously from inside its event
//! handling. Implementations must not block; `ChannelObserver` forwards
//! into a tokio channel for consumers that need to await.

use lbs_core::{DeviceIdentity, ShortAddress};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapEvent {
    Joined {
        identity: DeviceIdentity,
        address: ShortAddress,
    },
    Departed {
        identity: DeviceIdentity,
        address: ShortAddress,
    },
    RekeyCompleted {
        key_index: u8,
    },
}

pub trait BootstrapObserver: Send + Sync {
    /// A device finished its join and now holds `address`.
    fn on_joined(&self, identity: DeviceIdentity, address: ShortAddress);

    /// A device left or was kicked.
    fn on_departed(&self, identity: DeviceIdentity, address: ShortAddress);

    /// Every device switched to the group key at `key_index`.
    fn on_rekey_completed(&self, _key_index: u8) {}
}

/// Observer that forwards events into an mpsc channel.
pub struct ChannelObserver {
    tx: mpsc::Sender<BootstrapEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BootstrapEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn forward(&self, event: BootstrapEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(?event, error = %e, "bootstrap event dropped");
        }
    }
}

impl BootstrapObserver for ChannelObserver {
    fn on_joined(&self, identity: DeviceIdentity, address: ShortAddress) {
        self.forward(BootstrapEvent::Joined { identity, address });
    }

    fn on_departed(&self, identity: DeviceIdentity, address: ShortAddress) {
        self.forward(BootstrapEvent::Departed { identity, address });
    }

    fn on_rekey_completed(&self, key_index: u8) {
        self.forward(BootstrapEvent::RekeyCompleted { key_index });
    }
}
