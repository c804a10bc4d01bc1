//! lbs-core — device addressing, LBP and EAP-PSK wire formats, handshake
//! primitives and configuration. Every other LBS crate depends on this one.

pub mod config;
pub mod crypto;
pub mod device;
pub mod eap;
pub mod lbp;
pub mod peer;

pub use config::BootstrapConfig;
pub use device::{DeviceIdentity, LinkAddress, ShortAddress};
