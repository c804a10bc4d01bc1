//! lbs-services — the stateful tables behind the bootstrap engine and the
//! contracts it talks through.

pub mod blacklist;
pub mod events;
pub mod keys;
pub mod link;
pub mod registry;

pub use blacklist::{Blacklist, BlacklistError};
pub use events::{BootstrapEvent, BootstrapObserver, ChannelObserver};
pub use keys::{GroupKey, KeyStore};
pub use link::{Confirmation, Indication, LinkLayer, MemoryLink, SendRequest, SendStatus};
pub use registry::{AddressMode, AddressRegistry, RegistryEntry, RegistryError};
