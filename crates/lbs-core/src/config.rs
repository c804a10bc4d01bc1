//! Configuration system for the bootstrap server.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LBS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lbs/config.toml
//!   3. ~/.config/lbs/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::Psk;
use crate::device::DeviceIdentity;
use crate::eap::KEY_LEN;

/// Well-known development PSK. Deployments must override it.
pub const DEFAULT_PSK_HEX: &str = "ab10341145111bc3c12de8ff11142204";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub bootstrap: BootstrapSettings,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Coordinator identity (16 hex digits). Sent as ID_S in message 1.
    pub server_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the modem bridge listens on.
    pub bridge_bind: SocketAddr,
    /// UDP address of the modem adapter.
    pub modem_addr: SocketAddr,
    /// Echo media-type flags between inbound and outbound frames.
    pub hybrid_profile: bool,
    /// Default route-discovery hop limit reported by the link layer.
    pub max_hops: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// First short address handed out.
    pub short_address_base: u16,
    /// Registry and blacklist capacity.
    pub capacity: u16,
    /// Concurrent join sessions.
    pub slots: usize,
    /// Seconds to wait for a confirmation or a device reply.
    pub msg_timeout_secs: u64,
    /// Retransmissions before a slot gives up.
    pub max_retries: u8,
    /// Sweep period in milliseconds.
    pub tick_ms: u64,
    /// Automatic rekey period in seconds. 0 = off.
    pub rekey_interval_secs: u64,
    /// Derive short addresses from the device identity instead of allocating.
    pub derived_addresses: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Pre-shared key, 32 hex digits.
    pub psk: String,
    /// Initial group key, 32 hex digits. Empty = random at startup.
    pub gmk: String,
    /// Identities (hex) declined on sight.
    pub blacklist: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            bootstrap: BootstrapSettings::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_identity: "0200000000000001".into(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_bind: SocketAddr::from(([127, 0, 0, 1], 9700)),
            modem_addr: SocketAddr::from(([127, 0, 0, 1], 9701)),
            hybrid_profile: false,
            max_hops: 8,
        }
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            short_address_base: 1,
            capacity: 500,
            slots: 5,
            msg_timeout_secs: 40,
            max_retries: 1,
            tick_ms: 1000,
            rekey_interval_secs: 0,
            derived_addresses: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            psk: DEFAULT_PSK_HEX.into(),
            gmk: String::new(),
            blacklist: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lbs")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BootstrapConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BootstrapConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LBS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BootstrapConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LBS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LBS_IDENTITY__SERVER_IDENTITY") {
            self.identity.server_identity = v;
        }
        if let Ok(v) = std::env::var("LBS_NETWORK__BRIDGE_BIND") {
            if let Ok(a) = v.parse() {
                self.network.bridge_bind = a;
            }
        }
        if let Ok(v) = std::env::var("LBS_NETWORK__MODEM_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.modem_addr = a;
            }
        }
        if let Ok(v) = std::env::var("LBS_NETWORK__HYBRID_PROFILE") {
            self.network.hybrid_profile = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LBS_BOOTSTRAP__CAPACITY") {
            if let Ok(n) = v.parse() {
                self.bootstrap.capacity = n;
            }
        }
        if let Ok(v) = std::env::var("LBS_BOOTSTRAP__MSG_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.bootstrap.msg_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("LBS_BOOTSTRAP__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.bootstrap.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("LBS_BOOTSTRAP__REKEY_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.bootstrap.rekey_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("LBS_BOOTSTRAP__DERIVED_ADDRESSES") {
            self.bootstrap.derived_addresses = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LBS_SECURITY__PSK") {
            self.security.psk = v;
        }
    }

    /// Check every field that `load` cannot express through serde alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_identity()?;
        self.psk()?;
        self.gmk()?;
        self.blacklist()?;
        let b = &self.bootstrap;
        if b.capacity == 0 {
            return Err(ConfigError::Invalid("bootstrap.capacity must be non-zero".into()));
        }
        if b.slots == 0 {
            return Err(ConfigError::Invalid("bootstrap.slots must be non-zero".into()));
        }
        if b.short_address_base == 0 {
            return Err(ConfigError::Invalid(
                "bootstrap.short_address_base 0 is the unassigned address".into(),
            ));
        }
        if u32::from(b.short_address_base) + u32::from(b.capacity) > 0x8000 {
            return Err(ConfigError::Invalid(
                "short address range exceeds the unicast space".into(),
            ));
        }
        if b.tick_ms == 0 {
            return Err(ConfigError::Invalid("bootstrap.tick_ms must be non-zero".into()));
        }
        Ok(())
    }

    // ── Typed accessors ───────────────────────────────────────────────────────

    pub fn server_identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let id: DeviceIdentity = self
            .identity
            .server_identity
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("identity.server_identity: {e}")))?;
        if id.is_none() {
            return Err(ConfigError::Invalid(
                "identity.server_identity must be non-zero".into(),
            ));
        }
        Ok(id)
    }

    pub fn psk(&self) -> Result<Psk, ConfigError> {
        parse_key("security.psk", &self.security.psk).map(Psk::new)
    }

    /// Configured initial group key, `None` when left empty.
    pub fn gmk(&self) -> Result<Option<[u8; KEY_LEN]>, ConfigError> {
        if self.security.gmk.trim().is_empty() {
            return Ok(None);
        }
        parse_key("security.gmk", &self.security.gmk).map(Some)
    }

    pub fn blacklist(&self) -> Result<Vec<DeviceIdentity>, ConfigError> {
        self.security
            .blacklist
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| ConfigError::Invalid(format!("security.blacklist {s:?}: {e}")))
            })
            .collect()
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap.msg_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap.tick_ms)
    }

    /// Automatic rekey period, `None` when disabled.
    pub fn rekey_interval(&self) -> Option<Duration> {
        match self.bootstrap.rekey_interval_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

fn parse_key(field: &str, text: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    let bytes = hex::decode(text.trim())
        .map_err(|_| ConfigError::Invalid(format!("{field} is not valid hex")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ConfigError::Invalid(format!("{field} must be {KEY_LEN} bytes, got {}", b.len()))
    })
}
