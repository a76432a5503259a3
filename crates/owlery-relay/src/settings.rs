//! Engine settings consumed from the application's settings store.
//!
//! The engine recognizes exactly three options; everything else about a
//! relay comes in through [`owlery_core::RelayDescriptor`].

use std::sync::Arc;

use parking_lot::RwLock;

/// Options consumed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Extend requests and publishes beyond the configured relay set using
    /// peers' self-declared relay preferences.
    pub enable_outbox_relays: bool,

    /// When true, additional (outbox/ephemeral) connections are only
    /// opened while a VPN/transparent proxy is detected. The explicitly
    /// configured relay set is unaffected.
    pub enable_vpn_detection: bool,

    /// Suppress outbox fan-out entirely.
    pub low_data_mode: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enable_outbox_relays: true,
            enable_vpn_detection: false,
            low_data_mode: false,
        }
    }
}

/// Shared, runtime-mutable settings handle.
pub type SharedSettings = Arc<RwLock<EngineSettings>>;

/// Wrap settings for sharing with the pool and router.
pub fn shared(settings: EngineSettings) -> SharedSettings {
    Arc::new(RwLock::new(settings))
}
