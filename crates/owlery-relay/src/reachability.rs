//! Device reachability tracking.
//!
//! Platform integration (NWPathMonitor, netlink, ...) is outside the
//! engine; whatever watches the OS calls [`ReachabilityMonitor::set_online`]
//! and [`ReachabilityMonitor::set_vpn_detected`], and every relay
//! connection observes the transitions through a watch channel.

use tokio::sync::watch;

use crate::settings::EngineSettings;

/// Current device network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// Device has some route to the network.
    pub online: bool,
    /// A VPN or transparent proxy interface is active.
    pub vpn_detected: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            online: true,
            vpn_detected: false,
        }
    }
}

/// Publishes connectivity transitions to the rest of the engine.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    tx: watch::Sender<NetworkState>,
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(NetworkState::default())
    }
}

impl ReachabilityMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            changed
        });
    }

    pub fn set_vpn_detected(&self, vpn_detected: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.vpn_detected != vpn_detected;
            state.vpn_detected = vpn_detected;
            changed
        });
    }

    /// Whether *additional* (outbox/ephemeral) connections may be opened
    /// right now. The explicitly configured relay set never goes through
    /// this gate.
    pub fn allows_additional_connections(&self, settings: &EngineSettings) -> bool {
        let state = self.current();
        state.online && (!settings.enable_vpn_detection || state.vpn_detected)
    }
}
