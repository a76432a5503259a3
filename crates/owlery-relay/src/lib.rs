//! Owlery relay engine: multi-relay connection pool and outbox routing.
//!
//! # Modules
//!
//! - [`connection`] - Per-relay socket state machine (backoff, NIP-42 auth, send queue)
//! - [`pool`] - Connection registries and the message dispatcher
//! - [`outbox`] - NIP-65 relay-list indexing and request/publish planning
//! - [`publish`] - One-shot publish-and-confirm over a dedicated socket
//! - [`reachability`] - Device connectivity and VPN-presence transitions
//! - [`stats`] - Per-relay connection statistics
//! - [`traits`] - Event store and signer collaborator interfaces
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   transitions   ┌─────────────────────────┐
//! │  Reachability    │ ───────────────▶│  RelayConnection (xN)   │
//! └──────────────────┘                 │  socket/backoff/auth    │
//!                                      └───────────▲─────────────┘
//! ┌──────────────────┐  REQ/CLOSE/EVENT            │
//! │  ConnectionPool  │ ────────────────────────────┘
//! │  (dispatcher)    │ ──▶ penalty box ──┐
//! └────────┬─────────┘                   │
//!          │ plans                       ▼
//! ┌────────▼─────────┐  relay lists  ┌───────────────┐
//! │   OutboxRouter   │ ◀────────────│  EventStore    │
//! └──────────────────┘               └───────────────┘
//! ```
//!
//! All service objects are constructed once at startup and passed by
//! `Arc`; there is no global state.

pub mod connection;
pub mod error;
pub mod outbox;
pub mod pool;
pub mod publish;
pub mod reachability;
pub mod settings;
pub mod stats;
pub mod traits;

pub use connection::{ConnectionKind, PenaltyReason, RelayConnection};
pub use error::{Error, Result};
pub use outbox::{OutboxConfig, OutboxRouter, PeerRelayList, RelayPlan, parse_relay_list};
pub use pool::{ConnectionPool, OutgoingMessage, PoolConfig, PoolNotification};
pub use publish::{OneShotPublisher, PublishOutcome};
pub use reachability::{NetworkState, ReachabilityMonitor};
pub use settings::{EngineSettings, SharedSettings};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use traits::{EventStore, LocalSigner, MemoryEventStore, Signer};

// Re-export the core types downstream users will always need.
pub use owlery_core::{
    CanonicalRelayUrl, ClientMessage, Filter, RelayDescriptor, RelayIntent, RelayMessage,
};
