//! Core types for the Owlery relay engine.
//!
//! This crate is the leaf of the workspace: canonical relay URL handling,
//! NIP-01/NIP-42 wire frames, subscription filters and per-relay
//! configuration. The engine itself (connections, pool, outbox routing)
//! lives in `owlery-relay`.

pub mod descriptor;
pub mod error;
pub mod filter;
pub mod url;
pub mod wire;

pub use descriptor::{RelayDescriptor, RelayIntent};
pub use error::{Error, Result};
pub use filter::Filter;
pub use url::{NormalizeResult, canonical_relay_url, normalize_relay_url};
pub use wire::{AUTH_REQUIRED_PREFIX, ClientMessage, RelayMessage, is_auth_required};

/// Canonical relay URL: lowercased, no trailing slash. The identity key
/// for every registry and routing table in the engine.
pub type CanonicalRelayUrl = String;
