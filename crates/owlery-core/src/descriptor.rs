//! Per-relay configuration: the only externally supplied relay state.

use std::collections::HashSet;

use nostr::PublicKey;

use crate::error::Result;
use crate::url::canonical_relay_url;

/// The declared relay-intent of an outgoing frame, matched against
/// [`RelayDescriptor`] capability flags by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayIntent {
    /// Deliver to read relays (normal REQ traffic).
    Read,
    /// Deliver to read relays and search-capable relays.
    Search,
    /// Deliver to search-capable relays only.
    SearchOnly,
    /// Deliver to write relays (EVENT publishing).
    Write,
}

/// Normalized, identity-keyed relay configuration.
///
/// The canonical URL is the identity key across every connection registry;
/// it is fixed at construction. Capability flags may be upgraded at
/// runtime (a read relay can become read+write), which is why the
/// registries store descriptors behind their own locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    url: String,
    pub read: bool,
    pub write: bool,
    pub search: bool,
    pub auth: bool,
    /// Accounts forbidden from using this relay (e.g. after a rejected
    /// auth). Events authored by these keys are never published here.
    pub excluded_pubkeys: HashSet<PublicKey>,
}

impl RelayDescriptor {
    /// Build a descriptor from a raw URL, normalizing it to canonical form.
    ///
    /// All flags start false; use the builder methods. User-configured
    /// URLs are not blocklist-checked here — only outbox candidates are.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: canonical_relay_url(url)?,
            read: false,
            write: false,
            search: false,
            auth: false,
            excluded_pubkeys: HashSet::new(),
        })
    }

    /// Descriptor for an outbox/ephemeral connection: read-only, no auth.
    pub fn read_only(url: &str) -> Result<Self> {
        Ok(Self::new(url)?.read(true))
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn auth(mut self, auth: bool) -> Self {
        self.auth = auth;
        self
    }

    pub fn exclude_pubkey(mut self, pubkey: PublicKey) -> Self {
        self.excluded_pubkeys.insert(pubkey);
        self
    }

    /// Canonical URL, the identity key.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the engine should keep a standing connection here.
    pub fn should_connect(&self) -> bool {
        self.read || self.write
    }

    pub fn is_excluded(&self, pubkey: &PublicKey) -> bool {
        self.excluded_pubkeys.contains(pubkey)
    }
}
