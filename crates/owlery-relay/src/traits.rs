//! Collaborator interfaces: event storage and signing.
//!
//! The engine never persists events or touches key material itself; both
//! concerns come in through these traits. Signing may be remote (bunker
//! style) and slow, so it is async and always runs off the connection
//! I/O paths.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nostr::{Event, EventId, Keys, Kind, PublicKey, UnsignedEvent};
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Local event storage, used to short-circuit network fetches and to
/// persist relay-list events for the outbox router.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn event_by_id(&self, id: &EventId) -> Result<Option<Event>>;

    /// Fetch the newest replaceable event for `(kind, pubkey)`, with an
    /// optional `d`-tag identifier for parameterized replaceable kinds.
    async fn replaceable_event(
        &self,
        kind: Kind,
        pubkey: &PublicKey,
        identifier: Option<&str>,
    ) -> Result<Option<Event>>;

    async fn save_event(&self, event: &Event) -> Result<()>;
}

/// Produces signatures for engine-generated events (NIP-42 auth).
#[async_trait]
pub trait Signer: Send + Sync {
    /// The pubkey events will be signed under.
    fn public_key(&self) -> PublicKey;

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// In-process signer backed by a local keypair.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// Throwaway keypair, good enough for relays that just want NIP-42.
    pub fn ephemeral() -> Self {
        Self::new(Keys::generate())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Signer(e.to_string()))
    }
}

/// In-memory event store for tests and for priming the router without a
/// real database behind it.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    by_id: HashMap<EventId, Event>,
    replaceable: HashMap<(u16, PublicKey, Option<String>), Event>,
}

impl MemoryEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn d_identifier(event: &Event) -> Option<String> {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|tag| tag.first().map(String::as_str) == Some("d"))
        .and_then(|tag| tag.get(1).cloned())
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn event_by_id(&self, id: &EventId) -> Result<Option<Event>> {
        Ok(self.inner.read().by_id.get(id).cloned())
    }

    async fn replaceable_event(
        &self,
        kind: Kind,
        pubkey: &PublicKey,
        identifier: Option<&str>,
    ) -> Result<Option<Event>> {
        let key = (kind.as_u16(), *pubkey, identifier.map(str::to_string));
        Ok(self.inner.read().replaceable.get(&key).cloned())
    }

    async fn save_event(&self, event: &Event) -> Result<()> {
        let mut inner = self.inner.write();
        inner.by_id.insert(event.id, event.clone());

        let key = (event.kind.as_u16(), event.pubkey, d_identifier(event));
        match inner.replaceable.get(&key) {
            Some(existing) if existing.created_at > event.created_at => {}
            _ => {
                inner.replaceable.insert(key, event.clone());
            }
        }
        Ok(())
    }
}
