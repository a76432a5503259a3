//! Connection registry and dispatcher.
//!
//! The pool is the single entry point for outgoing protocol traffic. It
//! owns four disjoint connection sets:
//!
//! - **primary**: the user's explicitly configured relays
//! - **outbox**: relays opened by the outbox extension
//! - **ephemeral**: short-lived one-off fetch connections
//! - **service**: signer/wallet relays with their own dispatch rules
//!
//! REQ/CLOSE/EVENT frames fan out according to capability flags and the
//! frame's declared intent; the outbox router extends requests beyond the
//! configured set when settings and network conditions allow. Misbehaving
//! discovered relays land in the penalty box and are excluded from outbox
//! routing for the life of the process.
//!
//! The primary/outbox/service registries share one read-concurrent /
//! write-exclusive lock; ephemeral connections are created from
//! user-interaction paths and get their own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use nostr::{Event, EventId, PublicKey};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};

use owlery_core::{
    CanonicalRelayUrl, ClientMessage, Filter, RelayDescriptor, RelayIntent, RelayMessage,
    canonical_relay_url,
};

use crate::connection::{ConnectionKind, PenaltyReason, PoolSignals, RelayConnection};
use crate::error::{Error, Result};
use crate::outbox::OutboxRouter;
use crate::reachability::ReachabilityMonitor;
use crate::settings::SharedSettings;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::traits::Signer;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of the notification broadcast channel.
    pub notification_buffer: usize,
    /// How often the keepalive tick runs.
    pub keepalive_interval: Duration,
    /// A connection with nothing received for this long gets pinged.
    pub stale_after: Duration,
    /// Ephemeral connections are torn down after this delay if unused.
    pub ephemeral_unused_timeout: Duration,
    /// How often the eviction sweep wakes up.
    pub sweep_interval: Duration,
    /// Probability that a given sweep tick actually sweeps.
    pub sweep_chance: f64,
    /// Idle+disconnected threshold for evicting ephemeral connections.
    pub ephemeral_idle_timeout: Duration,
    /// Idle+disconnected threshold for evicting outbox connections.
    pub outbox_idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            notification_buffer: 4096,
            keepalive_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(45),
            ephemeral_unused_timeout: Duration::from_secs(35),
            sweep_interval: Duration::from_secs(30),
            sweep_chance: 0.1,
            ephemeral_idle_timeout: Duration::from_secs(5 * 60),
            outbox_idle_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Everything the pool surfaces to the application.
#[derive(Debug, Clone)]
pub enum PoolNotification {
    /// An inbound protocol frame from a relay. The same subscription id
    /// may deliver the same event from several relays; consumers
    /// deduplicate by event id.
    Message {
        relay_url: CanonicalRelayUrl,
        message: RelayMessage,
    },
    Connected {
        relay_url: CanonicalRelayUrl,
    },
    Disconnected {
        relay_url: CanonicalRelayUrl,
    },
}

/// An outgoing frame plus its dispatch directives.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    message: ClientMessage,
    intent: RelayIntent,
    relays: Vec<CanonicalRelayUrl>,
    account_pubkey: Option<PublicKey>,
    restricted_relay: Option<CanonicalRelayUrl>,
    service_only: bool,
}

impl OutgoingMessage {
    /// A subscription request for read relays.
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            message: ClientMessage::req(subscription_id, filters),
            intent: RelayIntent::Read,
            relays: Vec::new(),
            account_pubkey: None,
            restricted_relay: None,
            service_only: false,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self {
            message: ClientMessage::close(subscription_id),
            intent: RelayIntent::Read,
            relays: Vec::new(),
            account_pubkey: None,
            restricted_relay: None,
            service_only: false,
        }
    }

    /// Publish an event to write relays.
    pub fn publish(event: Event) -> Self {
        Self {
            message: ClientMessage::event(event),
            intent: RelayIntent::Write,
            relays: Vec::new(),
            account_pubkey: None,
            restricted_relay: None,
            service_only: false,
        }
    }

    pub fn intent(mut self, intent: RelayIntent) -> Self {
        self.intent = intent;
        self
    }

    /// Limit delivery to the given relays (plus intent checks).
    pub fn to_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    /// The account publishing this frame, checked against per-relay
    /// exclusion lists.
    pub fn from_account(mut self, pubkey: PublicKey) -> Self {
        self.account_pubkey = Some(pubkey);
        self
    }

    /// Restricted post: deliver only to this relay, regardless of its
    /// general write flag.
    pub fn restricted_to(mut self, relay_url: impl Into<String>) -> Self {
        self.restricted_relay = Some(relay_url.into());
        self
    }

    /// Route to the signer/wallet service relays instead of the normal
    /// pools.
    pub fn service_only(mut self) -> Self {
        self.service_only = true;
        self
    }
}

#[derive(Default)]
struct Registry {
    primary: HashMap<CanonicalRelayUrl, Arc<RelayConnection>>,
    outbox: HashMap<CanonicalRelayUrl, Arc<RelayConnection>>,
    service: HashMap<CanonicalRelayUrl, Arc<RelayConnection>>,
}

impl Registry {
    fn standing(&self) -> Vec<(ConnectionKind, Arc<RelayConnection>)> {
        let mut all = Vec::with_capacity(self.primary.len() + self.outbox.len() + self.service.len());
        all.extend(
            self.primary
                .values()
                .map(|c| (ConnectionKind::Primary, Arc::clone(c))),
        );
        all.extend(
            self.outbox
                .values()
                .map(|c| (ConnectionKind::Outbox, Arc::clone(c))),
        );
        all.extend(
            self.service
                .values()
                .map(|c| (ConnectionKind::Service, Arc::clone(c))),
        );
        all
    }
}

/// Connection registry and message dispatcher.
pub struct ConnectionPool {
    config: PoolConfig,
    settings: SharedSettings,
    reachability: Arc<ReachabilityMonitor>,
    router: Arc<OutboxRouter>,
    signer: Option<Arc<dyn Signer>>,
    registry: RwLock<Registry>,
    ephemeral: RwLock<HashMap<CanonicalRelayUrl, Arc<RelayConnection>>>,
    penalty_box: RwLock<HashSet<CanonicalRelayUrl>>,
    /// URLs promoted into the explicit relay set; barred from the penalty
    /// box for the life of the process.
    penalty_blocked: RwLock<HashSet<CanonicalRelayUrl>>,
    stats: RwLock<HashMap<CanonicalRelayUrl, Arc<ConnectionStats>>>,
    notifications: broadcast::Sender<PoolNotification>,
    signals: Arc<PoolSignals>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        settings: SharedSettings,
        reachability: Arc<ReachabilityMonitor>,
        router: Arc<OutboxRouter>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(config.notification_buffer);
        let (penalty_tx, penalty_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            config,
            settings,
            reachability,
            router,
            signer,
            registry: RwLock::new(Registry::default()),
            ephemeral: RwLock::new(HashMap::new()),
            penalty_box: RwLock::new(HashSet::new()),
            penalty_blocked: RwLock::new(HashSet::new()),
            stats: RwLock::new(HashMap::new()),
            notifications,
            signals: PoolSignals::new(penalty_tx),
        });
        pool.spawn_background_tasks(penalty_rx);
        pool
    }

    /// Subscribe to inbound frames and lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolNotification> {
        self.notifications.subscribe()
    }

    // ─── relay management ───────────────────────────────────────────────

    /// Add (or update) a relay in the user's explicit set.
    ///
    /// Promoting a URL the outbox machinery had penalty-boxed clears that
    /// entry and bars the URL from ever re-entering the box.
    pub fn add_relay(&self, descriptor: RelayDescriptor) -> Arc<RelayConnection> {
        let url = descriptor.url().to_string();

        self.penalty_blocked.write().insert(url.clone());
        let was_boxed = self.penalty_box.write().remove(&url);
        if was_boxed {
            tracing::info!(relay = %url, "promoted out of penalty box");
            self.router.set_penalty_box(self.penalty_box.read().clone());
        }

        // Promotion supersedes any outbox connection to the same URL.
        let displaced = self.registry.write().outbox.remove(&url);
        if let Some(old) = displaced {
            old.disconnect();
        }

        if let Some(existing) = self.registry.read().primary.get(&url) {
            let updated = descriptor;
            existing.update_descriptor(move |current| *current = updated);
            return Arc::clone(existing);
        }

        let connection = self.spawn_connection(descriptor, ConnectionKind::Primary);
        self.registry
            .write()
            .primary
            .insert(url, Arc::clone(&connection));
        connection
    }

    /// Add a signer/wallet service relay.
    pub fn add_service_relay(&self, descriptor: RelayDescriptor) -> Arc<RelayConnection> {
        let url = descriptor.url().to_string();
        if let Some(existing) = self.registry.read().service.get(&url) {
            return Arc::clone(existing);
        }
        let connection = self.spawn_connection(descriptor, ConnectionKind::Service);
        self.registry
            .write()
            .service
            .insert(url, Arc::clone(&connection));
        connection
    }

    /// Remove a relay from the explicit set. Its stats accumulator is
    /// reset but stays registered.
    pub fn remove_relay(&self, url: &str) {
        let removed = self.registry.write().primary.remove(url);
        if let Some(connection) = removed {
            connection.disconnect();
            connection.stats().reset();
            tracing::info!(relay = %url, "removed relay");
        }
    }

    /// Look a connection up across all four sets.
    pub fn connection_by_url(&self, url: &str) -> Option<Arc<RelayConnection>> {
        let registry = self.registry.read();
        registry
            .primary
            .get(url)
            .or_else(|| registry.outbox.get(url))
            .or_else(|| registry.service.get(url))
            .cloned()
            .or_else(|| self.ephemeral.read().get(url).cloned())
    }

    /// Connect every standing relay that wants a connection.
    pub fn connect_all(&self) {
        for (_, connection) in self.registry.read().standing() {
            if connection.descriptor().should_connect() && !connection.is_connected() {
                connection.connect();
            }
        }
    }

    pub fn disconnect_all(&self) {
        for (_, connection) in self.registry.read().standing() {
            connection.disconnect();
        }
        for connection in self.ephemeral.read().values() {
            connection.disconnect();
        }
    }

    pub fn any_connected(&self) -> bool {
        self.signals.any_connected()
    }

    // ─── dispatch ───────────────────────────────────────────────────────

    /// Fan an outgoing frame out to every eligible connection.
    pub fn send_message(&self, outgoing: OutgoingMessage) {
        let connections = self.registry.read().standing();

        match &outgoing.message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                self.dispatch_req(&outgoing, subscription_id, filters, &connections);
            }
            ClientMessage::Close { subscription_id } => {
                self.dispatch_close(&outgoing, subscription_id, &connections);
            }
            ClientMessage::Event { event } => {
                self.dispatch_event(&outgoing, event, &connections);
            }
            ClientMessage::Auth { .. } => {
                // Auth frames are connection-internal; they never fan out.
                tracing::warn!("ignoring AUTH frame handed to the dispatcher");
            }
        }
    }

    fn dispatch_req(
        &self,
        outgoing: &OutgoingMessage,
        subscription_id: &str,
        filters: &[Filter],
        connections: &[(ConnectionKind, Arc<RelayConnection>)],
    ) {
        let frame = outgoing.message.to_json();

        for (kind, connection) in connections {
            if *kind == ConnectionKind::Service {
                if !outgoing.service_only {
                    continue;
                }
                // Service subscriptions are replaced, not deduplicated.
                if !connection.is_connected() && !connection.is_connecting() {
                    connection.connect();
                }
                connection.add_subscription(subscription_id.to_string());
                connection.send(frame.clone());
                continue;
            }
            if outgoing.service_only {
                continue;
            }

            let descriptor = connection.descriptor();
            let explicit = outgoing.relays.iter().any(|url| url == connection.url());
            if !outgoing.relays.is_empty() && !explicit {
                continue;
            }
            let eligible = match outgoing.intent {
                RelayIntent::Read => descriptor.read || explicit,
                RelayIntent::Search => descriptor.read || descriptor.search || explicit,
                RelayIntent::SearchOnly => descriptor.search,
                RelayIntent::Write => descriptor.write || explicit,
            };
            if !eligible {
                continue;
            }

            // Idempotent re-subscribe: the connection's active set is
            // authoritative.
            if connection.has_subscription(subscription_id) {
                tracing::debug!(
                    relay = %connection.url(),
                    subscription_id,
                    "subscription already active, skipping"
                );
                continue;
            }
            connection.add_subscription(subscription_id.to_string());

            if !connection.is_connected() && !connection.is_connecting() {
                connection.connect();
            }
            connection.send(frame.clone());
        }

        if !outgoing.service_only {
            self.extend_request(subscription_id, filters);
        }
    }

    fn dispatch_close(
        &self,
        outgoing: &OutgoingMessage,
        subscription_id: &str,
        connections: &[(ConnectionKind, Arc<RelayConnection>)],
    ) {
        let frame = outgoing.message.to_json();

        for (kind, connection) in connections {
            if (*kind == ConnectionKind::Service) != outgoing.service_only {
                continue;
            }
            // Local bookkeeping goes away immediately; the frame is only
            // worth sending where the subscription was actually open.
            if connection.remove_subscription(subscription_id)
                && (connection.is_connected() || connection.is_connecting())
            {
                tracing::debug!(relay = %connection.url(), subscription_id, "closing subscription");
                connection.send(frame.clone());
            }
        }
    }

    fn dispatch_event(
        &self,
        outgoing: &OutgoingMessage,
        event: &Event,
        connections: &[(ConnectionKind, Arc<RelayConnection>)],
    ) {
        let frame = outgoing.message.to_json();

        // Restricted post: one specific relay, write flag or not.
        if let Some(target) = &outgoing.restricted_relay {
            let connection = self
                .connection_by_url(target)
                .or_else(|| self.ensure_outbox_connection(target, false, true));
            match connection {
                Some(connection) => {
                    if !connection.is_connected() && !connection.is_connecting() {
                        connection.connect();
                    }
                    connection.send(frame);
                }
                None => {
                    tracing::warn!(relay = %target, "restricted post target unavailable");
                }
            }
            return;
        }

        for (kind, connection) in connections {
            if (*kind == ConnectionKind::Service) != outgoing.service_only {
                continue;
            }
            let descriptor = connection.descriptor();
            let explicit = outgoing.relays.iter().any(|url| url == connection.url());
            if !outgoing.relays.is_empty() && !explicit {
                continue;
            }
            if *kind != ConnectionKind::Service && !descriptor.write && !explicit {
                continue;
            }
            if let Some(account) = &outgoing.account_pubkey
                && descriptor.is_excluded(account)
            {
                tracing::debug!(
                    relay = %connection.url(),
                    account = %account,
                    "account excluded from relay, not publishing"
                );
                continue;
            }

            if !connection.is_connected() && !connection.is_connecting() {
                connection.connect();
            }
            tracing::debug!(relay = %connection.url(), event_id = %event.id, "publishing");
            connection.send(frame.clone());
        }

        if !outgoing.service_only {
            self.extend_publish(event, &frame);
        }
    }

    // ─── outbox extension ───────────────────────────────────────────────

    fn outbox_allowed(&self) -> bool {
        let settings = *self.settings.read();
        settings.enable_outbox_relays
            && !settings.low_data_mode
            && self.reachability.allows_additional_connections(&settings)
    }

    /// Extend an author-filtered REQ to the authors' declared write
    /// relays, beyond what the local read set already covers.
    fn extend_request(&self, subscription_id: &str, filters: &[Filter]) {
        if !self.outbox_allowed() {
            return;
        }
        let own_read = self.primary_urls(|descriptor| descriptor.read);

        for filter in filters {
            let Some(authors) = &filter.authors else {
                continue;
            };
            let authors: Vec<String> = authors.iter().cloned().collect();
            let plans = self.router.create_request_plan(&authors, &own_read, filter);

            for plan in plans {
                let Some(connection) = self.ensure_outbox_connection(&plan.relay_url, true, false)
                else {
                    continue;
                };
                if connection.has_subscription(subscription_id) {
                    continue;
                }
                connection.add_subscription(subscription_id.to_string());

                let plan_filter = plan.filter.unwrap_or_else(|| filter.without_hashtags());
                let frame =
                    ClientMessage::req(subscription_id.to_string(), vec![plan_filter]).to_json();
                if !connection.is_connected() && !connection.is_connecting() {
                    connection.connect();
                }
                tracing::debug!(
                    relay = %connection.url(),
                    subscription_id,
                    pubkeys = plan.pubkeys.len(),
                    "outbox request extension"
                );
                connection.send(frame);
            }
        }
    }

    /// Extend an EVENT with recipient tags to the recipients' declared
    /// read relays, beyond what the local write set already covers.
    fn extend_publish(&self, event: &Event, frame: &str) {
        if !self.outbox_allowed() {
            return;
        }
        let recipients = tagged_pubkeys(event);
        if recipients.is_empty() {
            return;
        }
        let own_write = self.primary_urls(|descriptor| descriptor.write);
        let plans = self.router.create_write_plan(&recipients, &own_write);

        for plan in plans {
            let Some(connection) = self.ensure_outbox_connection(&plan.relay_url, false, true)
            else {
                continue;
            };
            if !connection.is_connected() && !connection.is_connecting() {
                connection.connect();
            }
            tracing::debug!(
                relay = %connection.url(),
                event_id = %event.id,
                "outbox publish extension"
            );
            connection.send(frame.to_string());
        }
    }

    fn primary_urls(&self, select: impl Fn(&RelayDescriptor) -> bool) -> HashSet<CanonicalRelayUrl> {
        self.registry
            .read()
            .primary
            .values()
            .filter(|connection| select(&connection.descriptor()))
            .map(|connection| connection.url().to_string())
            .collect()
    }

    /// Get or create an outbox connection, upgrading capability flags on
    /// reuse. Penalty-boxed relays are never connected to.
    fn ensure_outbox_connection(
        &self,
        url: &str,
        read: bool,
        write: bool,
    ) -> Option<Arc<RelayConnection>> {
        if self.penalty_box.read().contains(url) {
            tracing::debug!(relay = %url, "penalty-boxed, not connecting");
            counter!("penaltybox_skips_total").increment(1);
            return None;
        }

        {
            let registry = self.registry.read();
            if let Some(connection) = registry.primary.get(url) {
                return Some(Arc::clone(connection));
            }
            if let Some(connection) = registry.outbox.get(url) {
                connection.update_descriptor(|descriptor| {
                    descriptor.read |= read;
                    descriptor.write |= write;
                });
                return Some(Arc::clone(connection));
            }
        }

        let descriptor = match RelayDescriptor::new(url) {
            Ok(descriptor) => descriptor.read(read).write(write),
            Err(error) => {
                tracing::debug!(relay = %url, %error, "invalid outbox relay url");
                return None;
            }
        };
        let connection = self.spawn_connection(descriptor, ConnectionKind::Outbox);
        self.registry
            .write()
            .outbox
            .insert(url.to_string(), Arc::clone(&connection));
        counter!("outbox_connections_opened_total").increment(1);
        Some(connection)
    }

    // ─── ephemeral connections ──────────────────────────────────────────

    /// Open a short-lived connection for a one-off fetch, sending `frame`
    /// once connected. Torn down automatically if unused.
    pub fn open_ephemeral(
        self: &Arc<Self>,
        url: &str,
        frame: String,
    ) -> Result<Arc<RelayConnection>> {
        if !self.reachability.is_online() {
            return Err(Error::Offline);
        }
        let settings = *self.settings.read();
        if !self.reachability.allows_additional_connections(&settings) {
            return Err(Error::Suppressed);
        }

        let canonical = canonical_relay_url(url)?;
        if self.penalty_box.read().contains(&canonical) {
            return Err(Error::PenaltyBoxed(canonical));
        }

        if let Some(existing) = self.ephemeral.read().get(&canonical) {
            existing.send(frame);
            return Ok(Arc::clone(existing));
        }

        let descriptor = RelayDescriptor::new(&canonical)?.read(true).search(true);
        let connection = self.spawn_connection(descriptor, ConnectionKind::Ephemeral);
        self.ephemeral
            .write()
            .insert(canonical.clone(), Arc::clone(&connection));
        connection.connect();
        connection.send(frame);

        let weak = Arc::downgrade(self);
        let timeout = self.config.ephemeral_unused_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = weak.upgrade() {
                pool.expire_ephemeral(&canonical);
            }
        });

        Ok(connection)
    }

    /// Follow a relay hint embedded in an event reference: one-off fetch
    /// of a single event id from the hinted relay.
    ///
    /// The event store is consulted first; returns `true` when the event
    /// was already local and no connection was opened.
    pub async fn fetch_event_from_hint(
        self: &Arc<Self>,
        event_id: &str,
        relay_hint: &str,
    ) -> Result<bool> {
        if let Ok(id) = EventId::from_hex(event_id)
            && self.router.store().event_by_id(&id).await?.is_some()
        {
            tracing::debug!(event_id, "event already stored, skipping hint fetch");
            return Ok(true);
        }

        let subscription_id = format!("HINT-{}", &event_id[..event_id.len().min(16)]);
        let filter = Filter::new().ids([event_id]).limit(1);
        let frame = ClientMessage::req(subscription_id, vec![filter]).to_json();
        self.open_ephemeral(relay_hint, frame)?;
        Ok(false)
    }

    fn expire_ephemeral(&self, url: &str) {
        let mut ephemeral = self.ephemeral.write();
        // Anything received means the fetch is in flight; the sweep
        // handles those later.
        let unused = ephemeral
            .get(url)
            .is_some_and(|connection| connection.last_received().is_none());
        if unused && let Some(connection) = ephemeral.remove(url) {
            tracing::info!(relay = %url, "removing unused ephemeral relay");
            connection.disconnect();
        }
    }

    // ─── penalty box ────────────────────────────────────────────────────

    fn penalty_box_insert(&self, url: CanonicalRelayUrl, reason: PenaltyReason) {
        if self.penalty_blocked.read().contains(&url) {
            return;
        }
        // Explicitly configured relays are never boxed, whatever the
        // error count says.
        if self.registry.read().primary.contains_key(&url) {
            return;
        }
        let inserted = self.penalty_box.write().insert(url.clone());
        if !inserted {
            return;
        }

        tracing::warn!(relay = %url, ?reason, "penalty-boxing relay");
        counter!("penaltybox_insertions_total").increment(1);
        gauge!("penaltybox_size").set(self.penalty_box.read().len() as f64);
        self.router.set_penalty_box(self.penalty_box.read().clone());

        let dropped = self.registry.write().outbox.remove(&url);
        if let Some(connection) = dropped {
            connection.disconnect();
        }
        let dropped = self.ephemeral.write().remove(&url);
        if let Some(connection) = dropped {
            connection.disconnect();
        }
    }

    /// Explicitly release a relay from the penalty box.
    pub fn remove_from_penalty_box(&self, url: &str) {
        if self.penalty_box.write().remove(url) {
            tracing::info!(relay = %url, "released from penalty box");
            self.router.set_penalty_box(self.penalty_box.read().clone());
        }
    }

    pub fn penalty_box(&self) -> HashSet<CanonicalRelayUrl> {
        self.penalty_box.read().clone()
    }

    // ─── stats ──────────────────────────────────────────────────────────

    pub fn stats_snapshot(&self) -> HashMap<CanonicalRelayUrl, StatsSnapshot> {
        self.stats
            .read()
            .iter()
            .map(|(url, stats)| (url.clone(), stats.snapshot()))
            .collect()
    }

    // ─── internals ──────────────────────────────────────────────────────

    fn spawn_connection(
        &self,
        descriptor: RelayDescriptor,
        kind: ConnectionKind,
    ) -> Arc<RelayConnection> {
        let url = descriptor.url().to_string();
        let stats = Arc::clone(self.stats.write().entry(url).or_default());
        RelayConnection::spawn(
            descriptor,
            kind,
            Arc::clone(&self.signals),
            stats,
            self.reachability.subscribe(),
            self.notifications.clone(),
            self.signer.clone(),
        )
    }

    fn spawn_background_tasks(
        self: &Arc<Self>,
        mut penalty_rx: mpsc::UnboundedReceiver<(CanonicalRelayUrl, PenaltyReason)>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((url, reason)) = penalty_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                pool.penalty_box_insert(url, reason);
            }
        });

        let weak = Arc::downgrade(self);
        let keepalive_interval = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.keepalive_tick();
            }
        });

        let weak = Arc::downgrade(self);
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.sweep_tick();
            }
        });
    }

    /// Reconnect dropped primary relays; ping anything quiet for too
    /// long. A ping that never pongs surfaces as a connection error on
    /// the next tick.
    fn keepalive_tick(&self) {
        if !self.reachability.is_online() {
            return;
        }
        for (kind, connection) in self.registry.read().standing() {
            match kind {
                ConnectionKind::Primary => {
                    if !connection.descriptor().should_connect() {
                        continue;
                    }
                    if !connection.is_connected() {
                        if !connection.is_connecting() {
                            connection.connect();
                        }
                    } else if let Some(at) = connection.last_received()
                        && at.elapsed() >= self.config.stale_after
                    {
                        tracing::debug!(relay = %connection.url(), "stale, sending ping");
                        connection.ping();
                    }
                }
                ConnectionKind::Outbox => {
                    // Outbox connections are not auto-reconnected; they
                    // age out through the sweep once dropped.
                    if connection.is_connected()
                        && let Some(at) = connection.last_received()
                        && at.elapsed() >= self.config.stale_after
                    {
                        connection.ping();
                    }
                }
                _ => {}
            }
        }
    }

    /// Randomized eviction sweep bounding socket/memory growth from
    /// outbox and ephemeral connections.
    fn sweep_tick(&self) {
        gauge!("penaltybox_size").set(self.penalty_box.read().len() as f64);

        if !rand::thread_rng().gen_bool(self.config.sweep_chance) {
            return;
        }

        let expired: Vec<CanonicalRelayUrl> = self
            .ephemeral
            .read()
            .iter()
            .filter(|(_, connection)| {
                !connection.is_connected()
                    && connection.idle_duration() >= self.config.ephemeral_idle_timeout
            })
            .map(|(url, _)| url.clone())
            .collect();
        for url in expired {
            if let Some(connection) = self.ephemeral.write().remove(&url) {
                tracing::info!(relay = %url, "evicting stale ephemeral connection");
                connection.disconnect();
                counter!("relay_evictions_total", "pool" => "ephemeral").increment(1);
            }
        }

        let expired: Vec<CanonicalRelayUrl> = self
            .registry
            .read()
            .outbox
            .iter()
            .filter(|(_, connection)| {
                !connection.is_connected()
                    && connection.idle_duration() >= self.config.outbox_idle_timeout
            })
            .map(|(url, _)| url.clone())
            .collect();
        for url in expired {
            if let Some(connection) = self.registry.write().outbox.remove(&url) {
                tracing::info!(relay = %url, "evicting stale outbox connection");
                connection.disconnect();
                counter!("relay_evictions_total", "pool" => "outbox").increment(1);
            }
        }
    }
}

/// Pubkeys tagged as recipients (`p` tags) of an event.
fn tagged_pubkeys(event: &Event) -> Vec<String> {
    let mut seen = HashSet::new();
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .filter(|tag| tag.first().map(String::as_str) == Some("p"))
        .filter_map(|tag| tag.get(1).cloned())
        .filter(|pubkey| seen.insert(pubkey.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxConfig;
    use crate::settings::{EngineSettings, shared};
    use crate::traits::{LocalSigner, MemoryEventStore};
    use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};

    fn test_pool(settings: EngineSettings) -> (Arc<ConnectionPool>, Arc<OutboxRouter>) {
        let router = OutboxRouter::new(OutboxConfig::default(), MemoryEventStore::new());
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            shared(settings),
            Arc::new(ReachabilityMonitor::default()),
            Arc::clone(&router),
            Some(Arc::new(LocalSigner::ephemeral())),
        );
        (pool, router)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn relay_list(keys: &Keys, urls: &[(&str, &str)]) -> Event {
        let tags: Vec<Tag> = urls
            .iter()
            .map(|(url, marker)| Tag::parse(["r", url, marker]).unwrap())
            .collect();
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(keys)
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_req_produces_single_frame() {
        let (pool, _router) = test_pool(EngineSettings::default());
        // Unroutable port: the connection queues frames and stays down.
        let connection = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .read(true),
        );

        let filters = vec![Filter::new().kinds([1])];
        pool.send_message(OutgoingMessage::req("sub-1", filters.clone()));
        pool.send_message(OutgoingMessage::req("sub-1", filters));

        assert!(connection.has_subscription("sub-1"));
        wait_for(|| connection.pending_messages() == 1).await;
        // Give the actor a chance to process any (wrong) second frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.pending_messages(), 1);
    }

    #[tokio::test]
    async fn test_close_only_where_subscription_was_open() {
        let (pool, _router) = test_pool(EngineSettings::default());
        let with_sub = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .read(true),
        );
        let without_sub = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:19")
                .unwrap()
                .read(true),
        );
        without_sub.update_descriptor(|descriptor| descriptor.read = false);

        pool.send_message(OutgoingMessage::req("sub-1", vec![Filter::new().kinds([1])]));
        assert!(with_sub.has_subscription("sub-1"));
        assert!(!without_sub.has_subscription("sub-1"));

        pool.send_message(OutgoingMessage::close("sub-1"));
        assert!(!with_sub.has_subscription("sub-1"));
    }

    #[tokio::test]
    async fn test_event_respects_write_flag_and_exclusions() {
        let (pool, _router) = test_pool(EngineSettings::default());
        let keys = Keys::generate();
        let excluded = Keys::generate();

        let writable = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .write(true),
        );
        let read_only = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:19")
                .unwrap()
                .read(true),
        );
        let excluding = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:29")
                .unwrap()
                .write(true)
                .exclude_pubkey(excluded.public_key()),
        );

        let event = EventBuilder::text_note("hi").sign_with_keys(&keys).unwrap();
        pool.send_message(
            OutgoingMessage::publish(event).from_account(excluded.public_key()),
        );

        wait_for(|| writable.pending_messages() == 1).await;
        assert_eq!(read_only.pending_messages(), 0);
        assert_eq!(excluding.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_outbox_extension_opens_tagged_connection() {
        let (pool, router) = test_pool(EngineSettings::default());
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://alice.example.com", "write")]))
            .await
            .unwrap();

        let filters = vec![Filter::new().authors([alice.public_key().to_hex()])];
        pool.send_message(OutgoingMessage::req("follow", filters));

        let connection = pool
            .connection_by_url("wss://alice.example.com")
            .expect("outbox connection opened");
        assert_eq!(connection.kind(), ConnectionKind::Outbox);
        assert!(connection.has_subscription("follow"));
    }

    #[tokio::test]
    async fn test_low_data_mode_suppresses_outbox() {
        let settings = EngineSettings {
            low_data_mode: true,
            ..Default::default()
        };
        let (pool, router) = test_pool(settings);
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://alice.example.com", "write")]))
            .await
            .unwrap();

        pool.send_message(OutgoingMessage::req(
            "follow",
            vec![Filter::new().authors([alice.public_key().to_hex()])],
        ));
        assert!(pool.connection_by_url("wss://alice.example.com").is_none());
    }

    #[tokio::test]
    async fn test_vpn_gate_suppresses_outbox_but_not_primary() {
        let settings = EngineSettings {
            enable_vpn_detection: true,
            ..Default::default()
        };
        let (pool, router) = test_pool(settings);
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://alice.example.com", "write")]))
            .await
            .unwrap();

        let primary = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .read(true),
        );
        pool.send_message(OutgoingMessage::req(
            "follow",
            vec![Filter::new().authors([alice.public_key().to_hex()])],
        ));

        // Primary delivery proceeds; the outbox extension does not.
        assert!(primary.has_subscription("follow"));
        assert!(pool.connection_by_url("wss://alice.example.com").is_none());
    }

    #[tokio::test]
    async fn test_penalty_boxed_relay_never_outbox_connected() {
        let (pool, router) = test_pool(EngineSettings::default());
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://flaky.example.com", "write")]))
            .await
            .unwrap();

        pool.penalty_box_insert(
            "wss://flaky.example.com".to_string(),
            PenaltyReason::NeverConnected,
        );
        assert!(pool.penalty_box().contains("wss://flaky.example.com"));
        // The routing tables drop it on rebuild.
        assert!(!router.find_events_table().contains_key("wss://flaky.example.com"));

        assert!(
            pool.ensure_outbox_connection("wss://flaky.example.com", true, false)
                .is_none()
        );

        // Explicit release restores routing.
        pool.remove_from_penalty_box("wss://flaky.example.com");
        assert!(router.find_events_table().contains_key("wss://flaky.example.com"));
        assert!(
            pool.ensure_outbox_connection("wss://flaky.example.com", true, false)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_user_configured_relay_never_penalty_boxed() {
        let (pool, _router) = test_pool(EngineSettings::default());
        pool.add_relay(
            RelayDescriptor::new("wss://mine.example.com")
                .unwrap()
                .read(true),
        );

        pool.penalty_box_insert(
            "wss://mine.example.com".to_string(),
            PenaltyReason::FatalTransport,
        );
        assert!(pool.penalty_box().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_clears_and_blocks_penalty_membership() {
        let (pool, _router) = test_pool(EngineSettings::default());
        pool.penalty_box_insert(
            "wss://redeemed.example.com".to_string(),
            PenaltyReason::NeverConnected,
        );
        assert!(!pool.penalty_box().is_empty());

        pool.add_relay(
            RelayDescriptor::new("wss://redeemed.example.com")
                .unwrap()
                .read(true),
        );
        assert!(pool.penalty_box().is_empty());

        // Even if the relay is later removed from the explicit set, the
        // box stays barred for the process lifetime.
        pool.remove_relay("wss://redeemed.example.com");
        pool.penalty_box_insert(
            "wss://redeemed.example.com".to_string(),
            PenaltyReason::NeverConnected,
        );
        assert!(pool.penalty_box().is_empty());
    }

    #[tokio::test]
    async fn test_restricted_post_forces_single_relay() {
        let (pool, _router) = test_pool(EngineSettings::default());
        let keys = Keys::generate();
        // Not a write relay, but the restricted target anyway.
        let target = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .read(true),
        );
        let other_writable = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:19")
                .unwrap()
                .write(true),
        );

        let event = EventBuilder::text_note("restricted")
            .sign_with_keys(&keys)
            .unwrap();
        pool.send_message(
            OutgoingMessage::publish(event).restricted_to("ws://127.0.0.1:9"),
        );

        wait_for(|| target.pending_messages() == 1).await;
        assert_eq!(other_writable.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_remove_relay_resets_stats() {
        let (pool, _router) = test_pool(EngineSettings::default());
        let connection = pool.add_relay(
            RelayDescriptor::new("wss://gone.example.com")
                .unwrap()
                .read(true),
        );
        connection.stats().record_error("boom");
        assert_eq!(connection.stats().errors(), 1);

        pool.remove_relay("wss://gone.example.com");
        assert!(pool.connection_by_url("wss://gone.example.com").is_none());
        // Accumulator reset but still registered.
        let snapshot = pool.stats_snapshot();
        assert_eq!(snapshot["wss://gone.example.com"].errors, 0);
    }

    #[tokio::test]
    async fn test_hint_fetch_short_circuits_on_stored_event() {
        use crate::traits::EventStore;

        let store = MemoryEventStore::new();
        let router = OutboxRouter::new(OutboxConfig::default(), store.clone());
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            shared(EngineSettings::default()),
            Arc::new(ReachabilityMonitor::default()),
            router,
            None,
        );

        let keys = Keys::generate();
        let event = EventBuilder::text_note("cached").sign_with_keys(&keys).unwrap();
        store.save_event(&event).await.unwrap();

        let hit = pool
            .fetch_event_from_hint(&event.id.to_hex(), "wss://hint.example.com")
            .await
            .unwrap();
        assert!(hit);
        // No ephemeral connection was opened for it.
        assert!(pool.connection_by_url("wss://hint.example.com").is_none());
    }

    #[tokio::test]
    async fn test_ephemeral_removed_after_unused_delay() {
        let config = PoolConfig {
            ephemeral_unused_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let router = OutboxRouter::new(OutboxConfig::default(), MemoryEventStore::new());
        let pool = ConnectionPool::new(
            config,
            shared(EngineSettings::default()),
            Arc::new(ReachabilityMonitor::default()),
            router,
            None,
        );

        pool.open_ephemeral("wss://hint.example.com", "[]".to_string())
            .unwrap();
        assert!(pool.connection_by_url("wss://hint.example.com").is_some());

        wait_for(|| pool.connection_by_url("wss://hint.example.com").is_none()).await;
    }

    #[tokio::test]
    async fn test_ephemeral_offline_is_an_error() {
        let (pool, _router) = test_pool(EngineSettings::default());
        pool.reachability.set_online(false);
        let result = pool.open_ephemeral("wss://hint.example.com", "[]".to_string());
        assert!(matches!(result, Err(Error::Offline)));
    }

    #[tokio::test]
    async fn test_search_only_intent_targets_search_relays() {
        let (pool, _router) = test_pool(EngineSettings::default());
        let search_relay = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:9")
                .unwrap()
                .read(true)
                .search(true),
        );
        let plain_read = pool.add_relay(
            RelayDescriptor::new("ws://127.0.0.1:19")
                .unwrap()
                .read(true),
        );

        pool.send_message(
            OutgoingMessage::req("search-1", vec![Filter::new().search("hello")])
                .intent(RelayIntent::SearchOnly),
        );
        assert!(search_relay.has_subscription("search-1"));
        assert!(!plain_read.has_subscription("search-1"));
    }

    #[test]
    fn test_tagged_pubkeys_dedupes() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let tag = Tag::parse(["p", &other.public_key().to_hex()]).unwrap();
        let event = EventBuilder::text_note("hi")
            .tags([tag.clone(), tag])
            .sign_with_keys(&keys)
            .unwrap();
        assert_eq!(tagged_pubkeys(&event).len(), 1);
    }
}
