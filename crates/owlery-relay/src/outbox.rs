//! Outbox routing: peers' self-declared relay preferences turned into
//! request/publish plans.
//!
//! Peers announce where they write and where they read (NIP-65 kind:10002
//! relay lists). From those announcements the router maintains two tables:
//!
//! - `find_events_at`: relay → pubkeys whose posts should be found there
//!   (the peers' *write* relays)
//! - `reach_user_at`: relay → pubkeys reachable there (the peers' *read*
//!   relays)
//!
//! Relay lists are attacker-influenceable input, so everything entering
//! the tables is normalized and filtered, a hard-coded special-purpose
//! blacklist discards obviously misconfigured announcements, and plans
//! are capped in size.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use metrics::{counter, gauge};
use nostr::{Event, Kind, PublicKey};
use parking_lot::RwLock;

use owlery_core::{CanonicalRelayUrl, Filter, NormalizeResult, normalize_relay_url};

use crate::error::{Error, Result};
use crate::traits::EventStore;

/// Relays known to be write-only, special-purpose, or paid-and-thus-
/// unreadable. A relay list declaring one of these as a *write* relay is
/// discarded wholesale: whoever published it copied a config they did not
/// understand, and the rest of the list is suspect too. Prefix match.
pub const SPECIAL_PURPOSE_RELAYS: &[&str] = &[
    "wss://filter.nostr.wine",
    "wss://welcome.nostr.wine",
    "wss://auth.nostr1.com",
];

fn is_special_purpose(url: &str) -> bool {
    SPECIAL_PURPOSE_RELAYS
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Hard cap on relays in a single plan. Relay lists are hostile
    /// input; without a cap a handful of crafted announcements could make
    /// the engine open hundreds of connections.
    pub max_plan_relays: usize,

    /// Skip the K most popular relays when planning requests, on the
    /// assumption the local relay set already covers the big ones.
    pub skip_popular_relays: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_plan_relays: 50,
            skip_popular_relays: 0,
        }
    }
}

/// One peer's parsed relay-list announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRelayList {
    /// Author pubkey, hex.
    pub pubkey: String,
    /// Relays the peer reads from (publish here to reach them).
    pub read: BTreeSet<CanonicalRelayUrl>,
    /// Relays the peer writes to (look here for their posts).
    pub write: BTreeSet<CanonicalRelayUrl>,
    pub created_at: u64,
}

/// Parse a kind:10002 relay-list event.
///
/// `r` tags with no marker count as both read and write. URLs that fail
/// normalization or hit the candidate blocklist are skipped silently; a
/// *write* declaration of a special-purpose relay discards the whole
/// event.
pub fn parse_relay_list(event: &Event) -> Result<PeerRelayList> {
    if event.kind != Kind::RelayList {
        return Err(Error::MisconfiguredRelayList(format!(
            "kind {} is not a relay list",
            event.kind.as_u16()
        )));
    }

    let mut read = BTreeSet::new();
    let mut write = BTreeSet::new();

    for tag in event.tags.iter() {
        let tag = tag.as_slice();
        if tag.first().map(String::as_str) != Some("r") {
            continue;
        }
        let Some(raw_url) = tag.get(1) else { continue };

        let url = match normalize_relay_url(raw_url) {
            NormalizeResult::Ok(url) => url,
            // Garbage or private-network entries are dropped, not fatal.
            NormalizeResult::Invalid(_) | NormalizeResult::Blocked(_) => continue,
        };

        match tag.get(2).map(String::as_str) {
            None => {
                read.insert(url.clone());
                write.insert(url);
            }
            Some("read") => {
                read.insert(url);
            }
            Some("write") => {
                write.insert(url);
            }
            Some(_) => continue,
        }
    }

    if let Some(bad) = write.iter().find(|url| is_special_purpose(url)) {
        return Err(Error::MisconfiguredRelayList(format!(
            "declares special-purpose relay {bad} as write relay"
        )));
    }

    Ok(PeerRelayList {
        pubkey: event.pubkey.to_hex(),
        read,
        write,
        created_at: event.created_at.as_u64(),
    })
}

/// One entry of a routing plan: a relay and the pubkeys it covers. For
/// request plans, `filter` carries the author-narrowed filter to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPlan {
    pub relay_url: CanonicalRelayUrl,
    pub pubkeys: BTreeSet<String>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Default)]
struct RouterState {
    lists: HashMap<String, PeerRelayList>,
    find_events_at: HashMap<CanonicalRelayUrl, BTreeSet<String>>,
    reach_user_at: HashMap<CanonicalRelayUrl, BTreeSet<String>>,
    penalty: HashSet<CanonicalRelayUrl>,
}

impl RouterState {
    /// Regenerate both tables from the stored lists. Cheap enough to run
    /// on every source change; correctness beats incremental updates
    /// here because penalty-box changes invalidate prior groupings.
    fn rebuild(&mut self) {
        self.find_events_at.clear();
        self.reach_user_at.clear();

        for list in self.lists.values() {
            for url in &list.write {
                if is_special_purpose(url) || self.penalty.contains(url) {
                    continue;
                }
                self.find_events_at
                    .entry(url.clone())
                    .or_default()
                    .insert(list.pubkey.clone());
            }
            for url in &list.read {
                if is_special_purpose(url) || self.penalty.contains(url) {
                    continue;
                }
                self.reach_user_at
                    .entry(url.clone())
                    .or_default()
                    .insert(list.pubkey.clone());
            }
        }

        gauge!("outbox_find_events_relays").set(self.find_events_at.len() as f64);
        gauge!("outbox_reach_user_relays").set(self.reach_user_at.len() as f64);
    }
}

/// Translates tracked peers' relay lists into bounded routing plans.
pub struct OutboxRouter {
    config: OutboxConfig,
    store: Arc<dyn EventStore>,
    state: RwLock<RouterState>,
}

impl OutboxRouter {
    pub fn new(config: OutboxConfig, store: Arc<dyn EventStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            state: RwLock::new(RouterState::default()),
        })
    }

    /// Consume a relay-list event for a tracked peer.
    ///
    /// The event is persisted through the event store and both tables are
    /// rebuilt. Returns `Ok(false)` when the event is older than the one
    /// already indexed for that peer. Misconfigured lists error out and
    /// leave the tables untouched.
    pub async fn ingest_relay_list(&self, event: &Event) -> Result<bool> {
        let list = parse_relay_list(event)?;

        {
            let state = self.state.read();
            if let Some(existing) = state.lists.get(&list.pubkey)
                && existing.created_at >= list.created_at
            {
                return Ok(false);
            }
        }

        self.store.save_event(event).await?;

        let mut state = self.state.write();
        state.lists.insert(list.pubkey.clone(), list);
        state.rebuild();
        counter!("outbox_relay_lists_total").increment(1);
        Ok(true)
    }

    /// Load previously persisted relay lists for the given peers,
    /// short-circuiting the network on startup.
    pub async fn prime_from_store(&self, pubkeys: &[PublicKey]) -> Result<usize> {
        let mut loaded = 0;
        for pubkey in pubkeys {
            let event = self
                .store
                .replaceable_event(Kind::RelayList, pubkey, None)
                .await?;
            if let Some(event) = event {
                match self.ingest_relay_list(&event).await {
                    Ok(true) => loaded += 1,
                    Ok(false) => {}
                    Err(error) => {
                        tracing::debug!(%error, "skipping stored relay list");
                    }
                }
            }
        }
        Ok(loaded)
    }

    /// The event store backing this router.
    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    /// Drop a peer's relay list (e.g. unfollowed) and rebuild.
    pub fn remove_peer(&self, pubkey_hex: &str) {
        let mut state = self.state.write();
        if state.lists.remove(pubkey_hex).is_some() {
            state.rebuild();
        }
    }

    /// The penalty box changed: membership changes invalidate prior
    /// groupings, so both tables are rebuilt against the new set.
    pub fn set_penalty_box(&self, penalty: HashSet<CanonicalRelayUrl>) {
        let mut state = self.state.write();
        state.penalty = penalty;
        state.rebuild();
    }

    /// Plan where to *look for* the given authors' posts, beyond the
    /// caller's own read relays.
    ///
    /// Hashtag criteria are stripped before planning: outbox routing is
    /// author-keyed. A filter with only hashtag criteria yields no plan
    /// at all rather than being mis-routed.
    pub fn create_request_plan(
        &self,
        authors: &[String],
        own_read_relays: &HashSet<CanonicalRelayUrl>,
        filter: &Filter,
    ) -> Vec<RelayPlan> {
        if filter.is_hashtag_only() {
            return Vec::new();
        }
        let base = filter.without_hashtags();

        let state = self.state.read();
        let skip = self.popular_relays(&state);

        let mut candidates: Vec<(CanonicalRelayUrl, BTreeSet<String>)> = state
            .find_events_at
            .iter()
            .filter(|(url, _)| !own_read_relays.contains(*url) && !skip.contains(*url))
            .filter_map(|(url, pubkeys)| {
                let covered: BTreeSet<String> = authors
                    .iter()
                    .filter(|author| pubkeys.contains(*author))
                    .cloned()
                    .collect();
                (!covered.is_empty()).then(|| (url.clone(), covered))
            })
            .collect();

        sort_and_cap(&mut candidates, self.config.max_plan_relays);
        counter!("outbox_request_plans_total").increment(1);

        candidates
            .into_iter()
            .map(|(relay_url, pubkeys)| RelayPlan {
                filter: Some(base.with_authors(pubkeys.iter().cloned())),
                relay_url,
                pubkeys,
            })
            .collect()
    }

    /// Plan where to *publish* so the given recipients see the event,
    /// beyond the caller's own write relays.
    pub fn create_write_plan(
        &self,
        recipients: &[String],
        own_write_relays: &HashSet<CanonicalRelayUrl>,
    ) -> Vec<RelayPlan> {
        let state = self.state.read();

        let mut candidates: Vec<(CanonicalRelayUrl, BTreeSet<String>)> = state
            .reach_user_at
            .iter()
            .filter(|(url, _)| !own_write_relays.contains(*url))
            .filter_map(|(url, pubkeys)| {
                let covered: BTreeSet<String> = recipients
                    .iter()
                    .filter(|recipient| pubkeys.contains(*recipient))
                    .cloned()
                    .collect();
                (!covered.is_empty()).then(|| (url.clone(), covered))
            })
            .collect();

        sort_and_cap(&mut candidates, self.config.max_plan_relays);
        counter!("outbox_write_plans_total").increment(1);

        candidates
            .into_iter()
            .map(|(relay_url, pubkeys)| RelayPlan {
                relay_url,
                pubkeys,
                filter: None,
            })
            .collect()
    }

    /// Snapshot of the find-events table, for stats/introspection.
    pub fn find_events_table(&self) -> HashMap<CanonicalRelayUrl, BTreeSet<String>> {
        self.state.read().find_events_at.clone()
    }

    /// Snapshot of the reach-user table.
    pub fn reach_user_table(&self) -> HashMap<CanonicalRelayUrl, BTreeSet<String>> {
        self.state.read().reach_user_at.clone()
    }

    pub fn tracked_peers(&self) -> usize {
        self.state.read().lists.len()
    }

    /// The K most popular relays by declared-writer count, assumed to be
    /// covered by the local relay set already.
    fn popular_relays(&self, state: &RouterState) -> HashSet<CanonicalRelayUrl> {
        if self.config.skip_popular_relays == 0 {
            return HashSet::new();
        }
        let mut by_popularity: Vec<(&CanonicalRelayUrl, usize)> = state
            .find_events_at
            .iter()
            .map(|(url, pubkeys)| (url, pubkeys.len()))
            .collect();
        by_popularity.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        by_popularity
            .into_iter()
            .take(self.config.skip_popular_relays)
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Rank by covered-pubkey count descending (URL as tie-break for
/// determinism) and enforce the anti-abuse cap.
fn sort_and_cap(candidates: &mut Vec<(CanonicalRelayUrl, BTreeSet<String>)>, cap: usize) {
    candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    candidates.truncate(cap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MemoryEventStore;
    use nostr::{EventBuilder, Keys, Tag, Timestamp};

    fn relay_list(keys: &Keys, entries: &[(&str, Option<&str>)], created_at: u64) -> Event {
        let tags: Vec<Tag> = entries
            .iter()
            .map(|(url, marker)| match marker {
                Some(marker) => Tag::parse(["r", url, marker]).unwrap(),
                None => Tag::parse(["r", url]).unwrap(),
            })
            .collect();
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn router() -> Arc<OutboxRouter> {
        OutboxRouter::new(OutboxConfig::default(), MemoryEventStore::new())
    }

    #[test]
    fn test_parse_unmarked_r_tag_is_read_and_write() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                ("wss://both.example.com", None),
                ("wss://r.example.com", Some("read")),
                ("wss://w.example.com", Some("write")),
            ],
            100,
        );

        let list = parse_relay_list(&event).unwrap();
        assert!(list.read.contains("wss://both.example.com"));
        assert!(list.write.contains("wss://both.example.com"));
        assert!(list.read.contains("wss://r.example.com"));
        assert!(!list.write.contains("wss://r.example.com"));
        assert!(list.write.contains("wss://w.example.com"));
        assert!(!list.read.contains("wss://w.example.com"));
    }

    #[test]
    fn test_parse_skips_garbage_urls() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                ("not-a-url", None),
                ("wss://192.168.1.10", None),
                ("wss://good.example.com", None),
            ],
            100,
        );

        let list = parse_relay_list(&event).unwrap();
        assert_eq!(list.write.len(), 1);
        assert!(list.write.contains("wss://good.example.com"));
    }

    #[tokio::test]
    async fn test_blacklisted_write_relay_discards_whole_event() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                ("wss://filter.nostr.wine", None),
                ("wss://perfectly.fine.example.com", None),
            ],
            100,
        );

        let router = router();
        let result = router.ingest_relay_list(&event).await;
        assert!(matches!(result, Err(Error::MisconfiguredRelayList(_))));

        // Nothing from the event made it into the tables, not even the
        // valid relay.
        assert!(router.find_events_table().is_empty());
        assert!(router.reach_user_table().is_empty());
    }

    #[tokio::test]
    async fn test_blacklisted_read_only_declaration_is_just_skipped() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                ("wss://filter.nostr.wine", Some("read")),
                ("wss://good.example.com", None),
            ],
            100,
        );

        let router = router();
        assert!(router.ingest_relay_list(&event).await.unwrap());
        assert!(!router.reach_user_table().contains_key("wss://filter.nostr.wine"));
        assert!(router.find_events_table().contains_key("wss://good.example.com"));
    }

    #[tokio::test]
    async fn test_request_plan_ranks_by_coverage() {
        let router = router();
        let alice = Keys::generate();
        let bob = Keys::generate();

        // A writes to r1+r2, B writes to r2+r3.
        router
            .ingest_relay_list(&relay_list(
                &alice,
                &[("wss://r1.example.com", Some("write")), ("wss://r2.example.com", Some("write"))],
                100,
            ))
            .await
            .unwrap();
        router
            .ingest_relay_list(&relay_list(
                &bob,
                &[("wss://r2.example.com", Some("write")), ("wss://r3.example.com", Some("write"))],
                100,
            ))
            .await
            .unwrap();

        let authors = vec![alice.public_key().to_hex(), bob.public_key().to_hex()];
        let plan = router.create_request_plan(&authors, &HashSet::new(), &Filter::new());

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].relay_url, "wss://r2.example.com");
        assert_eq!(plan[0].pubkeys.len(), 2);
        assert!(plan[0].pubkeys.contains(&authors[0]));
        assert!(plan[0].pubkeys.contains(&authors[1]));
        assert_eq!(plan[1].pubkeys.len(), 1);

        // The per-relay filter is narrowed to the covered authors.
        let narrowed = plan[1].filter.as_ref().unwrap();
        assert_eq!(
            narrowed.authors.as_ref().unwrap().len(),
            plan[1].pubkeys.len()
        );
    }

    #[tokio::test]
    async fn test_request_plan_skips_own_read_relays() {
        let router = router();
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(
                &alice,
                &[("wss://r1.example.com", Some("write")), ("wss://r2.example.com", Some("write"))],
                100,
            ))
            .await
            .unwrap();

        let own: HashSet<String> = ["wss://r1.example.com".to_string()].into();
        let plan =
            router.create_request_plan(&[alice.public_key().to_hex()], &own, &Filter::new());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].relay_url, "wss://r2.example.com");
    }

    #[tokio::test]
    async fn test_hashtag_only_filter_yields_no_plan() {
        let router = router();
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://r1.example.com", None)], 100))
            .await
            .unwrap();

        let filter = Filter::new().hashtags(["nostr"]);
        let plan = router.create_request_plan(
            &[alice.public_key().to_hex()],
            &HashSet::new(),
            &filter,
        );
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_hashtags_stripped_from_plan_filters() {
        let router = router();
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://r1.example.com", None)], 100))
            .await
            .unwrap();

        let filter = Filter::new()
            .authors([alice.public_key().to_hex()])
            .hashtags(["nostr"]);
        let plan = router.create_request_plan(
            &[alice.public_key().to_hex()],
            &HashSet::new(),
            &filter,
        );
        assert_eq!(plan.len(), 1);
        assert!(plan[0].filter.as_ref().unwrap().hashtags.is_none());
    }

    #[tokio::test]
    async fn test_penalty_box_excluded_from_both_tables() {
        let router = router();
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(&alice, &[("wss://r1.example.com", None)], 100))
            .await
            .unwrap();

        assert!(router.find_events_table().contains_key("wss://r1.example.com"));
        assert!(router.reach_user_table().contains_key("wss://r1.example.com"));

        router.set_penalty_box(["wss://r1.example.com".to_string()].into());
        assert!(!router.find_events_table().contains_key("wss://r1.example.com"));
        assert!(!router.reach_user_table().contains_key("wss://r1.example.com"));

        // Removal restores it on the next rebuild.
        router.set_penalty_box(HashSet::new());
        assert!(router.find_events_table().contains_key("wss://r1.example.com"));
    }

    #[tokio::test]
    async fn test_older_relay_list_is_ignored() {
        let router = router();
        let alice = Keys::generate();

        let newer = relay_list(&alice, &[("wss://new.example.com", None)], 200);
        let older = relay_list(&alice, &[("wss://old.example.com", None)], 100);

        assert!(router.ingest_relay_list(&newer).await.unwrap());
        assert!(!router.ingest_relay_list(&older).await.unwrap());
        assert!(router.find_events_table().contains_key("wss://new.example.com"));
        assert!(!router.find_events_table().contains_key("wss://old.example.com"));
    }

    #[tokio::test]
    async fn test_plan_capped_at_max_relays() {
        let config = OutboxConfig {
            max_plan_relays: 50,
            skip_popular_relays: 0,
        };
        let router = OutboxRouter::new(config, MemoryEventStore::new());

        let mut authors = Vec::new();
        for i in 0..60 {
            let keys = Keys::generate();
            let url = format!("wss://relay-{i}.example.com");
            router
                .ingest_relay_list(&relay_list(&keys, &[(url.as_str(), Some("write"))], 100))
                .await
                .unwrap();
            authors.push(keys.public_key().to_hex());
        }

        let plan = router.create_request_plan(&authors, &HashSet::new(), &Filter::new());
        assert_eq!(plan.len(), 50);
    }

    #[tokio::test]
    async fn test_skip_popular_relays() {
        let config = OutboxConfig {
            max_plan_relays: 50,
            skip_popular_relays: 1,
        };
        let router = OutboxRouter::new(config, MemoryEventStore::new());

        let alice = Keys::generate();
        let bob = Keys::generate();
        // Both write to big.example.com, making it the most popular.
        for keys in [&alice, &bob] {
            router
                .ingest_relay_list(&relay_list(
                    keys,
                    &[("wss://big.example.com", Some("write")), ("wss://small.example.com", Some("write"))],
                    100,
                ))
                .await
                .unwrap();
        }

        let authors = vec![alice.public_key().to_hex(), bob.public_key().to_hex()];
        let plan = router.create_request_plan(&authors, &HashSet::new(), &Filter::new());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].relay_url, "wss://small.example.com");
    }

    #[tokio::test]
    async fn test_write_plan_targets_recipient_read_relays() {
        let router = router();
        let alice = Keys::generate();
        router
            .ingest_relay_list(&relay_list(
                &alice,
                &[("wss://inbox.example.com", Some("read")), ("wss://out.example.com", Some("write"))],
                100,
            ))
            .await
            .unwrap();

        let recipients = vec![alice.public_key().to_hex()];
        let plan = router.create_write_plan(&recipients, &HashSet::new());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].relay_url, "wss://inbox.example.com");
        assert!(plan[0].filter.is_none());

        // Already covered by our own write set: nothing to add.
        let own: HashSet<String> = ["wss://inbox.example.com".to_string()].into();
        assert!(router.create_write_plan(&recipients, &own).is_empty());
    }

    #[tokio::test]
    async fn test_prime_from_store() {
        let store = MemoryEventStore::new();
        let alice = Keys::generate();
        let event = relay_list(&alice, &[("wss://r1.example.com", None)], 100);

        {
            use crate::traits::EventStore;
            store.save_event(&event).await.unwrap();
        }

        let router = OutboxRouter::new(OutboxConfig::default(), store);
        let loaded = router.prime_from_store(&[alice.public_key()]).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(router.find_events_table().contains_key("wss://r1.example.com"));
    }
}
