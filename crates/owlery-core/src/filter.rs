//! Subscription filters (NIP-01 `REQ` filter objects).
//!
//! The engine needs to *rewrite* filters — the outbox planner replaces the
//! author list per target relay and strips hashtag criteria — so filters
//! are modeled as plain data here rather than an opaque builder.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single NIP-01 subscription filter.
///
/// Serializes to the wire representation used inside `["REQ", ...]` frames;
/// absent fields are omitted entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,

    /// Author pubkeys, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,

    /// Referenced event ids (`#e` tag criteria).
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub event_refs: Option<BTreeSet<String>>,

    /// Referenced pubkeys (`#p` tag criteria).
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub pubkey_refs: Option<BTreeSet<String>>,

    /// Hashtags (`#t` tag criteria).
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<BTreeSet<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// NIP-50 search query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn hashtags<I, S>(mut self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = Some(hashtags.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Replace the author set, keeping every other criterion.
    ///
    /// Used by the outbox planner to narrow a filter to the pubkeys a
    /// specific relay is expected to carry.
    pub fn with_authors<I, S>(&self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut adjusted = self.clone();
        adjusted.authors = Some(authors.into_iter().map(Into::into).collect());
        adjusted
    }

    /// Drop hashtag criteria. Outbox routing is author-keyed, not
    /// topic-keyed, so hashtag sub-filters must not travel with a plan.
    pub fn without_hashtags(&self) -> Self {
        let mut adjusted = self.clone();
        adjusted.hashtags = None;
        adjusted
    }

    /// True when hashtags are the only selective criterion, i.e. stripping
    /// them would leave a filter matching essentially everything.
    pub fn is_hashtag_only(&self) -> bool {
        self.hashtags.is_some()
            && self.ids.is_none()
            && self.authors.is_none()
            && self.event_refs.is_none()
            && self.pubkey_refs.is_none()
            && self.search.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_tag_criteria_with_hash_names() {
        let filter = Filter::new()
            .authors(["aa".to_string()])
            .kinds([1])
            .hashtags(["nostr"]);

        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["authors"][0], "aa");
        assert_eq!(json["kinds"][0], 1);
        assert_eq!(json["#t"][0], "nostr");
        assert!(json.get("#e").is_none());
        assert!(json.get("since").is_none());
    }

    #[test]
    fn test_with_authors_keeps_other_criteria() {
        let filter = Filter::new().authors(["aa"]).kinds([1, 6]).since(1_700_000_000);
        let adjusted = filter.with_authors(["bb", "cc"]);

        assert_eq!(adjusted.kinds, filter.kinds);
        assert_eq!(adjusted.since, filter.since);
        assert_eq!(
            adjusted.authors.unwrap(),
            BTreeSet::from(["bb".to_string(), "cc".to_string()])
        );
    }

    #[test]
    fn test_hashtag_only_detection() {
        assert!(Filter::new().hashtags(["nostr"]).is_hashtag_only());
        assert!(Filter::new().hashtags(["nostr"]).kinds([1]).is_hashtag_only());
        assert!(!Filter::new().authors(["aa"]).hashtags(["nostr"]).is_hashtag_only());
        assert!(!Filter::new().authors(["aa"]).is_hashtag_only());
    }

    #[test]
    fn test_roundtrip() {
        let filter = Filter::new().authors(["aa"]).hashtags(["x"]).limit(10);
        let json = serde_json::to_string(&filter).unwrap();
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
    }
}
