//! Relay URL normalization and validation.
//!
//! The canonical form of a relay URL is the identity key for every
//! connection registry and routing table in the engine, so all URLs pass
//! through here exactly once, at the edge.
//!
//! # Normalization Rules
//!
//! - Lowercase the scheme and host (the parser does this)
//! - Remove trailing slashes
//! - Preserve port numbers and paths
//! - Require a websocket scheme (wss:// or ws://)
//!
//! Normalization is idempotent: `canonical(canonical(u)) == canonical(u)`.
//!
//! # Filtering Rules
//!
//! Relay-list announcements are attacker-influenceable input, so URLs that
//! are about to enter the outbox routing tables additionally go through a
//! blocklist. URLs are blocked if they point at:
//!
//! - localhost or loopback addresses
//! - Private IP ranges (192.168.x.x, 10.x.x.x, 172.16-31.x.x)
//! - CGNAT/shared address space (100.64-127.x.x)
//! - Link-local IPv4 (169.254.x.x) and 0.0.0.0
//! - IPv6 loopback, link-local, unique local, IPv4-mapped
//! - .onion (Tor) and .local (mDNS) hostnames
//!
//! The blocklist applies to *discovered* relays only. A user who
//! explicitly configures `ws://localhost:7777` gets to keep it.

use nostr::RelayUrl;

use crate::error::{Error, Result};

/// Result of outbox-candidate URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL matches a blocklist pattern.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid and unblocked.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL without blocklist checks.
///
/// This is the form used for user-configured relays: lowercased scheme and
/// host, no trailing slash, port and path preserved.
pub fn canonical_relay_url(url: &str) -> Result<String> {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: "URL must start with wss:// or ws://".to_string(),
        });
    }

    let parsed = RelayUrl::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    Ok(normalized)
}

/// Normalize a relay URL destined for the outbox routing tables.
///
/// Applies [`canonical_relay_url`] plus the blocklist.
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let normalized = match canonical_relay_url(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(e.to_string()),
    };

    if let Some(reason) = check_blocklist(&normalized) {
        return NormalizeResult::Blocked(reason);
    }

    NormalizeResult::Ok(normalized)
}

/// Check if a URL matches any blocklist pattern.
///
/// Returns `Some(reason)` if blocked, `None` if allowed.
fn check_blocklist(url: &str) -> Option<String> {
    let host = extract_host(url);

    if host == "localhost" || host.starts_with("localhost:") {
        return Some("localhost not allowed".to_string());
    }

    if host.starts_with("0.0.0.0") {
        return Some("unspecified address (0.0.0.0) not allowed".to_string());
    }

    if host.starts_with("127.") {
        return Some("loopback address not allowed".to_string());
    }

    if host.starts_with("192.168.") {
        return Some("private IP (192.168.x.x) not allowed".to_string());
    }
    if host.starts_with("10.") {
        return Some("private IP (10.x.x.x) not allowed".to_string());
    }
    // 172.16.0.0 - 172.31.255.255
    if host.starts_with("172.")
        && let Some(second_octet) = host.split('.').nth(1)
        && let Ok(n) = second_octet.parse::<u8>()
        && (16..=31).contains(&n)
    {
        return Some("private IP (172.16-31.x.x) not allowed".to_string());
    }

    // CGNAT / shared address space (100.64.0.0 - 100.127.255.255, RFC 6598)
    if host.starts_with("100.")
        && let Some(second_octet) = host.split('.').nth(1)
        && let Ok(n) = second_octet.parse::<u8>()
        && (64..=127).contains(&n)
    {
        return Some("CGNAT/shared address (100.64-127.x.x) not allowed".to_string());
    }

    if host.starts_with("169.254.") {
        return Some("link-local address (169.254.x.x) not allowed".to_string());
    }

    if host.starts_with("[::1]") {
        return Some("IPv6 loopback (::1) not allowed".to_string());
    }

    if host.starts_with("[fe80:") {
        return Some("IPv6 link-local (fe80::) not allowed".to_string());
    }

    // fc00::/7 = fc00:: through fdff::
    if host.starts_with("[fc") || host.starts_with("[fd") {
        return Some("IPv6 unique local (fc00::/7) not allowed".to_string());
    }

    // ::ffff:x.x.x.x could bypass the IPv4 checks above
    if host.starts_with("[::ffff:") {
        return Some("IPv4-mapped IPv6 (::ffff:) not allowed".to_string());
    }

    if host.ends_with(".onion") || host.contains(".onion:") {
        return Some(".onion addresses not allowed".to_string());
    }

    if host.ends_with(".local") || host.contains(".local:") {
        return Some(".local addresses not allowed".to_string());
    }

    if host.is_empty() || host == ":" {
        return Some("empty host not allowed".to_string());
    }

    if host.len() < 3 {
        return Some("host too short".to_string());
    }

    None
}

/// Extract the host portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}
