//! Per-relay connection statistics.
//!
//! One accumulator per canonical relay URL, alive for the whole process.
//! Stats are never deleted; removing a relay resets its accumulator.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use nostr::PublicKey;
use parking_lot::Mutex;

/// How many recent error/notice strings to retain per relay.
const RECENT_MESSAGE_CAP: usize = 10;

/// Accumulated counters for one relay.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connects: AtomicU64,
    messages: AtomicU64,
    errors: AtomicU64,
    inner: Mutex<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    last_errors: VecDeque<String>,
    last_notices: VecDeque<String>,
    received_pubkeys: HashSet<PublicKey>,
}

/// Point-in-time copy of one relay's stats.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub connects: u64,
    pub messages: u64,
    pub errors: u64,
    pub last_errors: Vec<String>,
    pub last_notices: Vec<String>,
    pub received_pubkeys: Vec<PublicKey>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        push_capped(&mut inner.last_errors, message.into());
    }

    pub fn record_notice(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        push_capped(&mut inner.last_notices, message.into());
    }

    /// Record a pubkey whose events this relay actually delivered.
    pub fn record_pubkey(&self, pubkey: PublicKey) {
        self.inner.lock().received_pubkeys.insert(pubkey);
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Reset all counters. Used when a relay is removed from the
    /// configuration; the accumulator itself stays registered.
    pub fn reset(&self) {
        self.connects.store(0, Ordering::Relaxed);
        self.messages.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_errors.clear();
        inner.last_notices.clear();
        inner.received_pubkeys.clear();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            connects: self.connects(),
            messages: self.messages(),
            errors: self.errors(),
            last_errors: inner.last_errors.iter().cloned().collect(),
            last_notices: inner.last_notices.iter().cloned().collect(),
            received_pubkeys: inner.received_pubkeys.iter().copied().collect(),
        }
    }
}

fn push_capped(queue: &mut VecDeque<String>, message: String) {
    if queue.len() == RECENT_MESSAGE_CAP {
        queue.pop_front();
    }
    queue.push_back(message);
}
