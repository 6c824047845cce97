//! # TTL Cache
//!
//! Short-lived "have I seen this?" memory. The block-arrival validator keys
//! it by height so the same block relayed by several peers is processed
//! once per block interval.
//!
//! Entries carry their own deadline. A lookup that lands on an expired entry
//! drops it and reports "not seen" without re-recording the key, so the
//! check after that is the one that arms it again. The sweeper only reclaims
//! memory. The sweep works
//! over a snapshot of the keys so it never holds a shard lock while other
//! tasks insert.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Default)]
pub struct TtlCache {
    entries: DashMap<String, Instant>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` was seen and has not expired.
    ///
    /// An unseen key is recorded with a fresh `ttl`. An expired key is
    /// removed and not recorded again; both cases return `false`.
    pub fn check_repeat(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let repeat = match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if *entry.get() > now => true,
            Entry::Occupied(entry) => {
                entry.remove();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(now + ttl);
                false
            }
        };
        trace!(key, repeat, "dedup check");
        repeat
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|deadline| *deadline > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, deadline| *deadline <= now)
                    .is_some()
            })
            .count()
    }

    /// Sweeps every `period` until `shutdown` flips to `true`.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "swept expired cache entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
