// src/hosterrors.rs
//! Per-host failure cache and circuit breaker.
//!
//! Every protocol call is gated on `check()`; once a host accumulates
//! `max_errors` tracked failures, all further work units against it
//! short-circuit with a skipped outcome until the scan restarts.
//!
//! Tracked failures are connection refused, TLS handshake failure, and
//! timeout by default, plus user-supplied substrings matched against the
//! rendered error string (substring, not regex).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::TemplarError;

const SHARD_COUNT: usize = 16;
const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_MAX_ERRORS: u32 = 30;

/// Failure tally for one host
#[derive(Debug, Clone)]
pub struct HostError {
    pub count: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Sharded, bounded cache of per-host failure counts
pub struct HostErrorCache {
    shards: Vec<Mutex<HashMap<String, HostError>>>,
    max_errors: u32,
    capacity_per_shard: usize,
    track_substrings: Vec<String>,
}

impl HostErrorCache {
    pub fn new(max_errors: u32, track_substrings: Vec<String>) -> Self {
        Self::with_capacity(max_errors, track_substrings, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        max_errors: u32,
        track_substrings: Vec<String>,
        capacity: usize,
    ) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            max_errors,
            capacity_per_shard: (capacity / SHARD_COUNT).max(1),
            track_substrings,
        }
    }

    fn shard(&self, host: &str) -> &Mutex<HashMap<String, HostError>> {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// True when the host has exceeded the error budget and must be skipped
    pub fn check(&self, host: &str) -> bool {
        let shard = self.shard(host).lock().expect("host error shard poisoned");
        shard
            .get(host)
            .map(|e| e.count >= self.max_errors)
            .unwrap_or(false)
    }

    /// Record a failure against `host` if the error belongs to the tracked
    /// set. Untracked errors are a no-op.
    pub fn mark_failed(&self, host: &str, err: &TemplarError) {
        if !self.is_tracked(err) {
            return;
        }

        let mut shard = self.shard(host).lock().expect("host error shard poisoned");
        let now = Instant::now();

        if let Some(entry) = shard.get_mut(host) {
            entry.count += 1;
            entry.last_seen = now;
            return;
        }

        if shard.len() >= self.capacity_per_shard {
            Self::evict_oldest(&mut shard);
        }
        shard.insert(
            host.to_string(),
            HostError {
                count: 1,
                first_seen: now,
                last_seen: now,
            },
        );
    }

    /// Current tally for a host, if any
    pub fn get(&self, host: &str) -> Option<HostError> {
        let shard = self.shard(host).lock().expect("host error shard poisoned");
        shard.get(host).cloned()
    }

    pub fn close(&self) {
        for shard in &self.shards {
            shard.lock().expect("host error shard poisoned").clear();
        }
    }

    fn is_tracked(&self, err: &TemplarError) -> bool {
        if let Some(kind) = err.network_kind() {
            if kind.is_tracked_by_default() {
                return true;
            }
        }
        if self.track_substrings.is_empty() {
            return false;
        }
        let rendered = err.to_string();
        self.track_substrings.iter().any(|s| rendered.contains(s))
    }

    fn evict_oldest(shard: &mut HashMap<String, HostError>) {
        if let Some(oldest) = shard
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(host, _)| host.clone())
        {
            shard.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;

    fn refused() -> TemplarError {
        TemplarError::Network(
            NetworkErrorKind::ConnectionRefused,
            "connection refused".to_string(),
        )
    }

    #[test]
    fn test_threshold_gates_host() {
        let cache = HostErrorCache::new(3, vec![]);
        assert!(!cache.check("a.test"));
        for _ in 0..3 {
            cache.mark_failed("a.test", &refused());
        }
        assert!(cache.check("a.test"));
        assert!(!cache.check("b.test"));
    }

    #[test]
    fn test_untracked_errors_are_ignored() {
        let cache = HostErrorCache::new(1, vec![]);
        cache.mark_failed(
            "a.test",
            &TemplarError::Network(NetworkErrorKind::Other, "reset by peer".to_string()),
        );
        assert!(!cache.check("a.test"));
    }

    #[test]
    fn test_substring_tracking() {
        let cache = HostErrorCache::new(1, vec!["reset by peer".to_string()]);
        cache.mark_failed(
            "a.test",
            &TemplarError::Network(NetworkErrorKind::Other, "reset by peer".to_string()),
        );
        assert!(cache.check("a.test"));

        // Substring match, not regex: a pattern with metacharacters only
        // matches literally.
        let cache = HostErrorCache::new(1, vec!["reset.*peer".to_string()]);
        cache.mark_failed(
            "b.test",
            &TemplarError::Network(NetworkErrorKind::Other, "reset by peer".to_string()),
        );
        assert!(!cache.check("b.test"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        // Tiny capacity: one entry per shard
        let cache = HostErrorCache::with_capacity(3, vec![], SHARD_COUNT);
        for i in 0..200 {
            cache.mark_failed(&format!("host-{}.test", i), &refused());
        }
        let total: usize = cache
            .shards
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum();
        assert!(total <= SHARD_COUNT);
    }

    #[test]
    fn test_counts_accumulate() {
        let cache = HostErrorCache::new(10, vec![]);
        cache.mark_failed("a.test", &refused());
        cache.mark_failed("a.test", &refused());
        assert_eq!(cache.get("a.test").unwrap().count, 2);
    }

    #[test]
    fn test_close_clears() {
        let cache = HostErrorCache::new(1, vec![]);
        cache.mark_failed("a.test", &refused());
        assert!(cache.check("a.test"));
        cache.close();
        assert!(!cache.check("a.test"));
    }
}
