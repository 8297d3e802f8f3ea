#![allow(dead_code)]

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// A single cached value tagged for targeted invalidation.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// A bounded, TTL-aware, tag-invalidatable cache namespace.
///
/// Performance optimization only: callers must treat a cache miss or a
/// `TtlCache` internal failure as "go compute it", never as a correctness
/// signal.
pub struct TtlCache<T: Clone + Send + Sync + 'static> {
    entries: DashMap<String, CacheEntry<T>>,
    max_entries: usize,
    default_ttl: Option<Duration>,
}

impl<T: Clone + Send + Sync + 'static> TtlCache<T> {
    pub fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut expired = false;
        let hit = {
            match self.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
                Some(_) => {
                    expired = true;
                    None
                }
                None => None,
            }
        };
        if expired {
            self.entries.remove(key);
        }
        hit
    }

    pub fn set(&self, key: impl Into<String>, value: T, tags: &[&str]) {
        self.set_with_ttl(key, value, tags, self.default_ttl);
    }

    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: T,
        tags: &[&str],
        ttl: Option<Duration>,
    ) {
        let now = Instant::now();
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: ttl.map(|d| now + d),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
        self.evict_if_over_capacity();
    }

    /// Invalidate every entry carrying the given tag (e.g. `port:8080`,
    /// `reservation:updated`).
    pub fn invalidate_tag(&self, tag: &str) {
        self.entries.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all live (non-expired) values, for aggregate reporting.
    pub fn values(&self) -> Vec<T> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.value().value.clone())
            .collect()
    }

    /// Opportunistic LRU-ish eviction: if the namespace is over capacity,
    /// drop the oldest-inserted entries until it isn't. Run on every `set`
    /// rather than maintained via a separate heap — namespaces are capped
    /// at low four-figure counts, so a full LRU structure is unwarranted.
    fn evict_if_over_capacity(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut oldest: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().inserted_at))
            .collect();
        oldest.sort_by_key(|(_, inserted_at)| *inserted_at);
        let overflow = self.entries.len().saturating_sub(self.max_entries);
        for (key, _) in oldest.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
    }
}

/// Stats surfaced by the `statistics()` external operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub availability_entries: usize,
    pub conflict_entries: usize,
    pub monitor_state_entries: usize,
}

/// Three logical cache namespaces owned by a single root.
pub struct CacheManager {
    pub availability: TtlCache<bool>,
    pub conflicts: TtlCache<Vec<crate::types::Conflict>>,
    pub monitor_state: TtlCache<crate::types::PortStatus>,
}

impl CacheManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            availability: TtlCache::new(2000, Some(ttl)),
            conflicts: TtlCache::new(1000, Some(ttl)),
            monitor_state: TtlCache::new(5000, None),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            availability_entries: self.availability.len(),
            conflict_entries: self.conflicts.len(),
            monitor_state_entries: self.monitor_state.len(),
        }
    }

    /// Invalidate everything related to a single port across namespaces.
    pub fn invalidate_port(&self, port: u16) {
        let tag = format!("port:{}", port);
        self.availability.invalidate_tag(&tag);
        self.conflicts.invalidate_tag(&tag);
    }

    pub fn invalidate_host(&self, host: &str) {
        let tag = format!("host:{}", host);
        self.availability.invalidate_tag(&tag);
    }

    pub fn invalidate_reservations(&self) {
        self.conflicts.invalidate_tag("reservation:updated");
    }
}

/// A last-resort in-process fallback used by callers when a cache operation
/// itself cannot be trusted (never currently reachable with `DashMap`, but
/// kept so a future remote-cache backend has somewhere safe to degrade to).
pub fn log_cache_fallback(namespace: &str, reason: &str) {
    warn!(namespace = %namespace, reason = %reason, "cache unavailable, falling back to direct computation");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn get_set_roundtrip() {
        let cache: TtlCache<u32> = TtlCache::new(10, Some(Duration::from_secs(5)));
        cache.set("a", 42, &["port:80"]);
        assert_eq!(cache.get("a"), Some(42));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache: TtlCache<u32> = TtlCache::new(10, Some(Duration::from_millis(5)));
        cache.set("a", 1, &[]);
        sleep(Duration::from_millis(20));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn tag_invalidation_removes_matching_entries_only() {
        let cache: TtlCache<u32> = TtlCache::new(10, None);
        cache.set("a", 1, &["port:80"]);
        cache.set("b", 2, &["port:81"]);
        cache.invalidate_tag("port:80");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn capacity_eviction_drops_oldest() {
        let cache: TtlCache<u32> = TtlCache::new(2, None);
        cache.set("a", 1, &[]);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", 2, &[]);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", 3, &[]);
        assert!(cache.len() <= 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(3));
    }
}
