use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::Clock;

struct Expiring<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> Expiring<V> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map whose entries disappear once their time to live elapses
///
/// Expired entries are never returned; they are dropped lazily on access
/// and in bulk by [`sweep`](Self::sweep).
pub struct TtlCache<K, V> {
    entries: DashMap<K, Expiring<V>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Insert or fully replace the entry for `key`
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries.insert(key, Expiring { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .remove(key)
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(_, entry)| entry.value)
    }

    /// Snapshot of every live entry, in no particular order
    pub fn live_entries(&self) -> Vec<(K, V)> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|entry| entry.is_live(now)).count()
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, live or not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn cache() -> (ManualClock, TtlCache<&'static str, u32>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let cache = TtlCache::new(Arc::new(clock.clone()));
        (clock, cache)
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (clock, cache) = cache();
        cache.set("a", 1, Duration::seconds(10));

        clock.advance(Duration::seconds(9));
        assert_eq!(cache.get(&"a"), Some(1));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_replaces_value_and_ttl() {
        let (clock, cache) = cache();
        cache.set("a", 1, Duration::seconds(5));
        cache.set("a", 2, Duration::seconds(60));

        clock.advance(Duration::seconds(30));
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn test_sweep_and_counts() {
        let (clock, cache) = cache();
        cache.set("short", 1, Duration::seconds(5));
        cache.set("long", 2, Duration::seconds(50));

        clock.advance(Duration::seconds(10));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.live_count(), 1);
        assert_eq!(cache.live_entries(), vec![("long", 2)]);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_ignores_expired() {
        let (clock, cache) = cache();
        cache.set("a", 1, Duration::seconds(5));
        clock.advance(Duration::seconds(6));
        assert_eq!(cache.remove(&"a"), None);
        assert!(cache.is_empty());
    }
}
