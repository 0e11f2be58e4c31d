use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use linewatch_transit::{Line, LineIdentifier, NetworkIdentifier, UserIdentifier};
use tracing::{debug, warn};

use crate::cache::ttl::TtlCache;
use crate::clock::Clock;

#[derive(Clone, Debug)]
pub struct ActivityConfig {
    /// Counts are rounded down to a multiple of this; 0 reports exact counts
    pub fudge_bucket: usize,
    /// Marker lifetime for a rider settled on a single line
    pub short_ttl: Duration,
    /// Marker lifetime right after entering, or while changing lines
    pub long_ttl: Duration,
    /// Upper bound on distinct line and network ids tracked at once
    pub max_tracked_ids: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            fudge_bucket: 0,
            short_ttl: Duration::minutes(4),
            long_ttl: Duration::minutes(8),
            max_tracked_ids: 10_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("tracking limit of {limit} ids reached, refusing {id}")]
    TooManyIds { id: String, limit: usize },
}

type Markers = TtlCache<UserIdentifier, ()>;

/// Who is riding what right now, per line and per network
pub struct ActivityCache {
    lines: DashMap<LineIdentifier, Markers>,
    networks: DashMap<NetworkIdentifier, Markers>,
    config: ActivityConfig,
    clock: Arc<dyn Clock>,
}

impl ActivityCache {
    pub fn new(config: ActivityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            lines: DashMap::new(),
            networks: DashMap::new(),
            config,
            clock,
        }
    }

    /// Mark `user` as riding exactly `lines`. Membership in any other line
    /// or network is dropped immediately.
    pub fn register_activity(
        &self,
        lines: &[Arc<Line>],
        user: &UserIdentifier,
        just_entered: bool,
    ) -> Result<(), ActivityError> {
        let ttl = if just_entered || lines.len() > 1 {
            self.config.long_ttl
        } else {
            self.config.short_ttl
        };

        let current_lines: HashSet<&LineIdentifier> = lines.iter().map(|l| &l.id).collect();
        let current_networks: HashSet<&NetworkIdentifier> =
            lines.iter().map(|l| &l.network).collect();

        let mut unseen = current_lines
            .iter()
            .filter(|id| !self.lines.contains_key(**id))
            .map(|id| id.to_string())
            .chain(
                current_networks
                    .iter()
                    .filter(|id| !self.networks.contains_key(**id))
                    .map(|id| id.to_string()),
            );
        if let Some(first) = unseen.next() {
            let added = 1 + unseen.count();
            if self.tracked_ids() + added > self.config.max_tracked_ids {
                warn!(id = %first, limit = self.config.max_tracked_ids, "activity tracking limit reached");
                return Err(ActivityError::TooManyIds {
                    id: first,
                    limit: self.config.max_tracked_ids,
                });
            }
        }

        for line in lines {
            self.mark(&self.lines, &line.id, user, ttl);
            self.mark(&self.networks, &line.network, user, ttl);
        }

        for entry in self.lines.iter() {
            if !current_lines.contains(entry.key()) {
                entry.value().remove(user);
            }
        }
        for entry in self.networks.iter() {
            if !current_networks.contains(entry.key()) {
                entry.value().remove(user);
            }
        }

        debug!(%user, lines = lines.len(), just_entered, "activity registered");
        Ok(())
    }

    fn mark<K>(&self, caches: &DashMap<K, Markers>, id: &K, user: &UserIdentifier, ttl: Duration)
    where
        K: Eq + Hash + Clone,
    {
        caches
            .entry(id.clone())
            .or_insert_with(|| TtlCache::new(self.clock.clone()))
            .set(user.clone(), (), ttl);
    }

    pub fn count_line(&self, line: &LineIdentifier) -> usize {
        let live = self.lines.get(line).map_or(0, |cache| cache.live_count());
        self.fudge(live)
    }

    pub fn count_network(&self, network: &NetworkIdentifier) -> usize {
        let live = self
            .networks
            .get(network)
            .map_or(0, |cache| cache.live_count());
        self.fudge(live)
    }

    fn fudge(&self, count: usize) -> usize {
        match self.config.fudge_bucket {
            0 => count,
            bucket => count / bucket * bucket,
        }
    }

    pub fn tracked_ids(&self) -> usize {
        self.lines.len() + self.networks.len()
    }

    /// Drop expired markers and then every cache left empty. Returns the
    /// number of caches removed.
    pub fn sweep(&self) -> usize {
        let before = self.tracked_ids();
        self.lines.retain(|_, cache| {
            cache.sweep();
            !cache.is_empty()
        });
        self.networks.retain(|_, cache| {
            cache.sweep();
            !cache.is_empty()
        });
        before.saturating_sub(self.tracked_ids())
    }
}
