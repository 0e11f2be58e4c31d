use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use linewatch_transit::{ConnectionKey, TopologyStore};
use tracing::debug;

/// Memoized per-edge travel cost (`typical_seconds + typical_stop_seconds`)
///
/// Shared between the predictor, which fills it, and the presence tracker,
/// which clears it after a timing batch commits. Entries are read straight
/// from the store on first use and never refreshed on their own, so a
/// [`clear`](Self::clear) has to happen before any query that must see the
/// new durations. A value read from the store before a `clear` is never
/// memoized after it.
#[derive(Default)]
pub struct EdgeDurationMemo {
    edges: DashMap<ConnectionKey, i64>,
    generation: AtomicU64,
}

impl EdgeDurationMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Travel cost of the connection, or `None` if the store has no such edge
    pub fn travel_seconds(
        &self,
        store: &dyn TopologyStore,
        key: &ConnectionKey,
    ) -> linewatch_transit::Result<Option<i64>> {
        if let Some(seconds) = self.edges.get(key) {
            return Ok(Some(*seconds));
        }

        let generation = self.generation.load(Ordering::Acquire);
        let Some(connection) = store.connection(key)? else {
            return Ok(None);
        };
        let seconds = connection.travel_seconds();

        // the shard lock orders this check against the bump in `clear`
        if let Entry::Vacant(slot) = self.edges.entry(key.clone()) {
            if self.generation.load(Ordering::Acquire) == generation {
                slot.insert(seconds);
            }
        }
        Ok(Some(seconds))
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!(edges = self.edges.len(), "clearing edge duration memo");
        self.edges.clear();
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
