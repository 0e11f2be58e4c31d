use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use linewatch_transit::StationIdentifier;
use tracing::trace;

use crate::memo::EdgeDurationMemo;

/// Readings kept for diagnostics
pub const READING_HISTORY: usize = 100;

/// One live "rider at station heading towards terminal" observation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassengerReading {
    pub time: DateTime<Utc>,
    pub station: StationIdentifier,
    pub direction: StationIdentifier,
}

/// Last time a vehicle was inferred at each (station, direction)
pub struct PresenceTracker {
    last_seen: DashMap<(StationIdentifier, StationIdentifier), DateTime<Utc>>,
    readings: Mutex<VecDeque<PassengerReading>>,
    memo: Arc<EdgeDurationMemo>,
}

impl PresenceTracker {
    pub fn new(memo: Arc<EdgeDurationMemo>) -> Self {
        Self {
            last_seen: DashMap::new(),
            readings: Mutex::new(VecDeque::with_capacity(READING_HISTORY)),
            memo,
        }
    }

    /// Record a presence observation. Last writer wins per key.
    pub fn register_presence(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
        now: DateTime<Utc>,
    ) {
        trace!(%station, %direction, "presence");
        self.last_seen
            .insert((station.clone(), direction.clone()), now);

        let mut readings = self
            .readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if readings.len() == READING_HISTORY {
            readings.pop_front();
        }
        readings.push_back(PassengerReading {
            time: now,
            station: station.clone(),
            direction: direction.clone(),
        });
    }

    pub fn last_seen(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
    ) -> Option<DateTime<Utc>> {
        self.last_seen
            .get(&(station.clone(), direction.clone()))
            .map(|seen| *seen)
    }

    /// Drop memoized edge durations so the next query re-reads the store
    pub fn clear_memo(&self) {
        self.memo.clear();
    }

    /// Diagnostic history, oldest first
    pub fn readings(&self) -> Vec<PassengerReading> {
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn memo(&self) -> &Arc<EdgeDurationMemo> {
        &self.memo
    }
}
