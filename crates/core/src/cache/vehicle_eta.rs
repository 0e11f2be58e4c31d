use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use linewatch_transit::{LineIdentifier, StationIdentifier, VehicleIdentifier};

use crate::cache::ttl::TtlCache;
use crate::clock::Clock;
use crate::eta::value::{Eta, EtaUnits};

/// Predicted arrival of one vehicle at one station/direction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleEta {
    pub vehicle: VehicleIdentifier,
    pub line: LineIdentifier,
    pub station: StationIdentifier,
    pub direction: StationIdentifier,
    pub computed: DateTime<Utc>,
    pub validity: Duration,
    pub cars: u32,
    pub platform: Option<Arc<str>>,
    pub eta: Eta,
    pub units: EtaUnits,
}

impl VehicleEta {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.computed + self.validity
    }

    /// Seconds until arrival as of `now`
    pub fn live_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.eta
            .soonest_seconds(self.computed)
            .map(|seconds| seconds - (now - self.computed).num_seconds())
    }

    /// The estimate as it reads at `now`
    pub fn live_eta(&self, now: DateTime<Utc>) -> Eta {
        self.eta.aged((now - self.computed).num_seconds())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EtaKey {
    pub station: StationIdentifier,
    pub direction: StationIdentifier,
    /// 1 for the next arrival, 2 for the one after, and so on
    pub rank: u8,
}

/// Live predictions keyed by station, direction and arrival rank
pub struct VehicleEtaCache {
    entries: TtlCache<EtaKey, VehicleEta>,
    clock: Arc<dyn Clock>,
}

impl VehicleEtaCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: TtlCache::new(clock.clone()),
            clock,
        }
    }

    /// Replace whatever is stored for the key. The entry expires when its
    /// own validity window, counted from `computed`, runs out.
    pub fn set(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
        rank: u8,
        value: VehicleEta,
    ) {
        let ttl = value.expires_at() - self.clock.now();
        if ttl <= Duration::zero() {
            return;
        }
        let key = EtaKey {
            station: station.clone(),
            direction: direction.clone(),
            rank,
        };
        self.entries.set(key, value, ttl);
    }

    /// Live entries for ranks `1..=n`, in rank order. Missing ranks are skipped.
    pub fn get(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
        n: u8,
    ) -> Vec<VehicleEta> {
        (1..=n)
            .filter_map(|rank| {
                self.entries.get(&EtaKey {
                    station: station.clone(),
                    direction: direction.clone(),
                    rank,
                })
            })
            .collect()
    }

    /// Every live entry, sorted by key
    pub fn all(&self) -> Vec<(EtaKey, VehicleEta)> {
        let mut entries = self.entries.live_entries();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// One entry per vehicle: the one it will reach soonest
    pub fn current_positions(&self) -> Vec<VehicleEta> {
        let now = self.clock.now();
        let mut soonest: HashMap<VehicleIdentifier, (i64, VehicleEta)> = HashMap::new();

        for (_, entry) in self.all() {
            let live = entry.live_seconds(now).unwrap_or(i64::MAX);
            match soonest.get(&entry.vehicle) {
                Some((best, _)) if *best <= live => {}
                _ => {
                    soonest.insert(entry.vehicle.clone(), (live, entry));
                }
            }
        }

        let mut positions: Vec<VehicleEta> = soonest.into_values().map(|(_, e)| e).collect();
        positions.sort_by(|a, b| a.vehicle.cmp(&b.vehicle));
        positions
    }

    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    pub fn len(&self) -> usize {
        self.entries.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 17, 0, 0).unwrap()
    }

    fn eta(vehicle: &str, station: &str, seconds: i64, validity: i64) -> VehicleEta {
        VehicleEta {
            vehicle: vehicle.into(),
            line: "blue".into(),
            station: station.into(),
            direction: "end".into(),
            computed: now(),
            validity: Duration::seconds(validity),
            cars: 6,
            platform: None,
            eta: Eta::Exact(seconds),
            units: EtaUnits::Seconds,
        }
    }

    fn cache() -> (ManualClock, VehicleEtaCache) {
        let clock = ManualClock::new(now());
        let cache = VehicleEtaCache::new(Arc::new(clock.clone()));
        (clock, cache)
    }

    #[test]
    fn test_get_returns_ranks_in_order_without_gaps() {
        let (_, cache) = cache();
        let (station, direction) = ("s1".into(), "end".into());
        cache.set(&station, &direction, 3, eta("v3", "s1", 300, 60));
        cache.set(&station, &direction, 1, eta("v1", "s1", 60, 60));

        let got = cache.get(&station, &direction, 3);
        let vehicles: Vec<_> = got.iter().map(|e| e.vehicle.as_str()).collect();
        assert_eq!(vehicles, vec!["v1", "v3"]);

        assert_eq!(cache.get(&station, &direction, 1).len(), 1);
    }

    #[test]
    fn test_expired_entries_are_never_returned() {
        let (clock, cache) = cache();
        let (station, direction) = ("s1".into(), "end".into());
        cache.set(&station, &direction, 1, eta("v1", "s1", 60, 30));

        clock.advance(Duration::seconds(29));
        assert_eq!(cache.get(&station, &direction, 1).len(), 1);

        clock.advance(Duration::seconds(1));
        assert!(cache.get(&station, &direction, 1).is_empty());
        assert!(cache.current_positions().is_empty());
    }

    #[test]
    fn test_validity_counts_from_computation_time() {
        let (clock, cache) = cache();
        let (station, direction) = ("s1".into(), "end".into());
        clock.advance(Duration::seconds(20));
        cache.set(&station, &direction, 1, eta("v1", "s1", 60, 30));

        clock.advance(Duration::seconds(10));
        assert!(cache.get(&station, &direction, 1).is_empty());

        // already stale on arrival
        cache.set(&station, &direction, 1, eta("v1", "s1", 60, 30));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fresher_prediction_replaces_old() {
        let (_, cache) = cache();
        let (station, direction) = ("s1".into(), "end".into());
        cache.set(&station, &direction, 1, eta("v1", "s1", 60, 60));
        cache.set(&station, &direction, 1, eta("v2", "s1", 90, 60));

        let got = cache.get(&station, &direction, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].vehicle.as_str(), "v2");
    }

    #[test]
    fn test_current_positions_keeps_soonest_per_vehicle() {
        let (clock, cache) = cache();
        let direction: StationIdentifier = "end".into();
        cache.set(&"s1".into(), &direction, 1, eta("v1", "s1", 30, 120));
        cache.set(&"s2".into(), &direction, 1, eta("v1", "s2", 90, 120));
        cache.set(&"s3".into(), &direction, 1, eta("v1", "s3", 150, 120));
        cache.set(&"s3".into(), &direction, 2, eta("v2", "s3", 400, 120));
        clock.advance(Duration::seconds(10));

        let positions = cache.current_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].vehicle.as_str(), "v1");
        assert_eq!(positions[0].station.as_str(), "s1");
        assert_eq!(positions[0].live_seconds(clock.now()), Some(20));
        assert_eq!(positions[1].vehicle.as_str(), "v2");
    }
}
