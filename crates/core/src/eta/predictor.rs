//! Next-vehicle arrival estimation from sparse presence observations.
//!
//! The predictor looks for the presence observation that best explains a
//! vehicle about to reach the queried station: walking from the station
//! towards where vehicles come from, it compares the learned travel time to
//! each observed station with how long ago the observation happened.
//!
//! This is a nearest-match heuristic. The scan stops as soon as the
//! deviation gets worse than the best so far, which assumes deviation grows
//! monotonically with distance; with noisy observations that can settle on a
//! candidate that is not the global optimum.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use linewatch_transit::{
    ConnectionKey, Heading, Line, StationIdentifier, TopologyStore, TransitError,
};
use tracing::trace;

use crate::clock::Clock;
use crate::memo::EdgeDurationMemo;
use crate::presence::PresenceTracker;

/// How far ahead of the naive projection a vehicle may be and still match
pub const FORWARD_TOLERANCE_SECONDS: i64 = 30;
/// Time a vehicle spends turning around at a terminal
pub const REVERSAL_SECONDS: i64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("station {0} is not served by any line")]
    UnknownStation(StationIdentifier),

    #[error("{direction} is not a terminal of any line serving {station}")]
    InvalidDirection {
        station: StationIdentifier,
        direction: StationIdentifier,
    },

    #[error("no vehicle located for {station} towards {direction}")]
    NoVehicleLocated {
        station: StationIdentifier,
        direction: StationIdentifier,
    },

    #[error("no connection from {from} to {to}")]
    MissingConnection {
        from: StationIdentifier,
        to: StationIdentifier,
    },

    #[error(transparent)]
    Store(#[from] TransitError),
}

/// Where the best-matching vehicle was seen and when it should arrive
#[derive(Clone, Debug)]
pub struct Prediction {
    pub line: Arc<Line>,
    pub station: StationIdentifier,
    pub direction: StationIdentifier,

    pub located_index: usize,
    pub located_station: StationIdentifier,
    /// Terminal the vehicle was heading to when seen
    pub located_direction: StationIdentifier,
    pub seen_at: DateTime<Utc>,
    /// Vehicle must finish its opposite leg and turn around first
    pub reversing: bool,

    pub path_seconds: i64,
    pub elapsed_seconds: i64,
    /// Seconds until arrival; negative means it arrived that long ago
    pub eta_seconds: i64,
}

impl Prediction {
    pub fn arrived(&self) -> bool {
        self.eta_seconds < 0
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    index: usize,
    path_seconds: i64,
    elapsed_seconds: i64,
    seen_at: DateTime<Utc>,
}

impl Candidate {
    fn deviation(&self) -> i64 {
        self.path_seconds - self.elapsed_seconds
    }
}

/// Keeps the smallest deviation that is still within the forward tolerance
#[derive(Default)]
struct Search {
    best: Option<Candidate>,
}

impl Search {
    /// Returns false once the scan should stop
    fn offer(&mut self, candidate: Candidate) -> bool {
        let deviation = candidate.deviation();
        if deviation < -FORWARD_TOLERANCE_SECONDS {
            return true;
        }
        match self.best {
            None => self.best = Some(candidate),
            Some(best) if deviation < best.deviation() => self.best = Some(candidate),
            Some(best) if deviation > best.deviation() => return false,
            Some(_) => {}
        }
        true
    }
}

pub struct EtaPredictor {
    store: Arc<dyn TopologyStore>,
    presence: Arc<PresenceTracker>,
    memo: Arc<EdgeDurationMemo>,
    clock: Arc<dyn Clock>,
}

impl EtaPredictor {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        presence: Arc<PresenceTracker>,
        memo: Arc<EdgeDurationMemo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            presence,
            memo,
            clock,
        }
    }

    /// Estimate when the next vehicle heading to `direction` reaches `station`
    pub fn next_train_eta(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
    ) -> Result<Prediction, PredictionError> {
        let now = self.clock.now();
        let (line, heading) = self.resolve(station, direction)?;
        let Some(target) = line.position(station) else {
            return Err(PredictionError::UnknownStation(station.clone()));
        };

        let (candidate, located_direction, reversing) =
            match self.scan_approaching(&line, heading, target, direction, now)? {
                Some(candidate) => (candidate, direction.clone(), false),
                None => {
                    let opposite = line
                        .terminal(heading.reversed())
                        .cloned()
                        .ok_or_else(|| PredictionError::UnknownStation(station.clone()))?;
                    match self.scan_reversing(&line, heading, target, &opposite, now)? {
                        Some(candidate) => (candidate, opposite, true),
                        None => {
                            return Err(PredictionError::NoVehicleLocated {
                                station: station.clone(),
                                direction: direction.clone(),
                            });
                        }
                    }
                }
            };

        trace!(
            %station, %direction,
            located = %line.stations[candidate.index],
            reversing,
            deviation = candidate.deviation(),
            "vehicle located"
        );

        Ok(Prediction {
            station: station.clone(),
            direction: direction.clone(),
            located_index: candidate.index,
            located_station: line.stations[candidate.index].clone(),
            located_direction,
            seen_at: candidate.seen_at,
            reversing,
            path_seconds: candidate.path_seconds,
            elapsed_seconds: candidate.elapsed_seconds,
            eta_seconds: candidate.deviation(),
            line,
        })
    }

    fn resolve(
        &self,
        station: &StationIdentifier,
        direction: &StationIdentifier,
    ) -> Result<(Arc<Line>, Heading), PredictionError> {
        let lines = self.store.lines_serving(station)?;
        if lines.is_empty() {
            return Err(PredictionError::UnknownStation(station.clone()));
        }
        lines
            .into_iter()
            .find_map(|line| line.heading_towards(direction).map(|h| (line, h)))
            .ok_or_else(|| PredictionError::InvalidDirection {
                station: station.clone(),
                direction: direction.clone(),
            })
    }

    /// Travel cost of the edge between two adjacent indices, in travel order
    pub(crate) fn edge_seconds(
        &self,
        line: &Line,
        from: usize,
        to: usize,
    ) -> Result<i64, PredictionError> {
        let key = ConnectionKey::new(line.stations[from].clone(), line.stations[to].clone());
        self.memo
            .travel_seconds(self.store.as_ref(), &key)?
            .ok_or(PredictionError::MissingConnection {
                from: key.from,
                to: key.to,
            })
    }

    /// Cost of travelling from `from` to `to` moving with `heading`
    fn path_seconds(
        &self,
        line: &Line,
        from: usize,
        to: usize,
        heading: Heading,
    ) -> Result<i64, PredictionError> {
        let mut total = 0;
        let mut index = from;
        while index != to {
            let Some(next) = line.next_index(index, heading) else {
                break;
            };
            total += self.edge_seconds(line, index, next)?;
            index = next;
        }
        Ok(total)
    }

    fn candidate_at(
        &self,
        line: &Line,
        index: usize,
        presence_direction: &StationIdentifier,
        path_seconds: i64,
        now: DateTime<Utc>,
    ) -> Option<Candidate> {
        self.presence
            .last_seen(&line.stations[index], presence_direction)
            .map(|seen_at| Candidate {
                index,
                path_seconds,
                elapsed_seconds: (now - seen_at).num_seconds(),
                seen_at,
            })
    }

    /// Vehicles already heading to `direction`, scanned from the target back
    /// towards the end they come from
    fn scan_approaching(
        &self,
        line: &Line,
        heading: Heading,
        target: usize,
        direction: &StationIdentifier,
        now: DateTime<Utc>,
    ) -> Result<Option<Candidate>, PredictionError> {
        let mut search = Search::default();
        let mut index = target;
        let mut travel = 0;
        loop {
            if let Some(candidate) = self.candidate_at(line, index, direction, travel, now) {
                if !search.offer(candidate) {
                    break;
                }
            }
            let Some(previous) = line.next_index(index, heading.reversed()) else {
                break;
            };
            travel += self.edge_seconds(line, previous, index)?;
            index = previous;
        }
        Ok(search.best)
    }

    /// Vehicles still on their opposite leg: they run to the far terminal,
    /// turn around and come back up to the target
    fn scan_reversing(
        &self,
        line: &Line,
        heading: Heading,
        target: usize,
        opposite: &StationIdentifier,
        now: DateTime<Utc>,
    ) -> Result<Option<Candidate>, PredictionError> {
        let turnaround = match heading {
            Heading::Up => 0,
            Heading::Down => line.stations.len() - 1,
        };
        let return_leg = self.path_seconds(line, turnaround, target, heading)?;

        let mut search = Search::default();
        let mut index = turnaround;
        let mut to_terminal = 0;
        loop {
            let path = to_terminal + REVERSAL_SECONDS + return_leg;
            if let Some(candidate) = self.candidate_at(line, index, opposite, path, now) {
                if !search.offer(candidate) {
                    break;
                }
            }
            let Some(further) = line.next_index(index, heading) else {
                break;
            };
            to_terminal += self.edge_seconds(line, further, index)?;
            index = further;
        }
        Ok(search.best)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use linewatch_transit::{Connection, MemoryStore, TopologySnapshot};

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 30, 0).unwrap()
    }

    /// Line s0..s6, every edge 60 s in both directions
    pub(crate) fn store() -> Arc<MemoryStore> {
        let stations: Vec<StationIdentifier> =
            (0..7).map(|i| StationIdentifier::new(format!("s{i}"))).collect();
        let mut connections = Vec::new();
        for pair in stations.windows(2) {
            for (from, to) in [(&pair[0], &pair[1]), (&pair[1], &pair[0])] {
                connections.push(Connection {
                    from: from.clone(),
                    to: to.clone(),
                    line: "blue".into(),
                    typical_seconds: 50,
                    typical_stop_seconds: 10,
                    typical_waiting_seconds: 0,
                });
            }
        }
        Arc::new(MemoryStore::from_snapshot(TopologySnapshot {
            lines: vec![Line {
                id: "blue".into(),
                name: "Blue".into(),
                network: "metro".into(),
                stations,
                typical_cars: 4,
            }],
            connections,
            ..Default::default()
        }))
    }

    pub(crate) struct Fixture {
        pub clock: ManualClock,
        pub presence: Arc<PresenceTracker>,
        pub memo: Arc<EdgeDurationMemo>,
        pub predictor: EtaPredictor,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock = ManualClock::new(now());
        let memo = Arc::new(EdgeDurationMemo::new());
        let presence = Arc::new(PresenceTracker::new(memo.clone()));
        let predictor =
            EtaPredictor::new(store(), presence.clone(), memo.clone(), Arc::new(clock.clone()));
        Fixture {
            clock,
            presence,
            memo,
            predictor,
        }
    }

    fn s(i: usize) -> StationIdentifier {
        StationIdentifier::new(format!("s{i}"))
    }

    fn seen(f: &Fixture, station: usize, direction: usize, seconds_ago: i64) {
        f.presence
            .register_presence(&s(station), &s(direction), now() - Duration::seconds(seconds_ago));
    }

    #[test]
    fn test_presence_two_stations_back() {
        let f = fixture();
        seen(&f, 3, 6, 40);

        let prediction = f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert_eq!(prediction.located_index, 3);
        assert_eq!(prediction.path_seconds, 120);
        assert_eq!(prediction.elapsed_seconds, 40);
        assert_eq!(prediction.eta_seconds, 80);
        assert!(!prediction.reversing);
    }

    #[test]
    fn test_no_presence_is_an_error() {
        let f = fixture();
        let err = f.predictor.next_train_eta(&s(5), &s(6)).unwrap_err();
        assert!(matches!(err, PredictionError::NoVehicleLocated { .. }));
    }

    #[test]
    fn test_non_terminal_direction_is_invalid() {
        let f = fixture();
        let err = f.predictor.next_train_eta(&s(5), &s(3)).unwrap_err();
        assert!(matches!(err, PredictionError::InvalidDirection { .. }));

        let err = f.predictor.next_train_eta(&s(99), &s(6)).unwrap_err();
        assert!(matches!(err, PredictionError::UnknownStation(_)));
    }

    #[test]
    fn test_candidate_too_far_ahead_is_skipped() {
        let f = fixture();
        // seen at s4 five minutes ago: should have passed s5 long ago
        seen(&f, 4, 6, 300);
        seen(&f, 1, 6, 30);

        let prediction = f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert_eq!(prediction.located_index, 1);
        assert_eq!(prediction.eta_seconds, 240 - 30);
    }

    #[test]
    fn test_slightly_early_vehicle_still_matches() {
        let f = fixture();
        // path 60 s, seen 85 s ago: deviation -25 s is within tolerance
        seen(&f, 4, 6, 85);

        let prediction = f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert_eq!(prediction.eta_seconds, -25);
        assert!(prediction.arrived());
    }

    #[test]
    fn test_scan_stops_once_deviation_worsens() {
        let f = fixture();
        seen(&f, 4, 6, 10); // deviation 50
        seen(&f, 3, 6, 0); // deviation 120, stop here
        seen(&f, 1, 6, 235); // deviation 5, never reached

        let prediction = f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert_eq!(prediction.located_index, 4);
        assert_eq!(prediction.eta_seconds, 50);
    }

    #[test]
    fn test_vehicle_on_opposite_leg_reverses() {
        let f = fixture();
        // heading to s0, seen at s2: 120 s to s0, turnaround, 180 s back to s3
        seen(&f, 2, 0, 20);

        let prediction = f.predictor.next_train_eta(&s(3), &s(6)).unwrap();
        assert!(prediction.reversing);
        assert_eq!(prediction.located_direction, s(0));
        assert_eq!(prediction.path_seconds, 120 + REVERSAL_SECONDS + 180);
        assert_eq!(prediction.eta_seconds, 420 - 20);
    }

    #[test]
    fn test_reversal_downwards() {
        let f = fixture();
        seen(&f, 6, 6, 0);

        let prediction = f.predictor.next_train_eta(&s(4), &s(0)).unwrap();
        assert!(prediction.reversing);
        assert_eq!(prediction.path_seconds, REVERSAL_SECONDS + 120);
    }

    #[test]
    fn test_memo_is_filled_by_queries() {
        let f = fixture();
        seen(&f, 3, 6, 40);
        f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert!(!f.memo.is_empty());

        f.presence.clear_memo();
        assert!(f.memo.is_empty());
        f.clock.advance(Duration::seconds(10));
        let prediction = f.predictor.next_train_eta(&s(5), &s(6)).unwrap();
        assert_eq!(prediction.eta_seconds, 70);
    }
}
