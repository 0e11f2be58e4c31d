//! Core data types and enums for network topology and trip history.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::identifiers::*;

// ============================================================================
// Enums
// ============================================================================

/// How a rider used a station during a trip
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum UseType {
    /// Rider entered the network here and waited for a vehicle
    NetworkEntry,
    /// Rider changed lines at this station
    Interchange,
    /// Vehicle stopped here and the rider stayed on board
    GoneThrough,
    /// Rider visited the station without a known role (trip start/end)
    Visit,
}

/// Which way a vehicle traverses a line's station sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Heading {
    /// Towards the last station in sequence order (low index to high index)
    Up,
    /// Towards the first station in sequence order
    Down,
}

impl Heading {
    pub fn reversed(self) -> Self {
        match self {
            Heading::Up => Heading::Down,
            Heading::Down => Heading::Up,
        }
    }
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Station {
    pub id: StationIdentifier,
    pub name: Arc<str>,
    pub network: NetworkIdentifier,
}

/// A line: an ordered sequence of stations whose two endpoints identify
/// its two directions
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Line {
    pub id: LineIdentifier,
    pub name: Arc<str>,
    pub network: NetworkIdentifier,
    pub stations: Vec<StationIdentifier>,
    /// Car count reported for vehicles whose composition is not observed
    #[cfg_attr(feature = "serde", serde(default))]
    pub typical_cars: u32,
}

impl Line {
    pub fn first_station(&self) -> Option<&StationIdentifier> {
        self.stations.first()
    }

    pub fn last_station(&self) -> Option<&StationIdentifier> {
        self.stations.last()
    }

    pub fn position(&self, station: &StationIdentifier) -> Option<usize> {
        self.stations.iter().position(|s| s == station)
    }

    pub fn serves(&self, station: &StationIdentifier) -> bool {
        self.position(station).is_some()
    }

    /// Heading of vehicles travelling towards `terminal`, if it is one of
    /// this line's endpoints
    pub fn heading_towards(&self, terminal: &StationIdentifier) -> Option<Heading> {
        if self.stations.len() < 2 {
            return None;
        }
        if self.last_station() == Some(terminal) {
            Some(Heading::Up)
        } else if self.first_station() == Some(terminal) {
            Some(Heading::Down)
        } else {
            None
        }
    }

    /// Terminal station that identifies the given heading
    pub fn terminal(&self, heading: Heading) -> Option<&StationIdentifier> {
        match heading {
            Heading::Up => self.last_station(),
            Heading::Down => self.first_station(),
        }
    }

    /// Station a vehicle reaches after `index` when moving with `heading`
    pub fn next_index(&self, index: usize, heading: Heading) -> Option<usize> {
        match heading {
            Heading::Up if index + 1 < self.stations.len() => Some(index + 1),
            Heading::Down if index > 0 && index < self.stations.len() => Some(index - 1),
            _ => None,
        }
    }
}

/// Directed edge between two line-adjacent stations
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionKey {
    pub from: StationIdentifier,
    pub to: StationIdentifier,
}

impl ConnectionKey {
    pub fn new(from: StationIdentifier, to: StationIdentifier) -> Self {
        Self { from, to }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Connection {
    pub from: StationIdentifier,
    pub to: StationIdentifier,
    pub line: LineIdentifier,
    /// Mean transit time between the two stations
    #[cfg_attr(feature = "serde", serde(default))]
    pub typical_seconds: i32,
    /// Mean dwell at `from` when a vehicle stops and continues
    #[cfg_attr(feature = "serde", serde(default))]
    pub typical_stop_seconds: i32,
    /// Mean wait at `from` when it is where the rider entered the network
    #[cfg_attr(feature = "serde", serde(default))]
    pub typical_waiting_seconds: i32,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.from.clone(), self.to.clone())
    }

    /// Cost of traversing this edge, including the dwell at its origin
    pub fn travel_seconds(&self) -> i64 {
        i64::from(self.typical_seconds) + i64::from(self.typical_stop_seconds)
    }
}

/// Line change at a shared station
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferKey {
    pub station: StationIdentifier,
    pub from_line: LineIdentifier,
    pub to_line: LineIdentifier,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transfer {
    pub station: StationIdentifier,
    pub from_line: LineIdentifier,
    pub to_line: LineIdentifier,
    #[cfg_attr(feature = "serde", serde(default))]
    pub typical_seconds: i32,
}

impl Transfer {
    pub fn key(&self) -> TransferKey {
        TransferKey {
            station: self.station.clone(),
            from_line: self.from_line.clone(),
            to_line: self.to_line.clone(),
        }
    }
}

// ============================================================================
// Trip history
// ============================================================================

/// A single station visit within a recorded trip
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationUse {
    pub station: StationIdentifier,
    pub entry_time: DateTime<Utc>,
    pub leave_time: DateTime<Utc>,
    pub use_type: UseType,
    /// Segment extended by hand after the trip; carries no timing data
    #[cfg_attr(feature = "serde", serde(default))]
    pub manual: bool,
    /// Line the rider arrived on (interchanges only)
    #[cfg_attr(feature = "serde", serde(default))]
    pub source_line: Option<LineIdentifier>,
    /// Line the rider left on (interchanges only)
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_line: Option<LineIdentifier>,
}

impl StationUse {
    /// Seconds spent at the station
    pub fn dwell_seconds(&self) -> i64 {
        (self.leave_time - self.entry_time).num_seconds()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trip {
    pub id: TripIdentifier,
    pub start_time: DateTime<Utc>,
    pub station_uses: Vec<StationUse>,
}

/// API key and the keyed hash of its secret
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CredentialPair {
    pub key: Arc<str>,
    /// Hex-encoded keyed hash of the secret
    pub secret_hash: Arc<str>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    #[error("Station not found: {0}")]
    StationNotFound(StationIdentifier),

    #[error("Line not found: {0}")]
    LineNotFound(LineIdentifier),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, TransitError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn line() -> Line {
        Line {
            id: LineIdentifier::new("blue"),
            name: "Blue".into(),
            network: NetworkIdentifier::new("metro"),
            stations: ["a", "b", "c", "d"].into_iter().map(StationIdentifier::new).collect(),
            typical_cars: 6,
        }
    }

    #[test]
    fn test_line_heading_towards_terminals() {
        let line = line();
        assert_eq!(line.heading_towards(&StationIdentifier::new("d")), Some(Heading::Up));
        assert_eq!(line.heading_towards(&StationIdentifier::new("a")), Some(Heading::Down));
        assert_eq!(line.heading_towards(&StationIdentifier::new("b")), None);
    }

    #[test]
    fn test_line_next_index_stops_at_ends() {
        let line = line();
        assert_eq!(line.next_index(0, Heading::Up), Some(1));
        assert_eq!(line.next_index(3, Heading::Up), None);
        assert_eq!(line.next_index(0, Heading::Down), None);
        assert_eq!(line.next_index(2, Heading::Down), Some(1));
    }

    #[test]
    fn test_terminal_matches_heading() {
        let line = line();
        assert_eq!(line.terminal(Heading::Up).map(|s| s.as_str()), Some("d"));
        assert_eq!(line.terminal(Heading::Up.reversed()).map(|s| s.as_str()), Some("a"));
    }

    #[test]
    fn test_station_use_dwell() {
        let entry = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let station_use = StationUse {
            station: StationIdentifier::new("a"),
            entry_time: entry,
            leave_time: entry + chrono::Duration::seconds(45),
            use_type: UseType::NetworkEntry,
            manual: false,
            source_line: None,
            target_line: None,
        };
        assert_eq!(station_use.dwell_seconds(), 45);
    }

    #[test]
    fn test_connection_travel_includes_stop() {
        let connection = Connection {
            from: StationIdentifier::new("a"),
            to: StationIdentifier::new("b"),
            line: LineIdentifier::new("blue"),
            typical_seconds: 90,
            typical_stop_seconds: 25,
            typical_waiting_seconds: 120,
        };
        assert_eq!(connection.travel_seconds(), 115);
    }
}
