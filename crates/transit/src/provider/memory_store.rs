//! In-memory store backed by a topology snapshot.
//!
//! Stands in for the external data layer: the server loads it from JSON and
//! tests build it directly. Stations and lines are immutable after load;
//! learned edge durations and the trip log live behind locks so the
//! transaction API can stage and commit writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::identifiers::*;
use crate::models::types::*;
use crate::store::traits::*;

/// Everything the store holds, in a shape that can be (de)serialized
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TopologySnapshot {
    pub stations: Vec<Station>,
    pub lines: Vec<Line>,
    pub connections: Vec<Connection>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub transfers: Vec<Transfer>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub trips: Vec<Trip>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub credentials: Vec<CredentialPair>,
}

#[derive(Default)]
struct Edges {
    connections: HashMap<ConnectionKey, Connection>,
    transfers: HashMap<TransferKey, Transfer>,
}

/// In-memory topology, trip and credential store
pub struct MemoryStore {
    stations: Vec<Station>,
    station_map: HashMap<StationIdentifier, Station>,
    lines: Vec<Arc<Line>>,
    line_map: HashMap<LineIdentifier, Arc<Line>>,
    lines_by_station: HashMap<StationIdentifier, Vec<Arc<Line>>>,
    credentials: HashMap<Arc<str>, CredentialPair>,

    edges: RwLock<Edges>,
    trips: RwLock<Vec<Trip>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::from_snapshot(TopologySnapshot::default())
    }

    /// Build store from raw data (used by deserializer)
    pub fn from_snapshot(snapshot: TopologySnapshot) -> Self {
        let TopologySnapshot {
            stations,
            lines,
            connections,
            transfers,
            mut trips,
            credentials,
        } = snapshot;

        let station_map: HashMap<_, _> = stations
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let lines: Vec<Arc<Line>> = lines.into_iter().map(Arc::new).collect();
        let line_map: HashMap<_, _> = lines.iter().map(|l| (l.id.clone(), l.clone())).collect();

        let mut lines_by_station: HashMap<StationIdentifier, Vec<Arc<Line>>> = HashMap::new();
        for line in &lines {
            for station in &line.stations {
                lines_by_station
                    .entry(station.clone())
                    .or_default()
                    .push(line.clone());
            }
        }

        let edges = Edges {
            connections: connections.into_iter().map(|c| (c.key(), c)).collect(),
            transfers: transfers.into_iter().map(|t| (t.key(), t)).collect(),
        };

        trips.sort_by_key(|t| t.start_time);

        let credentials = credentials
            .into_iter()
            .map(|c| (c.key.clone(), c))
            .collect();

        Self {
            stations,
            station_map,
            lines,
            line_map,
            lines_by_station,
            credentials,
            edges: RwLock::new(edges),
            trips: RwLock::new(trips),
        }
    }

    /// Append a completed trip to the history
    pub fn record_trip(&self, trip: Trip) -> Result<()> {
        let mut trips = self
            .trips
            .write()
            .map_err(|_| TransitError::Storage("trip log lock poisoned".into()))?;
        let at = trips.partition_point(|t| t.start_time <= trip.start_time);
        trips.insert(at, trip);
        Ok(())
    }

    fn read_edges(&self) -> Result<RwLockReadGuard<'_, Edges>> {
        self.edges
            .read()
            .map_err(|_| TransitError::Storage("edge table lock poisoned".into()))
    }

    fn write_edges(&self) -> Result<RwLockWriteGuard<'_, Edges>> {
        self.edges
            .write()
            .map_err(|_| TransitError::Storage("edge table lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore for MemoryStore {
    fn station(&self, id: &StationIdentifier) -> Result<Option<Station>> {
        Ok(self.station_map.get(id).cloned())
    }

    fn stations(&self) -> Result<Vec<Station>> {
        Ok(self.stations.clone())
    }

    fn line(&self, id: &LineIdentifier) -> Result<Option<Arc<Line>>> {
        Ok(self.line_map.get(id).cloned())
    }

    fn lines(&self) -> Result<Vec<Arc<Line>>> {
        Ok(self.lines.clone())
    }

    fn lines_serving(&self, station: &StationIdentifier) -> Result<Vec<Arc<Line>>> {
        Ok(self
            .lines_by_station
            .get(station)
            .cloned()
            .unwrap_or_default())
    }

    fn connection(&self, key: &ConnectionKey) -> Result<Option<Connection>> {
        Ok(self.read_edges()?.connections.get(key).cloned())
    }

    fn transfer(&self, key: &TransferKey) -> Result<Option<Transfer>> {
        Ok(self.read_edges()?.transfers.get(key).cloned())
    }

    fn begin(&self) -> Result<Box<dyn TopologyTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged_connections: HashMap::new(),
            staged_transfers: HashMap::new(),
        }))
    }
}

impl CredentialStore for MemoryStore {
    fn credential(&self, key: &str) -> Result<Option<CredentialPair>> {
        Ok(self.credentials.get(key).cloned())
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Staged writes against a [`MemoryStore`]
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    staged_connections: HashMap<ConnectionKey, Connection>,
    staged_transfers: HashMap<TransferKey, Transfer>,
}

impl TopologyTransaction for MemoryTransaction<'_> {
    fn trips_since(&self, since: DateTime<Utc>) -> Result<Vec<Trip>> {
        let trips = self
            .store
            .trips
            .read()
            .map_err(|_| TransitError::Storage("trip log lock poisoned".into()))?;
        let from = trips.partition_point(|t| t.start_time < since);
        Ok(trips[from..].to_vec())
    }

    fn connection(&self, key: &ConnectionKey) -> Result<Option<Connection>> {
        if let Some(staged) = self.staged_connections.get(key) {
            return Ok(Some(staged.clone()));
        }
        self.store.connection(key)
    }

    fn transfer(&self, key: &TransferKey) -> Result<Option<Transfer>> {
        if let Some(staged) = self.staged_transfers.get(key) {
            return Ok(Some(staged.clone()));
        }
        self.store.transfer(key)
    }

    fn connections_from(&self, station: &StationIdentifier) -> Result<Vec<Connection>> {
        let edges = self.store.read_edges()?;
        Ok(edges
            .connections
            .values()
            .filter(|c| &c.from == station)
            .map(|c| {
                self.staged_connections
                    .get(&c.key())
                    .cloned()
                    .unwrap_or_else(|| c.clone())
            })
            .collect())
    }

    fn save_connection(&mut self, connection: &Connection) -> Result<()> {
        self.staged_connections
            .insert(connection.key(), connection.clone());
        Ok(())
    }

    fn save_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.staged_transfers.insert(transfer.key(), transfer.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            store,
            staged_connections,
            staged_transfers,
        } = *self;

        let mut edges = store.write_edges()?;
        edges.connections.extend(staged_connections);
        edges.transfers.extend(staged_transfers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn connection(from: &str, to: &str, seconds: i32) -> Connection {
        Connection {
            from: from.into(),
            to: to.into(),
            line: "blue".into(),
            typical_seconds: seconds,
            typical_stop_seconds: 0,
            typical_waiting_seconds: 0,
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::from_snapshot(TopologySnapshot {
            stations: vec![Station {
                id: "a".into(),
                name: "Alpha".into(),
                network: "metro".into(),
            }],
            lines: vec![Line {
                id: "blue".into(),
                name: "Blue".into(),
                network: "metro".into(),
                stations: vec!["a".into(), "b".into(), "c".into()],
                typical_cars: 3,
            }],
            connections: vec![connection("a", "b", 60), connection("b", "c", 70)],
            credentials: vec![CredentialPair {
                key: "client".into(),
                secret_hash: "00".into(),
            }],
            ..Default::default()
        })
    }

    #[test]
    fn test_empty_store() {
        let store = MemoryStore::new();
        assert_eq!(store.lines().unwrap().len(), 0);
        assert_eq!(store.stations().unwrap().len(), 0);
    }

    #[test]
    fn test_store_lookups() {
        let store = store();
        assert!(store.station(&"a".into()).unwrap().is_some());
        assert_eq!(store.lines_serving(&"b".into()).unwrap().len(), 1);
        assert!(store.lines_serving(&"z".into()).unwrap().is_empty());
        assert!(store.credential("client").unwrap().is_some());
        assert!(store.credential("nobody").unwrap().is_none());
    }

    #[test]
    fn test_writes_invisible_until_commit() {
        let store = store();
        let key = ConnectionKey::new("a".into(), "b".into());

        let mut tx = store.begin().unwrap();
        tx.save_connection(&connection("a", "b", 99)).unwrap();
        assert_eq!(tx.connection(&key).unwrap().unwrap().typical_seconds, 99);
        assert_eq!(store.connection(&key).unwrap().unwrap().typical_seconds, 60);

        tx.commit().unwrap();
        assert_eq!(store.connection(&key).unwrap().unwrap().typical_seconds, 99);
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let store = store();
        let key = ConnectionKey::new("b".into(), "c".into());
        {
            let mut tx = store.begin().unwrap();
            tx.save_connection(&connection("b", "c", 1)).unwrap();
        }
        assert_eq!(store.connection(&key).unwrap().unwrap().typical_seconds, 70);
    }

    #[test]
    fn test_trips_since_filters_window() {
        let store = store();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for (i, days) in [40, 10, 1].into_iter().enumerate() {
            store
                .record_trip(Trip {
                    id: format!("t{i}").into(),
                    start_time: base - chrono::Duration::days(days),
                    station_uses: vec![],
                })
                .unwrap();
        }

        let tx = store.begin().unwrap();
        let trips = tx.trips_since(base - chrono::Duration::days(30)).unwrap();
        assert_eq!(trips.len(), 2);
        assert!(trips[0].start_time < trips[1].start_time);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_snapshot_from_json() {
        let json = r#"{
            "stations": [{"id": "a", "name": "Alpha", "network": "metro"}],
            "lines": [{"id": "blue", "name": "Blue", "network": "metro", "stations": ["a", "b"]}],
            "connections": [{"from": "a", "to": "b", "line": "blue", "typical_seconds": 80}]
        }"#;
        let snapshot: TopologySnapshot = serde_json::from_str(json).unwrap();
        let store = MemoryStore::from_snapshot(snapshot);
        let key = ConnectionKey::new("a".into(), "b".into());
        assert_eq!(store.connection(&key).unwrap().unwrap().typical_seconds, 80);
    }
}
