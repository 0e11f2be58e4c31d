//! Pluggable storage traits.
//!
//! The persistence layer that owns stations, lines, connections, transfers,
//! trips and credentials implements these. The realtime core only reads
//! through them and issues targeted writes of learned durations.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::identifiers::*;
use crate::models::types::*;

/// Read access to the network topology
pub trait TopologyStore: Send + Sync {
    fn station(&self, id: &StationIdentifier) -> Result<Option<Station>>;
    fn stations(&self) -> Result<Vec<Station>>;

    fn line(&self, id: &LineIdentifier) -> Result<Option<Arc<Line>>>;
    fn lines(&self) -> Result<Vec<Arc<Line>>>;

    /// Lines whose station sequence contains `station`
    fn lines_serving(&self, station: &StationIdentifier) -> Result<Vec<Arc<Line>>>;

    fn connection(&self, key: &ConnectionKey) -> Result<Option<Connection>>;
    fn transfer(&self, key: &TransferKey) -> Result<Option<Transfer>>;

    /// Open a read/write transaction. Writes become visible only on commit.
    fn begin(&self) -> Result<Box<dyn TopologyTransaction + '_>>;
}

/// One read/write unit of work against the topology and trip history
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// every staged write.
pub trait TopologyTransaction: Send {
    /// Trips that started at or after `since`, oldest first
    fn trips_since(&self, since: DateTime<Utc>) -> Result<Vec<Trip>>;

    fn connection(&self, key: &ConnectionKey) -> Result<Option<Connection>>;
    fn transfer(&self, key: &TransferKey) -> Result<Option<Transfer>>;

    /// Connections leaving `station`, on any line
    fn connections_from(&self, station: &StationIdentifier) -> Result<Vec<Connection>>;

    fn save_connection(&mut self, connection: &Connection) -> Result<()>;
    fn save_transfer(&mut self, transfer: &Transfer) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Lookup of API credential pairs
pub trait CredentialStore: Send + Sync {
    fn credential(&self, key: &str) -> Result<Option<CredentialPair>>;
}
