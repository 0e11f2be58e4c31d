//! Topology, trip history and credential models.

pub mod types;

// Re-exports for convenience
pub use types::{
    Connection, ConnectionKey, CredentialPair, Heading, Line, Result, Station, StationUse,
    Transfer, TransferKey, TransitError, Trip, UseType,
};
