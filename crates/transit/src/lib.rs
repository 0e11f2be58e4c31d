//! # linewatch-transit
//!
//! Network topology, trip history and the storage seams the realtime core
//! talks through.
//!
//! ## Features
//!
//! - **Typed identifiers**: cheap-to-clone `Arc<str>` ids for every entity
//! - **Line model**: ordered station sequences with two terminal-named directions
//! - **Store traits**: read access plus transactional writes of learned durations
//! - **In-memory store**: snapshot-backed implementation for tools and tests
//!
//! ## Example
//!
//! ```
//! use linewatch_transit::prelude::*;
//!
//! let line = Line {
//!     id: LineIdentifier::new("green"),
//!     name: "Green".into(),
//!     network: NetworkIdentifier::new("metro"),
//!     stations: vec!["cais-sodre".into(), "baixa-chiado".into(), "rossio".into()],
//!     typical_cars: 6,
//! };
//!
//! let store = MemoryStore::from_snapshot(TopologySnapshot {
//!     lines: vec![line],
//!     ..Default::default()
//! });
//!
//! let serving = store.lines_serving(&"rossio".into()).unwrap();
//! assert_eq!(serving.len(), 1);
//! assert_eq!(serving[0].heading_towards(&"rossio".into()), Some(Heading::Up));
//! ```

pub mod identifiers;
pub mod models;
pub mod provider;
pub mod store;

// Re-exports for convenience
pub mod prelude {
    pub use crate::identifiers::*;
    pub use crate::models::types::*;
    pub use crate::provider::{MemoryStore, TopologySnapshot};
    pub use crate::store::traits::*;
}

pub use prelude::*;
