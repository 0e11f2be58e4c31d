//! Storage abstractions for the external data layer.

pub mod traits;

pub use traits::{CredentialStore, TopologyStore, TopologyTransaction};
