pub mod cache;
pub mod clock;
pub mod eta;
pub mod forecast;
pub mod ingest;
pub mod memo;
pub mod presence;
pub mod timing;

// Re-export transit from the transit crate
pub use linewatch_transit as transit;
