pub mod activity;
pub mod ttl;
pub mod vehicle_eta;

pub use activity::{ActivityCache, ActivityConfig, ActivityError};
pub use ttl::TtlCache;
pub use vehicle_eta::{EtaKey, VehicleEta, VehicleEtaCache};
