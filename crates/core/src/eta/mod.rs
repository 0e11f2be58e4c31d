pub mod position;
pub mod predictor;
pub mod value;

pub use position::{PositionProjector, VehiclePosition};
pub use predictor::{EtaPredictor, Prediction, PredictionError};
pub use value::{Eta, EtaKind, EtaUnits};
