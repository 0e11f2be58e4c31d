//! Periodic pass that fills the vehicle ETA cache.
//!
//! Every station of every line is predicted in both directions. Predictions
//! that trace back to the same presence observation describe the same
//! physical vehicle, so the vehicle id is derived from that observation.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Duration;
use linewatch_transit::{StationIdentifier, TopologyStore, TransitError, VehicleIdentifier};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use crate::cache::{ActivityCache, VehicleEta, VehicleEtaCache};
use crate::clock::Clock;
use crate::eta::{Eta, EtaPredictor, EtaUnits, Prediction, PredictionError};

const VEHICLE_ID_SEED: u64 = 0x6c69_6e65;

#[derive(Clone, Debug)]
pub struct ForecastConfig {
    /// How long a stored prediction stays valid after it was computed
    pub validity: Duration,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            validity: Duration::seconds(90),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForecastReport {
    pub predictions: usize,
    /// Station/direction pairs without a usable prediction
    pub soft_failures: usize,
    pub expired_etas: usize,
    pub dropped_activity_caches: usize,
}

pub struct Forecaster {
    store: Arc<dyn TopologyStore>,
    predictor: Arc<EtaPredictor>,
    etas: Arc<VehicleEtaCache>,
    activity: Arc<ActivityCache>,
    clock: Arc<dyn Clock>,
    config: ForecastConfig,
}

impl Forecaster {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        predictor: Arc<EtaPredictor>,
        etas: Arc<VehicleEtaCache>,
        activity: Arc<ActivityCache>,
        clock: Arc<dyn Clock>,
        config: ForecastConfig,
    ) -> Self {
        Self {
            store,
            predictor,
            etas,
            activity,
            clock,
            config,
        }
    }

    /// Predict every station and direction, then sweep expired cache state.
    /// Only a storage failure aborts the pass.
    pub fn run_pass(&self) -> Result<ForecastReport, TransitError> {
        let mut report = ForecastReport::default();

        for line in self.store.lines()? {
            let terminals: Vec<StationIdentifier> = [line.first_station(), line.last_station()]
                .into_iter()
                .flatten()
                .cloned()
                .collect();

            for station in &line.stations {
                for direction in &terminals {
                    match self.predictor.next_train_eta(station, direction) {
                        Ok(prediction) => {
                            self.store_prediction(&prediction);
                            report.predictions += 1;
                        }
                        Err(PredictionError::Store(err)) => return Err(err),
                        Err(err @ PredictionError::MissingConnection { .. }) => {
                            warn!(line = %line.id, error = %err, "topology gap");
                            report.soft_failures += 1;
                        }
                        Err(err) => {
                            debug!(error = %err, "no prediction");
                            report.soft_failures += 1;
                        }
                    }
                }
            }
        }

        report.expired_etas = self.etas.sweep();
        report.dropped_activity_caches = self.activity.sweep();

        info!(
            predictions = report.predictions,
            soft_failures = report.soft_failures,
            expired_etas = report.expired_etas,
            "forecast pass finished"
        );
        Ok(report)
    }

    fn store_prediction(&self, prediction: &Prediction) {
        let value = VehicleEta {
            vehicle: vehicle_id(prediction),
            line: prediction.line.id.clone(),
            station: prediction.station.clone(),
            direction: prediction.direction.clone(),
            computed: self.clock.now(),
            validity: self.config.validity,
            cars: prediction.line.typical_cars,
            platform: None,
            eta: Eta::Exact(prediction.eta_seconds),
            units: EtaUnits::Seconds,
        };
        self.etas
            .set(&prediction.station, &prediction.direction, 1, value);
    }
}

/// Stable id for the vehicle behind a prediction
pub fn vehicle_id(prediction: &Prediction) -> VehicleIdentifier {
    let mut hasher = XxHash64::with_seed(VEHICLE_ID_SEED);
    prediction.line.id.hash(&mut hasher);
    prediction.located_station.hash(&mut hasher);
    prediction.located_direction.hash(&mut hasher);
    prediction.seen_at.timestamp().hash(&mut hasher);
    VehicleIdentifier::new(format!("{}-{:016x}", prediction.line.id, hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ActivityConfig;
    use crate::eta::predictor::tests::{fixture, now, store};

    #[test]
    fn test_pass_collapses_one_observation_into_one_vehicle() {
        let f = fixture();
        f.presence.register_presence(
            &"s3".into(),
            &"s6".into(),
            now() - Duration::seconds(40),
        );

        let clock: Arc<dyn Clock> = Arc::new(f.clock.clone());
        let etas = Arc::new(VehicleEtaCache::new(clock.clone()));
        let activity = Arc::new(ActivityCache::new(ActivityConfig::default(), clock.clone()));
        let forecaster = Forecaster::new(
            store(),
            Arc::new(f.predictor),
            etas.clone(),
            activity,
            clock,
            ForecastConfig::default(),
        );

        let report = forecaster.run_pass().unwrap();
        // s0..s3 towards s6 have nothing in range
        assert_eq!(report.soft_failures, 4);
        assert_eq!(report.predictions, 10);

        let ahead = etas.get(&"s5".into(), &"s6".into(), 1);
        assert_eq!(ahead.len(), 1);
        assert_eq!(ahead[0].eta, Eta::Exact(80));
        assert_eq!(ahead[0].cars, 4);

        let positions = etas.current_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].station.as_str(), "s4");
        assert!(positions[0].vehicle.as_str().starts_with("blue-"));
    }

    #[test]
    fn test_empty_network_produces_nothing() {
        let f = fixture();
        let clock: Arc<dyn Clock> = Arc::new(f.clock.clone());
        let etas = Arc::new(VehicleEtaCache::new(clock.clone()));
        let forecaster = Forecaster::new(
            store(),
            Arc::new(f.predictor),
            etas.clone(),
            Arc::new(ActivityCache::new(ActivityConfig::default(), clock.clone())),
            clock,
            ForecastConfig::default(),
        );

        let report = forecaster.run_pass().unwrap();
        assert_eq!(report.predictions, 0);
        assert_eq!(report.soft_failures, 14);
        assert!(etas.is_empty());
    }
}
