use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use linewatch_transit::{
    ConnectionKey, LineIdentifier, StationIdentifier, TopologyStore, VehicleIdentifier,
};

use crate::cache::VehicleEta;
use crate::eta::predictor::PredictionError;
use crate::memo::EdgeDurationMemo;

/// Where a vehicle is between two stations
#[derive(Clone, Debug, PartialEq)]
pub struct VehiclePosition {
    pub vehicle: VehicleIdentifier,
    pub line: LineIdentifier,
    pub cars: u32,
    /// `None` when the vehicle has not left its first station yet
    pub previous_station: Option<StationIdentifier>,
    pub next_station: StationIdentifier,
    pub direction: StationIdentifier,
    pub platform: Option<Arc<str>>,
    /// Share of the segment already traveled, 0 to 100
    pub percent: f32,
    pub computed: DateTime<Utc>,
    pub validity: Duration,
}

/// Turns the soonest prediction for a vehicle into a point on its line
pub struct PositionProjector {
    store: Arc<dyn TopologyStore>,
    memo: Arc<EdgeDurationMemo>,
}

impl PositionProjector {
    pub fn new(store: Arc<dyn TopologyStore>, memo: Arc<EdgeDurationMemo>) -> Self {
        Self { store, memo }
    }

    pub fn project(
        &self,
        entry: &VehicleEta,
        now: DateTime<Utc>,
    ) -> Result<VehiclePosition, PredictionError> {
        let line = self
            .store
            .line(&entry.line)?
            .ok_or_else(|| PredictionError::UnknownStation(entry.station.clone()))?;
        let heading =
            line.heading_towards(&entry.direction)
                .ok_or_else(|| PredictionError::InvalidDirection {
                    station: entry.station.clone(),
                    direction: entry.direction.clone(),
                })?;
        let index = line
            .position(&entry.station)
            .ok_or_else(|| PredictionError::UnknownStation(entry.station.clone()))?;

        let previous_station = line
            .next_index(index, heading.reversed())
            .map(|previous| line.stations[previous].clone());

        let percent = match (&previous_station, entry.live_seconds(now)) {
            (Some(previous), Some(remaining)) => {
                let key = ConnectionKey::new(previous.clone(), entry.station.clone());
                let edge = self
                    .memo
                    .travel_seconds(self.store.as_ref(), &key)?
                    .ok_or(PredictionError::MissingConnection {
                        from: key.from,
                        to: key.to,
                    })?;
                segment_percent(remaining, edge)
            }
            (None, _) => 0.0,
            (Some(_), None) => 0.0,
        };

        Ok(VehiclePosition {
            vehicle: entry.vehicle.clone(),
            line: entry.line.clone(),
            cars: entry.cars,
            previous_station,
            next_station: entry.station.clone(),
            direction: entry.direction.clone(),
            platform: entry.platform.clone(),
            percent,
            computed: entry.computed,
            validity: entry.validity,
        })
    }
}

fn segment_percent(remaining: i64, edge: i64) -> f32 {
    if edge <= 0 {
        return 100.0;
    }
    let traveled = 1.0 - remaining as f32 / edge as f32;
    (traveled * 100.0).clamp(0.0, 100.0)
}
