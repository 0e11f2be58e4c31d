//! Publishing the vehicle caches to subscribers.
//!
//! Each tick snapshots the ETA cache and the per-vehicle positions, encodes
//! both as protobuf and JSON in parallel, and publishes them at QoS 0 under the live
//! namespace (binary and JSON) and the staging namespace (binary only).

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use linewatch_api_types as api;
use linewatch_core::cache::{EtaKey, VehicleEta, VehicleEtaCache};
use linewatch_core::clock::Clock;
use linewatch_core::eta::{Eta, EtaUnits, PositionProjector, VehiclePosition};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;

pub const ETA_TOPIC: &str = "vehicle-etas";
pub const POSITION_TOPIC: &str = "vehicle-positions";

#[derive(Clone, Debug)]
pub struct Topics {
    pub live_prefix: String,
    pub staging_prefix: String,
}

impl Topics {
    pub fn binary(&self, name: &str) -> String {
        format!("{}/binary/{name}", self.live_prefix)
    }

    pub fn json(&self, name: &str) -> String {
        format!("{}/json/{name}", self.live_prefix)
    }

    pub fn staging_binary(&self, name: &str) -> String {
        format!("{}/binary/{name}", self.staging_prefix)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisseminationReport {
    pub etas: usize,
    pub positions: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Payloads that could not be encoded or positions that could not be projected
    pub failures: usize,
}

pub struct Disseminator {
    etas: Arc<VehicleEtaCache>,
    projector: Arc<PositionProjector>,
    broker: Arc<Broker>,
    clock: Arc<dyn Clock>,
    topics: Topics,
}

impl Disseminator {
    pub fn new(
        etas: Arc<VehicleEtaCache>,
        projector: Arc<PositionProjector>,
        broker: Arc<Broker>,
        clock: Arc<dyn Clock>,
        topics: Topics,
    ) -> Self {
        Self {
            etas,
            projector,
            broker,
            clock,
            topics,
        }
    }

    pub fn publish_once(&self) -> DisseminationReport {
        let now = self.clock.now();
        let mut report = DisseminationReport::default();

        let etas = api::VehicleEtaBatch {
            etas: self
                .etas
                .all()
                .iter()
                .map(|(key, entry)| eta_payload(key, entry, now))
                .collect(),
        };
        report.etas = etas.etas.len();

        let mut positions = api::VehiclePositionBatch::default();
        for entry in self.etas.current_positions() {
            match self.projector.project(&entry, now) {
                Ok(position) => positions.positions.push(position_payload(&position, now)),
                Err(err) => {
                    debug!(vehicle = %entry.vehicle, error = %err, "cannot place vehicle");
                    report.failures += 1;
                }
            }
        }
        report.positions = positions.positions.len();

        self.publish_all(ETA_TOPIC, &etas, &mut report);
        self.publish_all(POSITION_TOPIC, &positions, &mut report);

        info!(
            etas = report.etas,
            positions = report.positions,
            delivered = report.delivered,
            dropped = report.dropped,
            "disseminated"
        );
        report
    }

    /// Encodes JSON on a scoped thread while protobuf is encoded on this one
    fn publish_all<M>(&self, name: &str, message: &M, report: &mut DisseminationReport)
    where
        M: prost::Message + serde::Serialize + Sync,
    {
        let (binary, json) = std::thread::scope(|scope| {
            let json = scope.spawn(|| api::encode_json(message));
            let binary = Bytes::from(api::encode_binary(message));
            (binary, json.join())
        });

        self.publish(&self.topics.binary(name), binary.clone(), report);
        self.publish(&self.topics.staging_binary(name), binary, report);

        let json = match json {
            Ok(encoded) => encoded,
            Err(_) => {
                error!(topic = name, "JSON encoder thread panicked");
                report.failures += 1;
                return;
            }
        };
        match json {
            Ok(json) => self.publish(&self.topics.json(name), Bytes::from(json), report),
            Err(err) => {
                warn!(topic = name, error = %err, "cannot encode JSON payload");
                report.failures += 1;
            }
        }
    }

    fn publish(&self, topic: &str, payload: Bytes, report: &mut DisseminationReport) {
        let stats = self.broker.publish(topic, payload);
        report.delivered += stats.delivered;
        report.dropped += stats.dropped;
    }
}

fn seconds_u32(duration: Duration) -> u32 {
    u32::try_from(duration.num_seconds().max(0)).unwrap_or(u32::MAX)
}

fn in_units(seconds: i64, units: EtaUnits) -> i64 {
    match units {
        EtaUnits::Seconds => seconds,
        EtaUnits::Minutes => seconds.div_euclid(60),
    }
}

/// Wire form of a cached prediction as it reads at `now`
pub fn eta_payload(key: &EtaKey, entry: &VehicleEta, now: DateTime<Utc>) -> api::VehicleEta {
    let units = entry.units;
    let single = |seconds: i64| Some(api::Value::Single(in_units(seconds, units)));
    let (kind, value) = match entry.live_eta(now) {
        Eta::NotAvailable => (api::Kind::NotAvailable, None),
        Eta::Exact(seconds) => (api::Kind::Exact, single(seconds)),
        Eta::Interval { lower, upper } => (
            api::Kind::Interval,
            Some(api::Value::Interval(api::Interval {
                lower: in_units(lower, units),
                upper: in_units(upper, units),
            })),
        ),
        Eta::LessThan(seconds) => (api::Kind::LessThan, single(seconds)),
        Eta::MoreThan(seconds) => (api::Kind::MoreThan, single(seconds)),
        Eta::Timestamp(at) => (api::Kind::Timestamp, Some(api::Value::Single(at.timestamp()))),
    };

    let wire_units = match units {
        EtaUnits::Seconds => api::Units::Seconds,
        EtaUnits::Minutes => api::Units::Minutes,
    };

    api::VehicleEta {
        station: key.station.to_string(),
        direction: key.direction.to_string(),
        rank: u32::from(key.rank),
        computed: now.timestamp(),
        validity: seconds_u32(entry.expires_at() - now),
        kind: kind as i32,
        units: wire_units as i32,
        value,
        vehicle: entry.vehicle.to_string(),
        cars: entry.cars,
        platform: entry.platform.as_deref().map(str::to_owned),
    }
}

pub fn position_payload(position: &VehiclePosition, now: DateTime<Utc>) -> api::VehiclePosition {
    api::VehiclePosition {
        vehicle: position.vehicle.to_string(),
        line: position.line.to_string(),
        cars: position.cars,
        previous_station: position.previous_station.as_ref().map(ToString::to_string),
        next_station: position.next_station.to_string(),
        direction: position.direction.to_string(),
        platform: position.platform.as_deref().map(str::to_owned),
        percent: position.percent,
        computed: now.timestamp(),
        validity: seconds_u32(position.computed + position.validity - now),
    }
}
