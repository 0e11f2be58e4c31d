//! Learning typical traversal, dwell and transfer durations from trip history.
//!
//! A batch walks every trip in the trailing window, accumulates per-edge
//! samples, and writes the means back through one store transaction. The
//! batch is all or nothing: any storage error drops the transaction and the
//! previously learned values stay authoritative.
//!
//! Two batches must not run against the same store at once; callers
//! serialize them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use linewatch_transit::{
    ConnectionKey, StationUse, TopologyStore, TopologyTransaction, TransferKey, TransitError, Trip,
    UseType,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Added to raw transit deltas; timestamps are taken after the doors close
/// and before they open
pub const TRANSIT_BIAS_SECONDS: i64 = 20;
/// Subtracted from raw interchange dwell for the same reason
pub const TRANSFER_BIAS_SECONDS: i64 = 20;

/// Samples at or above these limits are clock skew, not data
pub const MAX_TRANSIT_SECONDS: i64 = 10 * 60;
pub const MAX_TRANSFER_SECONDS: i64 = 15 * 60;
pub const MAX_DWELL_SECONDS: i64 = 3 * 60;

/// Fewer samples than this in a batch leave the stored value untouched
pub const MIN_SAMPLES: u32 = 2;

#[derive(Clone, Debug)]
pub struct TimingConfig {
    /// Trailing window of trips considered by a batch
    pub window: Duration,
    /// Pause after every trip, bounding the batch's resource usage
    pub throttle: Option<std::time::Duration>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            window: Duration::days(30),
            throttle: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimingError {
    #[error("timing batch aborted: {0}")]
    Store(#[from] TransitError),
}

#[derive(Clone, Copy, Debug, Default)]
struct Accumulator {
    sum: i64,
    count: u32,
}

impl Accumulator {
    fn push(&mut self, sample: i64) {
        self.sum += sample;
        self.count += 1;
    }

    fn significant_mean(&self) -> Option<f64> {
        (self.count >= MIN_SAMPLES).then(|| self.sum as f64 / f64::from(self.count))
    }
}

#[derive(Default)]
struct ConnectionSamples {
    transit: Accumulator,
    stop: Accumulator,
    wait: Accumulator,
}

#[derive(Default)]
struct Batch {
    connections: HashMap<ConnectionKey, ConnectionSamples>,
    transfers: HashMap<TransferKey, Accumulator>,
    report: BatchReport,
}

/// What a committed batch did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub trips: usize,
    pub connection_samples: usize,
    pub transfer_samples: usize,
    /// Samples whose connection or transfer no longer exists
    pub skipped_samples: usize,
    pub connections_updated: usize,
    pub transfers_updated: usize,
}

pub struct SegmentTimingEstimator {
    store: Arc<dyn TopologyStore>,
    clock: Arc<dyn Clock>,
    config: TimingConfig,
}

impl SegmentTimingEstimator {
    pub fn new(store: Arc<dyn TopologyStore>, clock: Arc<dyn Clock>, config: TimingConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Run one batch over the trailing window and commit the learned means
    pub fn run(&self) -> Result<BatchReport, TimingError> {
        let mut tx = self.store.begin()?;
        let since = self.clock.now() - self.config.window;
        let trips = tx.trips_since(since)?;

        let mut batch = Batch::default();
        for trip in &trips {
            accumulate_trip(&*tx, trip, &mut batch)?;
            batch.report.trips += 1;
            if let Some(pause) = self.config.throttle {
                std::thread::sleep(pause);
            }
        }

        write_connections(&mut *tx, &mut batch)?;
        write_transfers(&mut *tx, &mut batch)?;
        tx.commit()?;

        info!(
            trips = batch.report.trips,
            connection_samples = batch.report.connection_samples,
            transfer_samples = batch.report.transfer_samples,
            skipped = batch.report.skipped_samples,
            connections_updated = batch.report.connections_updated,
            transfers_updated = batch.report.transfers_updated,
            "timing batch committed"
        );
        Ok(batch.report)
    }
}

fn accumulate_trip(
    tx: &dyn TopologyTransaction,
    trip: &Trip,
    batch: &mut Batch,
) -> Result<(), TransitError> {
    for pair in trip.station_uses.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if prev.manual || cur.manual {
            continue;
        }

        if cur.use_type == UseType::Interchange {
            accumulate_transfer(tx, cur, batch)?;
        } else {
            accumulate_connection(tx, prev, cur, batch)?;
        }
    }
    Ok(())
}

fn accumulate_transfer(
    tx: &dyn TopologyTransaction,
    interchange: &StationUse,
    batch: &mut Batch,
) -> Result<(), TransitError> {
    let dwell = interchange.dwell_seconds();
    if !(0..MAX_TRANSFER_SECONDS).contains(&dwell) {
        return Ok(());
    }

    let (Some(from_line), Some(to_line)) = (&interchange.source_line, &interchange.target_line)
    else {
        batch.report.skipped_samples += 1;
        return Ok(());
    };
    let key = TransferKey {
        station: interchange.station.clone(),
        from_line: from_line.clone(),
        to_line: to_line.clone(),
    };
    if tx.transfer(&key)?.is_none() {
        debug!(station = %key.station, "transfer vanished from topology, skipping sample");
        batch.report.skipped_samples += 1;
        return Ok(());
    }

    batch
        .transfers
        .entry(key)
        .or_default()
        .push(dwell - TRANSFER_BIAS_SECONDS);
    batch.report.transfer_samples += 1;
    Ok(())
}

fn accumulate_connection(
    tx: &dyn TopologyTransaction,
    prev: &StationUse,
    cur: &StationUse,
    batch: &mut Batch,
) -> Result<(), TransitError> {
    let key = ConnectionKey::new(prev.station.clone(), cur.station.clone());
    if tx.connection(&key)?.is_none() {
        debug!(from = %key.from, to = %key.to, "connection vanished from topology, skipping sample");
        batch.report.skipped_samples += 1;
        return Ok(());
    }

    let samples = batch.connections.entry(key).or_default();

    let transit = (cur.entry_time - prev.leave_time).num_seconds();
    if (0..MAX_TRANSIT_SECONDS).contains(&transit) {
        samples.transit.push(transit + TRANSIT_BIAS_SECONDS);
        batch.report.connection_samples += 1;
    }

    let dwell = prev.dwell_seconds();
    if (0..MAX_DWELL_SECONDS).contains(&dwell) {
        match prev.use_type {
            UseType::NetworkEntry => samples.wait.push(dwell),
            UseType::GoneThrough => samples.stop.push(dwell),
            UseType::Interchange | UseType::Visit => {}
        }
    }
    Ok(())
}

fn write_connections(tx: &mut dyn TopologyTransaction, batch: &mut Batch) -> Result<(), TransitError> {
    for (key, samples) in &batch.connections {
        let Some(mut connection) = tx.connection(key)? else {
            continue;
        };

        let before = connection.clone();
        if let Some(mean) = samples.transit.significant_mean() {
            connection.typical_seconds = mean.round() as i32;
        }
        if let Some(mean) = samples.stop.significant_mean() {
            connection.typical_stop_seconds = mean.round() as i32;
        }
        if let Some(mean) = samples.wait.significant_mean() {
            connection.typical_waiting_seconds = mean.round() as i32;
        }

        if connection != before {
            tx.save_connection(&connection)?;
            batch.report.connections_updated += 1;
        }
    }
    Ok(())
}

/// Transfer means are corrected by the stop dwell of the connections that
/// leave the station on the destination line: edge costs are summed along a
/// path, so that dwell is already paid by the following connection.
///
/// Runs after [`write_connections`] so the correction sees this batch's stop
/// means through the transaction.
fn write_transfers(tx: &mut dyn TopologyTransaction, batch: &mut Batch) -> Result<(), TransitError> {
    for (key, samples) in &batch.transfers {
        let Some(mean) = samples.significant_mean() else {
            continue;
        };
        let Some(mut transfer) = tx.transfer(key)? else {
            continue;
        };

        let outgoing: Vec<i32> = tx
            .connections_from(&key.station)?
            .into_iter()
            .filter(|c| c.line == key.to_line)
            .map(|c| c.typical_stop_seconds)
            .collect();
        let correction = if outgoing.is_empty() {
            0.0
        } else {
            outgoing.iter().map(|&s| f64::from(s)).sum::<f64>() / outgoing.len() as f64
        };

        let corrected = (mean - correction).round().max(0.0) as i32;
        if corrected != transfer.typical_seconds {
            transfer.typical_seconds = corrected;
            tx.save_transfer(&transfer)?;
            batch.report.transfers_updated += 1;
        }
    }
    if batch.report.transfer_samples > 0 && batch.report.transfers_updated == 0 {
        warn!(
            samples = batch.report.transfer_samples,
            "transfer samples collected but no transfer reached significance"
        );
    }
    Ok(())
}
