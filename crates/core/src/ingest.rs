use std::sync::Arc;

use linewatch_transit::{
    Line, LineIdentifier, StationIdentifier, TopologyStore, TransitError, UserIdentifier,
};
use tracing::debug;

use crate::cache::{ActivityCache, ActivityError};
use crate::clock::Clock;
use crate::presence::PresenceTracker;

/// A rider reporting where they are
#[derive(Clone, Debug)]
pub struct LiveSignal {
    pub user: UserIdentifier,
    pub station: StationIdentifier,
    /// Terminal the rider's vehicle is heading to
    pub direction: StationIdentifier,
    /// Lines the rider is on; empty means every line serving the station
    /// towards `direction`
    pub lines: Vec<LineIdentifier>,
    pub just_entered: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] TransitError),

    #[error(transparent)]
    Activity(#[from] ActivityError),
}

/// Feeds live signals into presence and activity tracking
pub struct SignalIngestor {
    store: Arc<dyn TopologyStore>,
    presence: Arc<PresenceTracker>,
    activity: Arc<ActivityCache>,
    clock: Arc<dyn Clock>,
}

impl SignalIngestor {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        presence: Arc<PresenceTracker>,
        activity: Arc<ActivityCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            presence,
            activity,
            clock,
        }
    }

    pub fn report(&self, signal: &LiveSignal) -> Result<(), IngestError> {
        let lines = self.resolve_lines(signal)?;
        self.activity
            .register_activity(&lines, &signal.user, signal.just_entered)?;
        self.presence
            .register_presence(&signal.station, &signal.direction, self.clock.now());
        debug!(user = %signal.user, station = %signal.station, lines = lines.len(), "signal ingested");
        Ok(())
    }

    fn resolve_lines(&self, signal: &LiveSignal) -> Result<Vec<Arc<Line>>, IngestError> {
        if signal.lines.is_empty() {
            let serving = self.store.lines_serving(&signal.station)?;
            return Ok(serving
                .into_iter()
                .filter(|line| line.heading_towards(&signal.direction).is_some())
                .collect());
        }
        signal
            .lines
            .iter()
            .map(|id| -> Result<Arc<Line>, IngestError> {
                self.store
                    .line(id)?
                    .ok_or_else(|| TransitError::LineNotFound(id.clone()).into())
            })
            .collect()
    }
}
