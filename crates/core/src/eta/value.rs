use chrono::{DateTime, Utc};
use strum::{Display, EnumDiscriminants};

/// Unit a client should render an ETA in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EtaUnits {
    #[default]
    Seconds,
    Minutes,
}

/// Arrival estimate as of the moment it was computed
///
/// Relative variants hold seconds from the computation time; they are aged
/// with [`aged`](Self::aged) before being shown to anyone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(EtaKind), derive(Hash, Display))]
pub enum Eta {
    NotAvailable,
    Exact(i64),
    Interval { lower: i64, upper: i64 },
    LessThan(i64),
    MoreThan(i64),
    Timestamp(DateTime<Utc>),
}

impl Eta {
    /// Point estimate in seconds from `computed`, used to rank arrivals
    pub fn soonest_seconds(&self, computed: DateTime<Utc>) -> Option<i64> {
        match *self {
            Eta::NotAvailable => None,
            Eta::Exact(seconds) | Eta::MoreThan(seconds) => Some(seconds),
            Eta::Interval { lower, .. } => Some(lower),
            Eta::LessThan(_) => Some(0),
            Eta::Timestamp(at) => Some((at - computed).num_seconds()),
        }
    }

    /// The same estimate seen `elapsed_seconds` later
    pub fn aged(&self, elapsed_seconds: i64) -> Eta {
        match *self {
            Eta::Exact(seconds) => Eta::Exact(seconds - elapsed_seconds),
            Eta::Interval { lower, upper } => Eta::Interval {
                lower: lower - elapsed_seconds,
                upper: upper - elapsed_seconds,
            },
            Eta::LessThan(seconds) => Eta::LessThan(seconds - elapsed_seconds),
            Eta::MoreThan(seconds) => Eta::MoreThan(seconds - elapsed_seconds),
            other @ (Eta::NotAvailable | Eta::Timestamp(_)) => other,
        }
    }
}
