//! HTTP surface for live signals and activity counts.
//!
//! MQTT clients may only subscribe, so riders' apps report where they are
//! here. Every request carries an API key pair in the `x-api-key` and
//! `x-api-secret` headers, checked against the same credentials as CONNECT.

mod routes;

use std::sync::Arc;

use linewatch_core::cache::ActivityCache;
use linewatch_core::ingest::SignalIngestor;

use crate::auth::Authenticator;

pub use routes::{KEY_HEADER, SECRET_HEADER, create_router};

pub struct SignalApi {
    pub ingestor: Arc<SignalIngestor>,
    pub activity: Arc<ActivityCache>,
    pub authenticator: Arc<Authenticator>,
}
