use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use linewatch_api_types::{ActivityCount, SignalReport};
use linewatch_core::cache::ActivityError;
use linewatch_core::ingest::{IngestError, LiveSignal};
use linewatch_transit::{LineIdentifier, NetworkIdentifier, TransitError};
use tracing::{debug, warn};

use super::SignalApi;

pub const KEY_HEADER: &str = "x-api-key";
pub const SECRET_HEADER: &str = "x-api-secret";

pub fn create_router(api: Arc<SignalApi>) -> Router {
    Router::new()
        .route("/signals", post(report_signal))
        .route("/activity/lines/{line}", get(line_activity))
        .route("/activity/networks/{network}", get(network_activity))
        .route("/health", get(health))
        .with_state(api)
}

fn authorize(api: &SignalApi, headers: &HeaderMap) -> Result<(), StatusCode> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let (Some(key), Some(secret)) = (header(KEY_HEADER), header(SECRET_HEADER)) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match api.authenticator.verify(key, secret.as_bytes()) {
        Ok(true) => Ok(()),
        Ok(false) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            warn!(error = %err, "credential check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn status_of(err: &IngestError) -> StatusCode {
    match err {
        IngestError::Store(TransitError::LineNotFound(_) | TransitError::StationNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        IngestError::Store(TransitError::InvalidData(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::Store(TransitError::Storage(_))
        | IngestError::Activity(ActivityError::TooManyIds { .. }) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn report_signal(
    State(api): State<Arc<SignalApi>>,
    headers: HeaderMap,
    Json(report): Json<SignalReport>,
) -> Response {
    if let Err(status) = authorize(&api, &headers) {
        return status.into_response();
    }

    let signal = LiveSignal {
        user: report.user.into(),
        station: report.station.into(),
        direction: report.direction.into(),
        lines: report.lines.into_iter().map(LineIdentifier::from).collect(),
        just_entered: report.just_entered,
    };
    match api.ingestor.report(&signal) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let status = status_of(&err);
            debug!(user = %signal.user, error = %err, %status, "signal refused");
            (status, err.to_string()).into_response()
        }
    }
}

async fn line_activity(
    State(api): State<Arc<SignalApi>>,
    headers: HeaderMap,
    Path(line): Path<String>,
) -> Response {
    if let Err(status) = authorize(&api, &headers) {
        return status.into_response();
    }
    let riders = api.activity.count_line(&LineIdentifier::from(line.as_str()));
    Json(ActivityCount {
        id: line,
        riders: riders as u64,
    })
    .into_response()
}

async fn network_activity(
    State(api): State<Arc<SignalApi>>,
    headers: HeaderMap,
    Path(network): Path<String>,
) -> Response {
    if let Err(status) = authorize(&api, &headers) {
        return status.into_response();
    }
    let riders = api
        .activity
        .count_network(&NetworkIdentifier::from(network.as_str()));
    Json(ActivityCount {
        id: network,
        riders: riders as u64,
    })
    .into_response()
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use linewatch_core::cache::{ActivityCache, ActivityConfig};
    use linewatch_core::clock::{Clock, ManualClock};
    use linewatch_core::ingest::SignalIngestor;
    use linewatch_core::memo::EdgeDurationMemo;
    use linewatch_core::presence::PresenceTracker;

    use crate::auth::tests::authenticator;
    use crate::dissemination::tests::{now, store};

    fn api() -> (Arc<PresenceTracker>, Arc<SignalApi>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
        let presence = Arc::new(PresenceTracker::new(Arc::new(EdgeDurationMemo::new())));
        let activity = Arc::new(ActivityCache::new(ActivityConfig::default(), clock.clone()));
        let ingestor = SignalIngestor::new(store(), presence.clone(), activity.clone(), clock);
        let api = SignalApi {
            ingestor: Arc::new(ingestor),
            activity,
            authenticator: Arc::new(authenticator()),
        };
        (presence, Arc::new(api))
    }

    fn headers(secret: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static("kiosk"));
        headers.insert(SECRET_HEADER, HeaderValue::from_static(secret));
        headers
    }

    fn report(lines: Vec<String>) -> SignalReport {
        SignalReport {
            user: "rider".into(),
            station: "b".into(),
            direction: "c".into(),
            lines,
            just_entered: true,
        }
    }

    #[tokio::test]
    async fn test_signal_feeds_presence_and_counts() {
        let (presence, api) = api();

        let response = report_signal(State(api.clone()), headers("s3cret"), Json(report(vec![]))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(presence.last_seen(&"b".into(), &"c".into()), Some(now()));

        let response = line_activity(State(api.clone()), headers("s3cret"), Path("green".into())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(api.activity.count_line(&"green".into()), 1);

        let response =
            network_activity(State(api.clone()), headers("s3cret"), Path("metro".into())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(api.activity.count_network(&"metro".into()), 1);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_rejected() {
        let (presence, api) = api();

        let response = report_signal(State(api.clone()), headers("guess"), Json(report(vec![]))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(presence.readings().is_empty());

        let response =
            line_activity(State(api.clone()), HeaderMap::new(), Path("green".into())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_line_is_not_found() {
        let (presence, api) = api();

        let response = report_signal(
            State(api),
            headers("s3cret"),
            Json(report(vec!["purple".into()])),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(presence.readings().is_empty());
    }

    #[test]
    fn test_tracking_limit_maps_to_unavailable() {
        let err = IngestError::Activity(ActivityError::TooManyIds {
            id: "green".into(),
            limit: 1,
        });
        assert_eq!(status_of(&err), StatusCode::SERVICE_UNAVAILABLE);
    }
}
