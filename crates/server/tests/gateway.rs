use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use linewatch_api_types::{
    ActivityCount, SignalReport, VehicleEtaBatch, decode_binary, decode_json,
};
use linewatch_core::cache::{ActivityCache, ActivityConfig, VehicleEta, VehicleEtaCache};
use linewatch_core::clock::{Clock, SystemClock};
use linewatch_core::eta::{Eta, EtaUnits, PositionProjector};
use linewatch_core::ingest::SignalIngestor;
use linewatch_core::memo::EdgeDurationMemo;
use linewatch_core::presence::PresenceTracker;
use linewatch_server::auth::hash_secret;
use linewatch_server::dissemination::Topics;
use linewatch_server::http::{KEY_HEADER, SECRET_HEADER};
use linewatch_server::mqtt::codec::{self, PROTOCOL_LEVEL, PROTOCOL_NAME};
use linewatch_server::mqtt::{Connect, ConnectReturnCode, Packet, Publish, Subscribe};
use linewatch_server::{Gateway, GatewayConfig, GatewayHandle, GatewayServices, SignalServices};
use linewatch_transit::{
    Connection, CredentialPair, Line, MemoryStore, StationIdentifier, TopologySnapshot,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HASHING_KEY: &str = "pepper";

fn store() -> Arc<MemoryStore> {
    let stations: Vec<StationIdentifier> = ["a", "b", "c"].map(StationIdentifier::from).to_vec();
    let mut connections = Vec::new();
    for pair in stations.windows(2) {
        for (from, to) in [(&pair[0], &pair[1]), (&pair[1], &pair[0])] {
            connections.push(Connection {
                from: from.clone(),
                to: to.clone(),
                line: "green".into(),
                typical_seconds: 50,
                typical_stop_seconds: 10,
                typical_waiting_seconds: 0,
            });
        }
    }
    Arc::new(MemoryStore::from_snapshot(TopologySnapshot {
        lines: vec![Line {
            id: "green".into(),
            name: "Green".into(),
            network: "metro".into(),
            stations,
            typical_cars: 3,
        }],
        connections,
        credentials: vec![CredentialPair {
            key: "kiosk".into(),
            secret_hash: hash_secret(HASHING_KEY.as_bytes(), b"s3cret").unwrap().into(),
        }],
        ..Default::default()
    }))
}

async fn start() -> GatewayHandle {
    let store = store();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let etas = Arc::new(VehicleEtaCache::new(clock.clone()));
    etas.set(
        &"b".into(),
        &"c".into(),
        1,
        VehicleEta {
            vehicle: "green-1".into(),
            line: "green".into(),
            station: "b".into(),
            direction: "c".into(),
            computed: Utc::now(),
            validity: chrono::Duration::minutes(10),
            cars: 3,
            platform: None,
            eta: Eta::Exact(120),
            units: EtaUnits::Seconds,
        },
    );

    let config = GatewayConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        http_listen: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
        publish_interval: Duration::from_millis(50),
        topics: Topics {
            live_prefix: "live".into(),
            staging_prefix: "dev".into(),
        },
        hashing_key: HASHING_KEY.into(),
        shutdown_grace: Duration::from_secs(2),
        ..GatewayConfig::default()
    };
    let memo = Arc::new(EdgeDurationMemo::new());
    let presence = Arc::new(PresenceTracker::new(memo.clone()));
    let activity = Arc::new(ActivityCache::new(ActivityConfig::default(), clock.clone()));
    let ingestor = SignalIngestor::new(store.clone(), presence, activity.clone(), clock.clone());
    let services = GatewayServices {
        etas,
        projector: Arc::new(PositionProjector::new(store.clone(), memo)),
        credentials: store,
        clock,
        forecaster: None,
        timing: None,
        signals: Some(SignalServices {
            ingestor: Arc::new(ingestor),
            activity,
        }),
    };
    Gateway::start(config, services).await.unwrap()
}

struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    async fn open(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: Packet) {
        self.stream.write_all(&codec::to_bytes(&packet)).await.unwrap();
    }

    /// Next packet, or `None` once the server closed the connection
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = codec::decode(&mut self.buf, 1 << 20).unwrap() {
                return Some(packet);
            }
            let read = tokio::time::timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                .await
                .expect("server went quiet");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn login(&mut self, secret: &'static [u8]) -> ConnectReturnCode {
        self.send(Packet::Connect(Connect {
            protocol_name: PROTOCOL_NAME.into(),
            protocol_level: PROTOCOL_LEVEL,
            client_id: "integration".into(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: Some("kiosk".into()),
            password: Some(Bytes::from_static(secret)),
        }))
        .await;
        match self.recv().await {
            Some(Packet::ConnAck { code, .. }) => code,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    async fn next_publish(&mut self) -> Publish {
        loop {
            match self.recv().await {
                Some(Packet::Publish(publish)) => return publish,
                Some(_) => continue,
                None => panic!("connection closed while waiting for a publish"),
            }
        }
    }
}

#[tokio::test]
async fn test_subscriber_receives_etas_in_both_encodings() {
    let gateway = start().await;
    let mut client = Client::open(gateway.local_addr()).await;
    assert_eq!(client.login(b"s3cret").await, ConnectReturnCode::Accepted);

    client
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![("live/+/vehicle-etas".into(), 0)],
        }))
        .await;
    assert_eq!(
        client.recv().await,
        Some(Packet::SubAck {
            packet_id: 1,
            codes: vec![0]
        })
    );

    let mut seen_json = false;
    let mut seen_binary = false;
    while !(seen_json && seen_binary) {
        let publish = client.next_publish().await;
        let batch: VehicleEtaBatch = match publish.topic.as_str() {
            "live/json/vehicle-etas" => {
                seen_json = true;
                decode_json(&publish.payload).unwrap()
            }
            "live/binary/vehicle-etas" => {
                seen_binary = true;
                decode_binary(&publish.payload).unwrap()
            }
            other => panic!("unexpected topic {other}"),
        };
        assert_eq!(batch.etas.len(), 1);
        assert_eq!(batch.etas[0].station, "b");
        assert_eq!(batch.etas[0].vehicle, "green-1");
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_bad_secret_is_refused_and_closed() {
    let gateway = start().await;
    let mut client = Client::open(gateway.local_addr()).await;

    assert_eq!(
        client.login(b"guess").await,
        ConnectReturnCode::BadUsernameOrPassword
    );
    assert_eq!(client.recv().await, None);

    gateway.stop().await;
}

#[tokio::test]
async fn test_client_publish_drops_connection() {
    let gateway = start().await;
    let mut client = Client::open(gateway.local_addr()).await;
    assert_eq!(client.login(b"s3cret").await, ConnectReturnCode::Accepted);

    client
        .send(Packet::Publish(Publish::at_most_once(
            "live/json/vehicle-etas",
            Bytes::from_static(b"{}"),
        )))
        .await;
    assert_eq!(client.recv().await, None);

    gateway.stop().await;
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let gateway = start().await;
    let mut client = Client::open(gateway.local_addr()).await;
    assert_eq!(client.login(b"s3cret").await, ConnectReturnCode::Accepted);

    gateway.stop().await;
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn test_signal_endpoint_feeds_activity_counts() {
    let gateway = start().await;
    let base = format!("http://{}", gateway.http_addr().unwrap());
    let client = reqwest::Client::new();
    let report = SignalReport {
        user: "rider".into(),
        station: "b".into(),
        direction: "c".into(),
        lines: vec![],
        just_entered: true,
    };

    let accepted = client
        .post(format!("{base}/signals"))
        .header(KEY_HEADER, "kiosk")
        .header(SECRET_HEADER, "s3cret")
        .json(&report)
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), reqwest::StatusCode::NO_CONTENT);

    let count: ActivityCount = client
        .get(format!("{base}/activity/lines/green"))
        .header(KEY_HEADER, "kiosk")
        .header(SECRET_HEADER, "s3cret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        count,
        ActivityCount {
            id: "green".into(),
            riders: 1
        }
    );

    let refused = client
        .post(format!("{base}/signals"))
        .header(KEY_HEADER, "kiosk")
        .header(SECRET_HEADER, "guess")
        .json(&report)
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::UNAUTHORIZED);

    gateway.stop().await;
}
