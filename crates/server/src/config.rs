use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use linewatch_core::cache::ActivityConfig;
use linewatch_core::forecast::ForecastConfig;
use linewatch_core::timing::TimingConfig;

use crate::dissemination::Topics;

#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Serve TLS instead of plain TCP when set
    pub tls: Option<TlsConfig>,
    /// Plain HTTP listener for live signals and activity counts
    pub http_listen: Option<SocketAddr>,
    pub publish_interval: Duration,
    pub forecast_interval: Duration,
    pub timing_interval: Duration,
    pub topics: Topics,
    pub shutdown_grace: Duration,
    /// Key for the keyed hash stored credentials are checked against
    pub hashing_key: String,
    /// Frames buffered per client before publishes to it are dropped
    pub outbound_queue: usize,
    pub max_packet_size: usize,
    /// How long a fresh connection may take to send CONNECT
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls: None,
            http_listen: None,
            publish_interval: Duration::from_secs(30),
            forecast_interval: Duration::from_secs(10),
            timing_interval: Duration::from_secs(60 * 60),
            topics: Topics {
                live_prefix: "linewatch".into(),
                staging_prefix: "linewatch-dev".into(),
            },
            shutdown_grace: Duration::from_secs(5),
            hashing_key: String::new(),
            outbound_queue: 64,
            max_packet_size: 64 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Command line and environment options for `serve`
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Topology snapshot (stations, lines, connections, trips, credentials) as JSON
    #[arg(short, long, env = "LINEWATCH_TOPOLOGY")]
    pub topology: PathBuf,

    /// Address the MQTT listener binds to
    #[arg(long, env = "LINEWATCH_LISTEN", default_value = "0.0.0.0:1883")]
    pub listen: SocketAddr,

    /// Address the signal and activity HTTP endpoint binds to
    #[arg(long, env = "LINEWATCH_HTTP_LISTEN", default_value = "127.0.0.1:8080")]
    pub http_listen: SocketAddr,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, env = "LINEWATCH_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PKCS#8 PEM private key
    #[arg(long, env = "LINEWATCH_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "LINEWATCH_HASHING_KEY", hide_env_values = true)]
    pub hashing_key: String,

    /// Seconds between publications
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub publish_interval: u64,

    /// Seconds between prediction passes
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub forecast_interval: u64,

    /// Seconds between timing batches, the first one at startup; 0 disables them
    #[arg(long, default_value_t = 3600)]
    pub timing_interval: u64,

    #[arg(long, default_value = "linewatch")]
    pub live_prefix: String,

    #[arg(long, default_value = "linewatch-dev")]
    pub staging_prefix: String,

    /// Seconds allowed for a clean shutdown
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace: u64,

    /// Seconds a stored prediction stays valid
    #[arg(long, default_value_t = 90)]
    pub prediction_validity: i64,

    /// Round "users in transit" counts down to a multiple of this
    #[arg(long, default_value_t = 0)]
    pub fudge_bucket: usize,

    /// Stop the timing batch from hogging the store; milliseconds per trip
    #[arg(long)]
    pub timing_throttle_ms: Option<u64>,
}

impl ServeArgs {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            listen: self.listen,
            tls: self
                .tls_cert
                .clone()
                .zip(self.tls_key.clone())
                .map(|(certificate, private_key)| TlsConfig {
                    certificate,
                    private_key,
                }),
            http_listen: Some(self.http_listen),
            publish_interval: Duration::from_secs(self.publish_interval),
            forecast_interval: Duration::from_secs(self.forecast_interval),
            timing_interval: Duration::from_secs(self.timing_interval),
            topics: Topics {
                live_prefix: self.live_prefix.clone(),
                staging_prefix: self.staging_prefix.clone(),
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
            hashing_key: self.hashing_key.clone(),
            ..GatewayConfig::default()
        }
    }

    pub fn forecast_config(&self) -> ForecastConfig {
        ForecastConfig {
            validity: chrono::Duration::seconds(self.prediction_validity),
        }
    }

    pub fn activity_config(&self) -> ActivityConfig {
        ActivityConfig {
            fudge_bucket: self.fudge_bucket,
            ..ActivityConfig::default()
        }
    }

    pub fn timing_config(&self) -> TimingConfig {
        TimingConfig {
            throttle: self.timing_throttle_ms.map(Duration::from_millis),
            ..TimingConfig::default()
        }
    }
}
