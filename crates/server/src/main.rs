use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use linewatch_core::cache::{ActivityCache, VehicleEtaCache};
use linewatch_core::clock::{Clock, SystemClock};
use linewatch_core::eta::{EtaPredictor, PositionProjector};
use linewatch_core::forecast::Forecaster;
use linewatch_core::ingest::SignalIngestor;
use linewatch_core::memo::EdgeDurationMemo;
use linewatch_core::presence::PresenceTracker;
use linewatch_core::timing::SegmentTimingEstimator;
use linewatch_server::auth::hash_secret;
use linewatch_server::{Gateway, GatewayServices, ServeArgs, SignalServices};
use linewatch_transit::{MemoryStore, TopologySnapshot, TopologyStore};
use tracing::{Level, info};

#[derive(Parser, Debug)]
#[command(
    name = "linewatch",
    author,
    version,
    about = "Realtime vehicle ETA and position gateway over MQTT"
)]
struct Cli {
    /// Maximum log level
    #[arg(long, global = true, default_value = "info", env = "LINEWATCH_LOG")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway
    Serve(ServeArgs),

    /// Print the stored form of an API secret
    HashSecret {
        #[arg(long, env = "LINEWATCH_HASHING_KEY", hide_env_values = true)]
        hashing_key: String,

        secret: String,
    },
}

fn load_snapshot(path: &Path) -> eyre::Result<TopologySnapshot> {
    let raw = std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
}

async fn serve(args: ServeArgs) -> eyre::Result<()> {
    let snapshot = load_snapshot(&args.topology)?;
    let store = Arc::new(MemoryStore::from_snapshot(snapshot));
    let topology: Arc<dyn TopologyStore> = store.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let memo = Arc::new(EdgeDurationMemo::new());
    let presence = Arc::new(PresenceTracker::new(memo.clone()));
    let predictor = Arc::new(EtaPredictor::new(
        topology.clone(),
        presence.clone(),
        memo.clone(),
        clock.clone(),
    ));
    let etas = Arc::new(VehicleEtaCache::new(clock.clone()));
    let activity = Arc::new(ActivityCache::new(args.activity_config(), clock.clone()));
    let ingestor = Arc::new(SignalIngestor::new(
        topology.clone(),
        presence.clone(),
        activity.clone(),
        clock.clone(),
    ));
    let forecaster = Arc::new(Forecaster::new(
        topology.clone(),
        predictor,
        etas.clone(),
        activity.clone(),
        clock.clone(),
        args.forecast_config(),
    ));
    let timing = (args.timing_interval > 0).then(|| {
        let estimator = SegmentTimingEstimator::new(topology.clone(), clock.clone(), args.timing_config());
        (Arc::new(estimator), presence.clone())
    });

    let handle = Gateway::start(
        args.gateway_config(),
        GatewayServices {
            etas,
            projector: Arc::new(PositionProjector::new(topology, memo)),
            credentials: store,
            clock,
            forecaster: Some(forecaster),
            timing,
            signals: Some(SignalServices { ingestor, activity }),
        },
    )
    .await
    .wrap_err("starting gateway")?;

    info!(addr = %handle.local_addr(), http = ?handle.http_addr(), "listening");
    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for shutdown signal")?;
    info!("shutting down");
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::HashSecret {
            hashing_key,
            secret,
        } => {
            println!("{}", hash_secret(hashing_key.as_bytes(), secret.as_bytes())?);
            Ok(())
        }
    }
}
