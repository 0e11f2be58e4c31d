//! Listener lifecycle and background tasks.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use linewatch_core::cache::{ActivityCache, VehicleEtaCache};
use linewatch_core::clock::Clock;
use linewatch_core::eta::PositionProjector;
use linewatch_core::forecast::Forecaster;
use linewatch_core::ingest::SignalIngestor;
use linewatch_core::presence::PresenceTracker;
use linewatch_core::timing::SegmentTimingEstimator;
use linewatch_transit::CredentialStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_native_tls::{TlsAcceptor, native_tls};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::broker::Broker;
use crate::config::{GatewayConfig, TlsConfig};
use crate::connection::{self, ConnectionContext};
use crate::dissemination::Disseminator;
use crate::http::{self, SignalApi};
use crate::periodic::PeriodicTask;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    ReadKeyMaterial {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TLS identity: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Everything the gateway reads from or drives
pub struct GatewayServices {
    pub etas: Arc<VehicleEtaCache>,
    pub projector: Arc<PositionProjector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub clock: Arc<dyn Clock>,
    /// Refills the ETA cache; absent when something else does
    pub forecaster: Option<Arc<Forecaster>>,
    /// Relearns edge durations; the presence tracker's memo is cleared after each batch
    pub timing: Option<(Arc<SegmentTimingEstimator>, Arc<PresenceTracker>)>,
    /// Served over HTTP when `http_listen` is configured
    pub signals: Option<SignalServices>,
}

/// Live signal intake and the activity counts it feeds
pub struct SignalServices {
    pub ingestor: Arc<SignalIngestor>,
    pub activity: Arc<ActivityCache>,
}

pub struct Gateway;

impl Gateway {
    /// Bind the listener and start accepting connections and publishing
    pub async fn start(
        config: GatewayConfig,
        mut services: GatewayServices,
    ) -> Result<GatewayHandle, GatewayError> {
        let tls = match &config.tls {
            Some(tls) => Some(load_tls(tls)?),
            None => None,
        };

        let (listener, local_addr) = bind(config.listen).await?;
        let http_listener = match (config.http_listen, services.signals.take()) {
            (Some(addr), Some(signals)) => Some((bind(addr).await?, signals)),
            _ => None,
        };

        let authenticator = Arc::new(Authenticator::new(
            services.credentials.clone(),
            config.hashing_key.as_bytes(),
        ));
        let broker = Arc::new(Broker::new());
        let context = Arc::new(ConnectionContext {
            authenticator: authenticator.clone(),
            broker: broker.clone(),
            outbound_queue: config.outbound_queue,
            max_packet_size: config.max_packet_size,
            connect_timeout: config.connect_timeout,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, tls, context, shutdown_rx.clone()));

        let (http_addr, http_task) = match http_listener {
            Some(((listener, addr), signals)) => {
                let api = SignalApi {
                    ingestor: signals.ingestor,
                    activity: signals.activity,
                    authenticator,
                };
                info!(%addr, "signal endpoint started");
                (Some(addr), Some(tokio::spawn(serve_http(listener, api, shutdown_rx))))
            }
            None => (None, None),
        };

        let tasks = spawn_tasks(&config, services, broker.clone());

        info!(
            %local_addr,
            tls = config.tls.is_some(),
            interval = ?config.publish_interval,
            "gateway started"
        );

        Ok(GatewayHandle {
            local_addr,
            http_addr,
            broker,
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            http_task,
            tasks,
            grace: config.shutdown_grace,
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), GatewayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    let local = listener
        .local_addr()
        .map_err(|source| GatewayError::Bind { addr, source })?;
    Ok((listener, local))
}

async fn serve_http(listener: TcpListener, api: SignalApi, mut shutdown: watch::Receiver<bool>) {
    let router = http::create_router(Arc::new(api));
    let stopped = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(stopped)
        .await
    {
        error!(error = %err, "signal endpoint failed");
    }
}

fn spawn_tasks(
    config: &GatewayConfig,
    services: GatewayServices,
    broker: Arc<Broker>,
) -> Vec<PeriodicTask> {
    let mut tasks = Vec::new();

    let disseminator = Arc::new(Disseminator::new(
        services.etas.clone(),
        services.projector.clone(),
        broker,
        services.clock.clone(),
        config.topics.clone(),
    ));
    tasks.push(PeriodicTask::spawn(
        "dissemination",
        config.publish_interval,
        move || {
            let disseminator = disseminator.clone();
            async move {
                if let Err(err) = tokio::task::spawn_blocking(move || disseminator.publish_once()).await {
                    error!(error = %err, "dissemination tick panicked");
                }
            }
        },
    ));

    if let Some(forecaster) = services.forecaster {
        tasks.push(PeriodicTask::spawn(
            "forecast",
            config.forecast_interval,
            move || {
                let forecaster = forecaster.clone();
                async move {
                    match tokio::task::spawn_blocking(move || forecaster.run_pass()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(error = %err, "forecast pass failed"),
                        Err(err) => error!(error = %err, "forecast pass panicked"),
                    }
                }
            },
        ));
    }

    if let Some((estimator, presence)) = services.timing {
        tasks.push(PeriodicTask::spawn(
            "timing",
            config.timing_interval,
            move || {
                let estimator = estimator.clone();
                let presence = presence.clone();
                async move {
                    match tokio::task::spawn_blocking(move || estimator.run()).await {
                        Ok(Ok(report)) => {
                            debug!(?report, "timing batch committed");
                            presence.clear_memo();
                        }
                        Ok(Err(err)) => warn!(error = %err, "timing batch aborted"),
                        Err(err) => error!(error = %err, "timing batch panicked"),
                    }
                }
            },
        ));
    }

    tasks
}

fn read_file(path: &Path) -> Result<Vec<u8>, GatewayError> {
    std::fs::read(path).map_err(|source| GatewayError::ReadKeyMaterial {
        path: path.to_owned(),
        source,
    })
}

fn load_tls(tls: &TlsConfig) -> Result<TlsAcceptor, GatewayError> {
    let certificate = read_file(&tls.certificate)?;
    let key = read_file(&tls.private_key)?;
    let identity = native_tls::Identity::from_pkcs8(&certificate, &key)?;
    Ok(TlsAcceptor::from(native_tls::TlsAcceptor::new(identity)?))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    spawn_connection(&mut connections, stream, peer, tls.clone(), context.clone(), shutdown.clone());
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(open = connections.len(), "listener closed, draining connections");
    while connections.join_next().await.is_some() {}
}

fn spawn_connection(
    connections: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    context: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => {
            connections.spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(stream) => connection::serve(stream, peer, context, shutdown).await,
                    Err(err) => debug!(%peer, error = %err, "TLS handshake failed"),
                }
            });
        }
        None => {
            connections.spawn(connection::serve(stream, peer, context, shutdown));
        }
    }
}

/// Running gateway. Dropping it signals shutdown without waiting.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    broker: Arc<Broker>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    http_task: Option<JoinHandle<()>>,
    tasks: Vec<PeriodicTask>,
    grace: Duration,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the signal endpoint, when it runs
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Stop the background tasks, close the listener and every connection,
    /// aborting whatever is still running once the grace period is over
    pub async fn stop(mut self) {
        let deadline = tokio::time::Instant::now() + self.grace;

        for task in std::mem::take(&mut self.tasks) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            task.stop(remaining).await;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(mut accept_task) = self.accept_task.take() {
            if tokio::time::timeout_at(deadline, &mut accept_task).await.is_err() {
                warn!("connections still open after grace period, aborting");
                accept_task.abort();
            }
        }
        if let Some(mut http_task) = self.http_task.take() {
            if tokio::time::timeout_at(deadline, &mut http_task).await.is_err() {
                warn!("signal requests still running after grace period, aborting");
                http_task.abort();
            }
        }
        info!("gateway stopped");
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}
