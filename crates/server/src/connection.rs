use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::auth::Authenticator;
use crate::broker::Broker;
use crate::mqtt::codec::{self, Packet, ProtocolError};
use crate::session::{CloseReason, Outcome, Session, SessionState};

/// Shared by every connection the gateway accepts
pub(crate) struct ConnectionContext {
    pub authenticator: Arc<Authenticator>,
    pub broker: Arc<Broker>,
    pub outbound_queue: usize,
    pub max_packet_size: usize,
    pub connect_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("writer task is gone")]
    WriterGone,
}

pub(crate) async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client = context.broker.next_client_id();
    let span = info_span!("connection", %peer, client);
    run(stream, client, context, shutdown).instrument(span).await
}

async fn run<S>(
    stream: S,
    client: u64,
    context: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound, mut queue) = mpsc::channel::<Bytes>(context.outbound_queue);

    let writer_task = tokio::spawn(
        async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(error = %err, "write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        .in_current_span(),
    );

    let mut session = Session::new(
        client,
        context.authenticator.clone(),
        context.broker.clone(),
        outbound.clone(),
    );
    let mut buf = BytesMut::with_capacity(4 * 1024);

    let reason = loop {
        match drain(&mut buf, &mut session, &outbound, context.max_packet_size).await {
            Ok(Some(reason)) => break reason,
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "dropping connection");
                break CloseReason::ProtocolViolation;
            }
        }

        let deadline = match session.state() {
            SessionState::Unauthenticated => Some(context.connect_timeout),
            // clients may be up to half a keep-alive period late
            _ => session.keep_alive().map(|keep_alive| keep_alive * 3 / 2),
        };

        tokio::select! {
            _ = shutdown.changed() => break CloseReason::ServerShutdown,
            read = read_some(&mut reader, &mut buf, deadline) => match read {
                Some(Ok(0)) => break CloseReason::PeerClosed,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "read failed");
                    break CloseReason::PeerClosed;
                }
                None => break CloseReason::Timeout,
            },
        }
    };

    session.close();
    drop(session);
    drop(outbound);
    let _ = writer_task.await;
    info!(%reason, "connection closed");
}

/// `None` when the deadline passed first
async fn read_some<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    deadline: Option<Duration>,
) -> Option<std::io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, reader.read_buf(buf)).await.ok(),
        None => Some(reader.read_buf(buf).await),
    }
}

/// Handle every complete packet in `buf`. Returns the reason once the
/// session has to close.
async fn drain(
    buf: &mut BytesMut,
    session: &mut Session,
    outbound: &mpsc::Sender<Bytes>,
    max_packet_size: usize,
) -> Result<Option<CloseReason>, ConnectionError> {
    while let Some(packet) = codec::decode(buf, max_packet_size)? {
        match session.handle(packet) {
            Outcome::Continue(replies) => {
                for reply in replies {
                    send(outbound, &reply).await?;
                }
            }
            Outcome::Close { reply, reason } => {
                if let Some(reply) = reply {
                    send(outbound, &reply).await?;
                }
                return Ok(Some(reason));
            }
        }
    }
    Ok(None)
}

async fn send(outbound: &mpsc::Sender<Bytes>, packet: &Packet) -> Result<(), ConnectionError> {
    outbound
        .send(codec::to_bytes(packet))
        .await
        .map_err(|_| ConnectionError::WriterGone)
}
