//! Per-connection protocol state machine.
//!
//! `Unauthenticated` accepts only CONNECT. A valid key/secret moves the
//! session to `Authenticated`, and the first accepted subscription moves it
//! to `Subscribed`. Dropping the last subscription moves it back. Every
//! protocol violation, including any PUBLISH from the client, ends in
//! `Closed`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strum::{Display, IntoDiscriminant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::broker::{Broker, ClientId};
use crate::mqtt::codec::{PROTOCOL_LEVEL, PROTOCOL_NAME, SUBSCRIPTION_FAILURE};
use crate::mqtt::{Connect, ConnectReturnCode, Packet, topic};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Subscribed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    PeerClosed,
    ClientPublish,
    BadCredentials,
    UnsupportedProtocol,
    CredentialStoreUnavailable,
    NotConnected,
    DuplicateConnect,
    UnexpectedPacket,
    ProtocolViolation,
    Timeout,
    ServerShutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue(Vec<Packet>),
    Close {
        reply: Option<Packet>,
        reason: CloseReason,
    },
}

impl Outcome {
    fn close(reason: CloseReason) -> Self {
        Outcome::Close {
            reply: None,
            reason,
        }
    }

    fn refuse(code: ConnectReturnCode, reason: CloseReason) -> Self {
        Outcome::Close {
            reply: Some(Packet::ConnAck {
                session_present: false,
                code,
            }),
            reason,
        }
    }
}

pub struct Session {
    client: ClientId,
    state: SessionState,
    keep_alive: Option<Duration>,
    authenticator: Arc<Authenticator>,
    broker: Arc<Broker>,
    outbound: mpsc::Sender<Bytes>,
}

impl Session {
    pub fn new(
        client: ClientId,
        authenticator: Arc<Authenticator>,
        broker: Arc<Broker>,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            client,
            state: SessionState::Unauthenticated,
            keep_alive: None,
            authenticator,
            broker,
            outbound,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Keep-alive negotiated in CONNECT, if any
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub fn handle(&mut self, packet: Packet) -> Outcome {
        let outcome = self.transition(packet);
        if matches!(outcome, Outcome::Close { .. }) {
            self.close();
        }
        outcome
    }

    fn transition(&mut self, packet: Packet) -> Outcome {
        use SessionState::*;

        match (self.state, packet) {
            (Closed, _) => Outcome::close(CloseReason::ProtocolViolation),
            (_, Packet::Publish(publish)) => {
                warn!(client = self.client, topic = %publish.topic, "client attempted to publish");
                Outcome::close(CloseReason::ClientPublish)
            }
            (_, Packet::Disconnect) => Outcome::close(CloseReason::ClientDisconnect),

            (Unauthenticated, Packet::Connect(connect)) => self.connect(connect),
            (Unauthenticated, _) => Outcome::close(CloseReason::NotConnected),
            (_, Packet::Connect(_)) => Outcome::close(CloseReason::DuplicateConnect),

            (_, Packet::PingReq) => Outcome::Continue(vec![Packet::PingResp]),
            (_, Packet::Subscribe(subscribe)) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|(filter, _)| {
                        if topic::valid_filter(filter) {
                            self.broker.subscribe(self.client, filter, &self.outbound);
                            0
                        } else {
                            debug!(client = self.client, %filter, "invalid topic filter");
                            SUBSCRIPTION_FAILURE
                        }
                    })
                    .collect::<Vec<u8>>();
                if codes.iter().any(|code| *code != SUBSCRIPTION_FAILURE) {
                    self.state = Subscribed;
                }
                Outcome::Continue(vec![Packet::SubAck {
                    packet_id: subscribe.packet_id,
                    codes,
                }])
            }
            (_, Packet::Unsubscribe { packet_id, filters }) => {
                let mut remaining = 0;
                for filter in &filters {
                    remaining = self.broker.unsubscribe(self.client, filter);
                }
                if remaining == 0 {
                    self.state = Authenticated;
                }
                Outcome::Continue(vec![Packet::UnsubAck { packet_id }])
            }
            (_, other) => {
                debug!(client = self.client, packet = %other.discriminant(), "unexpected packet");
                Outcome::close(CloseReason::UnexpectedPacket)
            }
        }
    }

    fn connect(&mut self, connect: Connect) -> Outcome {
        if connect.protocol_name != PROTOCOL_NAME {
            return Outcome::close(CloseReason::UnsupportedProtocol);
        }
        if connect.protocol_level != PROTOCOL_LEVEL {
            return Outcome::refuse(
                ConnectReturnCode::UnacceptableProtocolVersion,
                CloseReason::UnsupportedProtocol,
            );
        }

        let (Some(username), Some(password)) = (&connect.username, &connect.password) else {
            return Outcome::refuse(
                ConnectReturnCode::BadUsernameOrPassword,
                CloseReason::BadCredentials,
            );
        };
        match self.authenticator.verify(username, password) {
            Ok(true) => {}
            Ok(false) => {
                info!(client = self.client, %username, "authentication failed");
                return Outcome::refuse(
                    ConnectReturnCode::BadUsernameOrPassword,
                    CloseReason::BadCredentials,
                );
            }
            Err(err) => {
                warn!(client = self.client, error = %err, "cannot verify credentials");
                return Outcome::refuse(
                    ConnectReturnCode::ServerUnavailable,
                    CloseReason::CredentialStoreUnavailable,
                );
            }
        }

        self.state = SessionState::Authenticated;
        self.keep_alive =
            (connect.keep_alive > 0).then(|| Duration::from_secs(u64::from(connect.keep_alive)));
        info!(client = self.client, %username, client_id = %connect.client_id, "authenticated");
        Outcome::Continue(vec![Packet::ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }])
    }

    /// Leave the broker and refuse any further packets
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.broker.remove(self.client);
            self.state = SessionState::Closed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
