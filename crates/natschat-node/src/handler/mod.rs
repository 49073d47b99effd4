pub mod chat;

use crate::sessions::{Delivery, SessionTable};
use futures_util::future::join_all;
use k256::PublicKey;
use natschat::protocol::{CloseReason, ErrorCode, Event, Request, Response, StatusInfo};
use natschat_mesh::broker::{Broker, BrokerError};
use natschat_mesh::envelope::{self, CodecError, Payload, topic_for};
use natschat_mesh::identity::{Identity, public_key_from_address};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on each goodbye publish during shutdown.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared daemon state accessible by all client connections.
pub struct DaemonState {
    pub identity: Identity,
    pub broker: Arc<dyn Broker>,
    pub sessions: SessionTable,
    pub socket_path: PathBuf,
    /// Cancelled when the daemon leaves `Online`. Every attachment token is a child.
    pub shutdown: CancellationToken,
    /// Cancelled once the offline teardown has finished.
    offline: CancellationToken,
    close_reason: OnceLock<CloseReason>,
}

impl DaemonState {
    pub fn new(
        identity: Identity,
        broker: Arc<dyn Broker>,
        socket_path: PathBuf,
        backlog_limit: usize,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            identity,
            broker,
            sessions: SessionTable::new(backlog_limit, shutdown.clone()),
            socket_path,
            shutdown,
            offline: CancellationToken::new(),
            close_reason: OnceLock::new(),
        })
    }

    /// Why the daemon is shutting down, once it is.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Leave `Online`: force-close attached streams, say goodbye to peers,
    /// drop the broker connection and remove the socket. Runs once; later
    /// calls wait for the first one to finish.
    pub async fn go_offline(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_err() {
            self.offline.cancelled().await;
            return;
        }
        tracing::info!(%reason, "going offline");
        self.shutdown.cancel();

        let peers = self.sessions.drain();
        if reason != CloseReason::BrokerLost {
            let presence = Payload::Presence {
                online: false,
                reply_requested: false,
            };
            let farewells = peers.iter().map(|(peer, key)| {
                let presence = &presence;
                async move {
                    match tokio::time::timeout(FAREWELL_TIMEOUT, self.publish(key, presence)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!(peer = %peer, err = %e, "offline notice not sent"),
                        Err(_) => tracing::debug!(peer = %peer, "offline notice timed out"),
                    }
                }
            });
            join_all(farewells).await;
        }

        self.broker.close().await;
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.socket_path.display(), err = %e, "failed to remove socket");
        }
        self.offline.cancel();
    }

    /// Encode `payload` for `peer_key` and publish it on the peer's topic.
    pub async fn publish(&self, peer_key: &PublicKey, payload: &Payload) -> Result<(), OutboundError> {
        let bytes = envelope::encode(payload, &self.identity, peer_key)?;
        let topic = topic_for(&natschat_mesh::identity::address_of(peer_key));
        self.broker.publish(&topic, bytes).await?;
        Ok(())
    }
}

/// Failure to get a payload onto the broker.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl OutboundError {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            OutboundError::Codec(CodecError::MultiLine) => ErrorCode::InvalidRequest,
            OutboundError::Codec(_) => ErrorCode::Internal,
            OutboundError::Broker(BrokerError::Closed) => ErrorCode::NotOnline,
            OutboundError::Broker(_) => ErrorCode::IoFailure,
        }
    }
}

/// Dispatch a single request/response command.
///
/// `OpenChat` never reaches this point: the socket layer hands that
/// connection to [`chat::run_chat`].
pub async fn handle_request(state: &DaemonState, req: Request) -> Response {
    match req {
        Request::Address => ok_response(Some(serde_json::json!({
            "address": state.identity.address,
        }))),
        Request::Status => handle_status(state),
        Request::CreateChat { recepient } => handle_create_chat(state, &recepient).await,
        Request::RemoveChat { recepient } => handle_remove_chat(state, &recepient).await,
        Request::OpenChat { .. } => error_response(
            ErrorCode::InvalidRequest,
            "open_chat must be the first request on a connection",
        ),
        Request::Send { .. } => error_response(
            ErrorCode::InvalidRequest,
            "send is only valid on an open chat stream",
        ),
        Request::Offline => {
            state.go_offline(CloseReason::Offline).await;
            ok_response(None)
        }
    }
}

fn handle_status(state: &DaemonState) -> Response {
    let status = StatusInfo {
        address: state.identity.address.clone(),
        nats_url: state.broker.url().to_string(),
        connected: state.broker.is_connected(),
        sessions: state.sessions.list(),
    };
    match serde_json::to_value(status) {
        Ok(v) => ok_response(Some(v)),
        Err(e) => error_response(ErrorCode::Internal, &e.to_string()),
    }
}

async fn handle_create_chat(state: &DaemonState, recepient: &str) -> Response {
    let peer_key = match public_key_from_address(recepient) {
        Ok(k) => k,
        Err(e) => return error_response(ErrorCode::InvalidRequest, &e.to_string()),
    };
    if let Err(e) = state.sessions.create(recepient, peer_key.clone()) {
        return error_response(e.to_error_code(), &e.to_string());
    }

    let hello = Payload::Presence {
        online: true,
        reply_requested: true,
    };
    if let Err(e) = state.publish(&peer_key, &hello).await {
        tracing::warn!(peer = recepient, err = %e, "presence announcement failed");
    }
    ok_response(Some(serde_json::json!({ "peer": recepient })))
}

async fn handle_remove_chat(state: &DaemonState, recepient: &str) -> Response {
    let peer_key = match state.sessions.remove(recepient) {
        Ok(k) => k,
        Err(e) => return error_response(e.to_error_code(), &e.to_string()),
    };

    let goodbye = Payload::Presence {
        online: false,
        reply_requested: false,
    };
    if let Err(e) = state.publish(&peer_key, &goodbye).await {
        tracing::debug!(peer = recepient, err = %e, "offline notice not sent");
    }
    ok_response(None)
}

/// Route one payload from the daemon's subscription. Anything that does not
/// decode, or comes from a peer without a session, is logged and dropped.
pub async fn process_inbound(state: &DaemonState, bytes: &[u8]) {
    let inbound = match envelope::decode(bytes, &state.identity) {
        Ok(i) => i,
        Err(e) => {
            tracing::debug!(err = %e, len = bytes.len(), "dropping inbound envelope");
            return;
        }
    };

    match inbound.payload {
        Payload::Chat { text, sent_at_ms } => {
            let event = Event::Message {
                from: inbound.from.clone(),
                text,
                sent_at_ms,
            };
            if state.sessions.deliver(&inbound.from, event) == Delivery::UnknownPeer {
                tracing::debug!(from = %inbound.from, "message from peer without a chat, dropped");
            }
        }
        Payload::Presence {
            online,
            reply_requested,
        } => {
            let known = state.sessions.set_presence(&inbound.from, online);
            tracing::debug!(from = %inbound.from, online, known, "presence");
            if known && online && reply_requested {
                let reply = Payload::Presence {
                    online: true,
                    reply_requested: false,
                };
                if let Err(e) = state.publish(&inbound.sender_key, &reply).await {
                    tracing::debug!(peer = %inbound.from, err = %e, "presence reply failed");
                }
            }
        }
    }
}

pub fn ok_response(data: Option<serde_json::Value>) -> Response {
    Response::Ok { data }
}

pub fn error_response(code: ErrorCode, message: &str) -> Response {
    Response::Error {
        code,
        message: message.to_string(),
    }
}
