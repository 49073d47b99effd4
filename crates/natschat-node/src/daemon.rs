use crate::config::DaemonConfig;
use crate::handler::{self, DaemonState};
use crate::socket;
use natschat::protocol::{CloseReason, ErrorCode};
use natschat_mesh::broker::{Broker, BrokerError, Subscription};
use natschat_mesh::envelope::topic_for;
use natschat_mesh::identity::Identity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};

/// How long open connections get to flush after going offline.
const CONNECTION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum OnlineError {
    #[error("a daemon is already online at {}", .0.display())]
    AlreadyOnline(PathBuf),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("control socket: {0:#}")]
    Socket(anyhow::Error),
}

impl OnlineError {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            OnlineError::AlreadyOnline(_) => ErrorCode::AlreadyOnline,
            OnlineError::Broker(_) => ErrorCode::ConnectFailed,
            OnlineError::Socket(_) => ErrorCode::IoFailure,
        }
    }
}

/// Fail if a live daemon answers on `socket_path`; clear a stale socket file.
pub async fn ensure_offline(socket_path: &Path) -> Result<(), OnlineError> {
    if std::fs::symlink_metadata(socket_path).is_err() {
        return Ok(());
    }
    if UnixStream::connect(socket_path).await.is_ok() {
        return Err(OnlineError::AlreadyOnline(socket_path.to_path_buf()));
    }
    tracing::warn!(path = %socket_path.display(), "removing stale socket");
    match std::fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OnlineError::Socket(anyhow::Error::new(e).context(format!(
            "failed to remove stale socket {}",
            socket_path.display()
        )))),
    }
}

/// Bind the control socket. Losing a race with another daemon that bound
/// the path after [`ensure_offline`] is reported as `AlreadyOnline`.
fn bind_socket(socket_path: &Path) -> Result<UnixListener, OnlineError> {
    socket::bind(socket_path).map_err(|e| {
        let in_use = e
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::AddrInUse);
        if in_use {
            OnlineError::AlreadyOnline(socket_path.to_path_buf())
        } else {
            OnlineError::Socket(e)
        }
    })
}

/// A daemon that has subscribed to its topic and bound its socket, but is
/// not yet serving.
pub struct Daemon {
    state: Arc<DaemonState>,
    listener: UnixListener,
    subscription: Subscription,
}

impl Daemon {
    /// Bring the daemon to `Online` over an already connected broker. The
    /// socket is bound last, so a client that can connect can rely on the
    /// broker being there.
    pub async fn start(
        config: &DaemonConfig,
        identity: Identity,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, OnlineError> {
        ensure_offline(&config.socket_path).await?;

        let subscription = broker.subscribe(&topic_for(&identity.address)).await?;
        let listener = bind_socket(&config.socket_path)?;

        tracing::info!(
            address = %identity.address,
            nats_url = broker.url(),
            "daemon online"
        );
        let state = DaemonState::new(
            identity,
            broker,
            config.socket_path.clone(),
            config.backlog_limit,
        );
        Ok(Self {
            state,
            listener,
            subscription,
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Serve until `offline`, a shutdown signal or broker loss.
    pub async fn run(self) {
        let Daemon {
            state,
            listener,
            subscription,
        } = self;

        let inbound = tokio::spawn(inbound_loop(state.clone(), subscription));
        let connections = socket::serve(state.clone(), listener).await;

        // waits for a teardown already in progress
        state.go_offline(CloseReason::Offline).await;
        socket::drain(connections, CONNECTION_GRACE).await;
        inbound.await.ok();
        tracing::info!("daemon offline");
    }
}

async fn inbound_loop(state: Arc<DaemonState>, mut subscription: Subscription) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            payload = subscription.next() => match payload {
                Some(bytes) => handler::process_inbound(&state, &bytes).await,
                None => {
                    tracing::error!("broker subscription ended, taking daemon offline");
                    state.go_offline(CloseReason::BrokerLost).await;
                    break;
                }
            },
        }
    }
}
