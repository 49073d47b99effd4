use crate::handler::{DaemonState, chat, error_response, handle_request};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use natschat::protocol::{ErrorCode, MAX_LINE_BYTES, Request, Response};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

pub type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Bind the control socket: `0700` parent directory, `0600` socket file.
/// A leftover file at the path must already have been cleared.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "Unix socket listening");
    Ok(listener)
}

/// Accept client connections until the daemon shuts down. Returns the
/// connections still open at that point.
pub async fn serve(state: Arc<DaemonState>, listener: UnixListener) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_client(state, stream).await {
                        tracing::debug!(err = %e, "client disconnected");
                    }
                });
            }
        }
    }
    tracing::debug!(open = connections.len(), "socket server stopped");
    connections
}

/// Give open connections `grace` to write their last response, then drop them.
pub async fn drain(mut connections: JoinSet<()>, grace: Duration) {
    let finished = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        tracing::debug!(open = connections.len(), "closing idle connections");
        connections.abort_all();
    }
}

async fn handle_client(state: Arc<DaemonState>, stream: tokio::net::UnixStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let hello = Response::Hello {
        address: state.identity.address.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    write_response(&mut writer, &hello).await?;

    while let Some(line) = reader.next().await {
        let line = line?;
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = error_response(ErrorCode::InvalidRequest, &format!("invalid request: {e}"));
                write_response(&mut writer, &resp).await?;
                continue;
            }
        };

        match req {
            Request::OpenChat { recepient } => {
                return chat::run_chat(&state, recepient, &mut reader, &mut writer).await;
            }
            Request::Offline => {
                let resp = handle_request(&state, Request::Offline).await;
                write_response(&mut writer, &resp).await?;
                break;
            }
            req => {
                let resp = handle_request(&state, req).await;
                write_response(&mut writer, &resp).await?;
            }
        }
    }

    Ok(())
}

pub async fn write_response(writer: &mut LineWriter, resp: &Response) -> Result<()> {
    let line = serde_json::to_string(resp)?;
    writer.send(line).await?;
    Ok(())
}
