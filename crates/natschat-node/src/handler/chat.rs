use super::{DaemonState, error_response, ok_response};
use crate::sessions::AttachHandle;
use crate::socket::{LineReader, LineWriter, write_response};
use anyhow::Result;
use futures_util::StreamExt;
use natschat::protocol::{ChatOpened, CloseReason, ErrorCode, Event, Request, Response};
use natschat_mesh::envelope::Payload;
use std::collections::VecDeque;
use std::time::Duration;

/// Bound on writing the close notice to a client that may not be reading.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve an `open_chat` connection until the client closes its input or the
/// session is cancelled. The session is detached on every exit path.
pub async fn run_chat(
    state: &DaemonState,
    recepient: Option<String>,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> Result<()> {
    let peer = match recepient.or_else(|| state.sessions.sole_peer()) {
        Some(p) => p,
        None => {
            let resp = error_response(
                ErrorCode::InvalidRequest,
                &format!(
                    "no recepient given and {} chats exist; pass --recepient",
                    state.sessions.len()
                ),
            );
            return write_response(writer, &resp).await;
        }
    };

    let mut handle = match state.sessions.attach(&peer) {
        Ok(h) => h,
        Err(e) => {
            let resp = error_response(e.to_error_code(), &e.to_string());
            return write_response(writer, &resp).await;
        }
    };

    let mut pending: VecDeque<Event> = std::mem::take(&mut handle.backlog).into();
    let opened = ChatOpened {
        peer: peer.clone(),
        backlog: pending.len(),
    };
    let result = match write_response(writer, &ok_response(serde_json::to_value(opened).ok())).await
    {
        Ok(()) => chat_loop(state, &mut handle, &mut pending, reader, writer).await,
        Err(e) => Err(e),
    };

    handle.rx.close();
    while let Ok(event) = handle.rx.try_recv() {
        pending.push_back(event);
    }
    state
        .sessions
        .detach(&handle.peer, handle.id, pending.into_iter().collect());

    result
}

async fn chat_loop(
    state: &DaemonState,
    handle: &mut AttachHandle,
    pending: &mut VecDeque<Event>,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> Result<()> {
    loop {
        if pending.is_empty() {
            refill(state, handle, pending);
        }
        while let Some(event) = pending.front() {
            let resp = Response::Event {
                event: event.clone(),
            };
            if !write_unless_cancelled(handle, writer, &resp).await? {
                return Ok(());
            }
            pending.pop_front();
        }

        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                send_closed(state, handle, writer).await;
                return Ok(());
            }
            event = handle.rx.recv() => match event {
                Some(event) => pending.push_back(event),
                None => return Ok(()),
            },
            line = reader.next() => {
                let Some(line) = line else {
                    tracing::debug!(peer = %handle.peer, "chat client closed input");
                    return Ok(());
                };
                let resp = match serde_json::from_str::<Request>(&line?) {
                    Ok(Request::Send { text }) => send_line(state, handle, text).await,
                    Ok(other) => error_response(
                        ErrorCode::InvalidRequest,
                        &format!("only send is accepted on a chat stream, got {other:?}"),
                    ),
                    Err(e) => error_response(ErrorCode::InvalidRequest, &format!("invalid request: {e}")),
                };
                if !write_unless_cancelled(handle, writer, &resp).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// Pull everything queued for this stream: the sink first, then whatever
/// overflowed into the session backlog behind it.
fn refill(state: &DaemonState, handle: &mut AttachHandle, pending: &mut VecDeque<Event>) {
    while let Ok(event) = handle.rx.try_recv() {
        pending.push_back(event);
    }
    if pending.is_empty() {
        pending.extend(state.sessions.take_backlog(&handle.peer, handle.id));
    }
}

/// Write `resp`, giving up if the session is cancelled first. Returns false
/// when cancelled; the half-written frame is abandoned with the connection.
async fn write_unless_cancelled(
    handle: &AttachHandle,
    writer: &mut LineWriter,
    resp: &Response,
) -> Result<bool> {
    tokio::select! {
        biased;
        _ = handle.cancel.cancelled() => {
            tracing::info!(peer = %handle.peer, "dropping stalled chat stream");
            Ok(false)
        }
        written = write_response(writer, resp) => written.map(|()| true),
    }
}

async fn send_closed(state: &DaemonState, handle: &AttachHandle, writer: &mut LineWriter) {
    let reason = state.close_reason().unwrap_or(CloseReason::Removed);
    tracing::info!(peer = %handle.peer, %reason, "closing chat stream");
    let closed = Response::Event {
        event: Event::Closed { reason },
    };
    if tokio::time::timeout(CLOSE_WRITE_TIMEOUT, write_response(writer, &closed))
        .await
        .is_err()
    {
        tracing::debug!(peer = %handle.peer, "close notice not written");
    }
}

async fn send_line(state: &DaemonState, handle: &AttachHandle, text: String) -> Response {
    match state.publish(&handle.peer_key, &Payload::chat(text)).await {
        Ok(()) => ok_response(None),
        Err(e) => {
            tracing::warn!(peer = %handle.peer, err = %e, "chat send failed");
            error_response(e.to_error_code(), &e.to_string())
        }
    }
}
