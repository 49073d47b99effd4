use crate::protocol::{ErrorCode, MAX_LINE_BYTES, Request, Response};
use anyhow::{Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// An `Error` response from the daemon, kept typed so callers can map it to
/// an exit status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DaemonError {
    pub code: ErrorCode,
    pub message: String,
}

/// Client for the chat daemon's Unix socket API.
pub struct DaemonClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    address: String,
}

impl DaemonClient {
    /// Connect to the daemon at the given socket path.
    /// Waits for the Hello response before returning.
    ///
    /// Failing to reach the socket is reported as a [`DaemonError`] with
    /// [`ErrorCode::NotOnline`].
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| DaemonError {
            code: ErrorCode::NotOnline,
            message: format!(
                "no daemon at {} ({e}). Start one with: nats-chat online --nats-url URL",
                socket_path.display()
            ),
        })?;
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            address: String::new(),
        };

        match client.next_response().await? {
            Response::Hello { address, .. } => {
                client.address = address;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// The daemon's address, from the Hello handshake.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request to the daemon.
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read the next response from the daemon.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("daemon disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and wait for the Ok/Error response, skipping events.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } | Response::Event { .. } => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { code, message } => {
                    return Err(DaemonError { code, message }.into());
                }
            }
        }
    }

    /// Split into independent reader and writer halves.
    ///
    /// Use this on an open chat stream, where lines are typed while events
    /// keep arriving.
    pub fn into_split(self) -> (DaemonWriter, DaemonReader) {
        (
            DaemonWriter {
                writer: self.writer,
            },
            DaemonReader {
                reader: self.reader,
            },
        )
    }
}

/// Write half of a split [`DaemonClient`].
pub struct DaemonWriter {
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl DaemonWriter {
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Flush and shut down the write side. The daemon sees end of input and
    /// detaches the chat stream.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<String>::close(&mut self.writer).await?;
        Ok(())
    }
}

/// Read half of a split [`DaemonClient`]. Yields all responses including events.
pub struct DaemonReader {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
}

impl DaemonReader {
    /// Read the next response/event from the daemon.
    /// Returns `None` if the daemon disconnected.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        let line = self.reader.next().await?;
        Some(
            line.map_err(Into::into)
                .and_then(|l| serde_json::from_str(&l).map_err(Into::into)),
        )
    }
}

/// Resolve the control socket for a profile.
///
/// `$NATSCHAT_SOCKET` wins, otherwise `<profile>/socket/natschat.sock`.
pub fn default_socket_path(profile_dir: &Path) -> PathBuf {
    if let Ok(p) = std::env::var(crate::SOCKET_ENV) {
        return PathBuf::from(p);
    }
    profile_dir.join("socket").join("natschat.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn closing_the_writer_ends_daemon_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("natschat.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let hello = serde_json::to_string(&Response::Hello {
                address: "addr".into(),
                version: "test".into(),
            })
            .unwrap();
            w.write_all(format!("{hello}\n").as_bytes()).await.unwrap();

            let mut lines = BufReader::new(r).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
            }
            received
        });

        let client = DaemonClient::connect(&path).await.unwrap();
        assert_eq!(client.address(), "addr");
        let (mut writer, _reader) = client.into_split();
        writer
            .send(Request::Send {
                text: "bye".into(),
            })
            .await
            .unwrap();
        writer.close().await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].contains(r#""type":"send""#));
    }

    #[tokio::test]
    async fn missing_socket_is_not_online() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonClient::connect(&dir.path().join("absent.sock"))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<DaemonError>().map(|e| e.code),
            Some(ErrorCode::NotOnline)
        );
    }
}
