use super::TIMEOUT;
use anyhow::{Context, Result, anyhow, bail};
use natschat::client::{DaemonClient, DaemonReader, DaemonWriter};
use natschat::protocol::{ChatOpened, CloseReason, Event, Request, Response, StatusInfo};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

/// Convenience wrapper over `DaemonClient` for integration tests.
pub struct TestClient {
    inner: DaemonClient,
}

impl TestClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let inner = DaemonClient::connect(socket_path).await?;
        Ok(Self { inner })
    }

    pub async fn address(&mut self) -> Result<String> {
        let data = self
            .inner
            .request(Request::Address)
            .await?
            .ok_or_else(|| anyhow!("address returned no data"))?;
        data["address"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("address missing from {data}"))
    }

    pub async fn status(&mut self) -> Result<StatusInfo> {
        let data = self
            .inner
            .request(Request::Status)
            .await?
            .ok_or_else(|| anyhow!("status returned no data"))?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn create_chat(&mut self, peer: &str) -> Result<()> {
        self.inner
            .request(Request::CreateChat {
                recepient: peer.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn remove_chat(&mut self, peer: &str) -> Result<()> {
        self.inner
            .request(Request::RemoveChat {
                recepient: peer.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn offline(&mut self) -> Result<()> {
        self.inner.request(Request::Offline).await?;
        Ok(())
    }

    /// Turn this connection into a chat stream.
    pub async fn open_chat(mut self, peer: Option<&str>) -> Result<ChatStream> {
        let data = self
            .inner
            .request(Request::OpenChat {
                recepient: peer.map(str::to_string),
            })
            .await?
            .ok_or_else(|| anyhow!("open_chat returned no data"))?;
        let opened: ChatOpened = serde_json::from_value(data)?;
        let (writer, reader) = self.inner.into_split();
        Ok(ChatStream {
            peer: opened.peer,
            backlog: opened.backlog,
            writer,
            reader,
            events: VecDeque::new(),
            closed: None,
        })
    }
}

/// An attached `openchat` connection.
pub struct ChatStream {
    pub peer: String,
    /// Buffered messages the daemon announced when attaching.
    pub backlog: usize,
    writer: DaemonWriter,
    reader: DaemonReader,
    /// Events read while waiting for a send acknowledgement.
    events: VecDeque<Event>,
    closed: Option<CloseReason>,
}

impl ChatStream {
    /// Send one line and wait for the daemon to confirm it was published.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.writer
            .send(Request::Send {
                text: text.to_string(),
            })
            .await?;
        let ack = async {
            loop {
                match self.read().await? {
                    Some(Response::Ok { .. }) => return Ok(()),
                    Some(Response::Error { code, message }) => {
                        bail!("send failed ({code}): {message}")
                    }
                    Some(Response::Event { event }) => self.events.push_back(event),
                    Some(Response::Hello { .. }) => {}
                    None => bail!("chat stream closed before send was acknowledged"),
                }
            }
        };
        tokio::time::timeout(TIMEOUT, ack)
            .await
            .context("send was not acknowledged")?
    }

    /// The next pushed event, or `None` once the daemon hung up.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        let next = async {
            loop {
                match self.read().await? {
                    Some(Response::Event { event }) => return Ok(Some(event)),
                    Some(Response::Error { code, message }) => bail!("error ({code}): {message}"),
                    Some(_) => continue,
                    None => return Ok(None),
                }
            }
        };
        tokio::time::timeout(timeout, next)
            .await
            .context("no event in time")?
    }

    /// Skip presence updates until a chat message arrives; returns its text.
    pub async fn next_message(&mut self) -> Result<String> {
        loop {
            match self.next_event(TIMEOUT).await? {
                Some(Event::Message { text, .. }) => return Ok(text),
                Some(Event::Closed { reason }) => bail!("chat closed: {reason}"),
                Some(Event::Presence { .. }) => continue,
                None => bail!("chat stream ended"),
            }
        }
    }

    /// Close our input, as a client does on stdin EOF.
    pub async fn close_input(&mut self) -> Result<()> {
        self.writer.close().await
    }

    /// Read until the daemon hangs up. Returns the close reason it sent, if any.
    pub async fn wait_closed(&mut self, timeout: Duration) -> Result<Option<CloseReason>> {
        loop {
            match self.next_event(timeout).await? {
                Some(_) => continue,
                None => return Ok(self.closed),
            }
        }
    }

    /// Read until the daemon hangs up, skipping anything that does not
    /// parse. A stream dropped mid-write may end in a partial line.
    pub async fn wait_hangup(&mut self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            while self.reader.next().await.is_some() {}
        })
        .await
        .context("daemon kept the chat stream open")
    }

    async fn read(&mut self) -> Result<Option<Response>> {
        let Some(resp) = self.reader.next().await else {
            return Ok(None);
        };
        let resp = resp?;
        if let Response::Event {
            event: Event::Closed { reason },
        } = &resp
        {
            self.closed = Some(*reason);
        }
        Ok(Some(resp))
    }
}
