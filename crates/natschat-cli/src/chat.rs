use crate::term::{format_message, stdin_lines};
use anyhow::{Result, anyhow};
use natschat::client::DaemonClient;
use natschat::protocol::{ChatOpened, Event, Request, Response};
use std::path::Path;

/// `openchat`: attach to a session and relay stdin and inbound messages
/// until stdin closes or the daemon ends the stream.
pub async fn open_chat(socket_path: &Path, recepient: Option<String>) -> Result<()> {
    let mut client = DaemonClient::connect(socket_path).await?;
    let data = client
        .request(Request::OpenChat { recepient })
        .await?
        .ok_or_else(|| anyhow!("daemon did not acknowledge the chat"))?;
    let opened: ChatOpened = serde_json::from_value(data)?;
    eprintln!(
        "Chatting with {} ({} waiting). Ctrl-D to leave.",
        opened.peer, opened.backlog
    );

    let (mut writer, mut reader) = client.into_split();
    let mut lines = stdin_lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if input_open => match line {
                Some(text) => writer.send(Request::Send { text }).await?,
                None => {
                    input_open = false;
                    // the daemon detaches and hangs up once it sees EOF
                    writer.close().await?;
                }
            },
            resp = reader.next() => {
                let Some(resp) = resp else {
                    return Ok(());
                };
                match resp? {
                    Response::Event { event } => show_event(&event),
                    Response::Error { code, message } => eprintln!("error ({code}): {message}"),
                    Response::Ok { .. } | Response::Hello { .. } => {}
                }
            }
        }
    }
}

fn show_event(event: &Event) {
    match event {
        Event::Message {
            text, sent_at_ms, ..
        } => println!("{}", format_message(*sent_at_ms, text)),
        Event::Presence { peer, online } => {
            let state = if *online { "online" } else { "offline" };
            eprintln!("* {peer} is {state}");
        }
        Event::Closed { reason } => eprintln!("* chat closed: {reason}"),
    }
}
