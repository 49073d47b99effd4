use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a JSON-lines frame on the Unix socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Failure classes reported over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A key pair or chat session is already present.
    AlreadyExists,
    /// No chat session for that peer.
    NotFound,
    /// Another client is already attached to the session.
    AlreadyAttached,
    /// A daemon is already serving this profile.
    AlreadyOnline,
    /// No daemon is serving this profile.
    NotOnline,
    /// The broker could not be reached.
    ConnectFailed,
    InvalidRequest,
    IoFailure,
    Internal,
}

impl ErrorCode {
    /// Process exit status a CLI invocation reports for this failure.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorCode::Internal => 1,
            ErrorCode::InvalidRequest => 2,
            ErrorCode::AlreadyExists => 3,
            ErrorCode::NotFound => 4,
            ErrorCode::AlreadyAttached => 5,
            ErrorCode::AlreadyOnline => 6,
            ErrorCode::NotOnline => 7,
            ErrorCode::ConnectFailed => 8,
            ErrorCode::IoFailure => 9,
        }
    }

    /// Inverse of [`ErrorCode::exit_code`].
    pub fn from_exit_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::Internal,
            2 => ErrorCode::InvalidRequest,
            3 => ErrorCode::AlreadyExists,
            4 => ErrorCode::NotFound,
            5 => ErrorCode::AlreadyAttached,
            6 => ErrorCode::AlreadyOnline,
            7 => ErrorCode::NotOnline,
            8 => ErrorCode::ConnectFailed,
            9 => ErrorCode::IoFailure,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyAttached => "already_attached",
            ErrorCode::AlreadyOnline => "already_online",
            ErrorCode::NotOnline => "not_online",
            ErrorCode::ConnectFailed => "connect_failed",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::IoFailure => "io_failure",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Why the daemon ended an open chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The session was removed with `rmchat`.
    Removed,
    /// The daemon went offline.
    Offline,
    /// The broker connection was lost.
    BrokerLost,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Removed => write!(f, "session removed"),
            CloseReason::Offline => write!(f, "daemon went offline"),
            CloseReason::BrokerLost => write!(f, "broker connection lost"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from the CLI to the daemon over the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Get the daemon's own address.
    Address,
    /// Broker connection and session summary.
    Status,
    /// Register a chat session with a peer.
    CreateChat { recepient: String },
    /// Drop a chat session, force-closing any attached stream.
    RemoveChat { recepient: String },
    /// Turn this connection into the interactive stream for a session.
    /// With no recepient the only existing session is used.
    OpenChat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recepient: Option<String>,
    },
    /// Publish one line to the peer. Only valid after `OpenChat`.
    Send { text: String },
    /// Stop the daemon.
    Offline,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A message sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Connection established.
    Hello { address: String, version: String },
    /// Request succeeded with optional data.
    Ok { data: Option<serde_json::Value> },
    /// Request failed.
    Error { code: ErrorCode, message: String },
    /// Pushed on an open chat stream.
    Event { event: Event },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A chat line from the peer.
    Message {
        from: String,
        text: String,
        sent_at_ms: u64,
    },
    /// The peer announced it came online or went offline.
    Presence { peer: String, online: bool },
    /// The daemon is closing this stream.
    Closed { reason: CloseReason },
}

// ---------------------------------------------------------------------------
// Data payloads
// ---------------------------------------------------------------------------

/// One row of `status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub peer: String,
    pub attached: bool,
    /// Messages waiting for the next `openchat`.
    pub backlog: usize,
    /// Last presence announcement seen from the peer, if any.
    pub peer_online: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub address: String,
    pub nats_url: String,
    pub connected: bool,
    pub sessions: Vec<SessionInfo>,
}

/// Data of the `Ok` that accepts an `OpenChat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOpened {
    pub peer: String,
    /// Buffered messages that follow immediately as events.
    pub backlog: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_are_snake_case() {
        let json = serde_json::to_string(&Request::CreateChat {
            recepient: "abc".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"create_chat","recepient":"abc"}"#);
    }

    #[test]
    fn open_chat_recepient_is_optional() {
        let req: Request = serde_json::from_str(r#"{"type":"open_chat"}"#).unwrap();
        assert!(matches!(req, Request::OpenChat { recepient: None }));
        assert_eq!(
            serde_json::to_string(&Request::OpenChat { recepient: None }).unwrap(),
            r#"{"type":"open_chat"}"#
        );
    }

    #[test]
    fn error_response_carries_typed_code() {
        let resp = Response::Error {
            code: ErrorCode::AlreadyAttached,
            message: "busy".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("already_attached"));
        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::AlreadyAttached);
                assert_eq!(message, "busy");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn closed_event_wire_shape() {
        let resp = Response::Event {
            event: Event::Closed {
                reason: CloseReason::Removed,
            },
        };
        let value: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["event"], "closed");
        assert_eq!(value["event"]["reason"], "removed");
    }

    #[test]
    fn unknown_request_type_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"format_disk"}"#).is_err());
    }

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let all = [
            ErrorCode::AlreadyExists,
            ErrorCode::NotFound,
            ErrorCode::AlreadyAttached,
            ErrorCode::AlreadyOnline,
            ErrorCode::NotOnline,
            ErrorCode::ConnectFailed,
            ErrorCode::InvalidRequest,
            ErrorCode::IoFailure,
            ErrorCode::Internal,
        ];
        let mut codes: Vec<u8> = all.iter().map(|c| c.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        for code in all {
            assert_eq!(ErrorCode::from_exit_code(code.exit_code().into()), Some(code));
        }
    }
}
