//! Per-peer chat sessions.
//!
//! A session is `Created` until a chat stream attaches, `Attached` while one
//! does, and back to `Created` on detach. Removing it is terminal: the entry
//! leaves the table and any attached stream is cancelled. Messages that
//! arrive while nobody is attached wait in a bounded backlog.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use k256::PublicKey;
use natschat::protocol::{ErrorCode, Event, SessionInfo};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Events buffered between the inbound loop and an attached stream.
pub const SINK_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chat with {0} already exists")]
    AlreadyExists(String),

    #[error("no chat with {0}")]
    NotFound(String),

    #[error("chat with {0} is already open in another client")]
    AlreadyAttached(String),
}

impl SessionError {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            SessionError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::AlreadyAttached(_) => ErrorCode::AlreadyAttached,
        }
    }
}

struct Attachment {
    id: Uuid,
    sink: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Attachment {
    fn is_live(&self) -> bool {
        !self.sink.is_closed() && !self.cancel.is_cancelled()
    }
}

struct ChatSession {
    peer_key: PublicKey,
    attachment: Option<Attachment>,
    backlog: VecDeque<Event>,
    peer_online: Option<bool>,
}

impl ChatSession {
    fn push_backlog(&mut self, peer: &str, event: Event, limit: usize) {
        if self.backlog.len() >= limit {
            self.backlog.pop_front();
            tracing::warn!(peer, limit, "chat backlog full, dropped oldest message");
        }
        self.backlog.push_back(event);
    }
}

/// The receiving end of an attachment, owned by the chat stream.
pub struct AttachHandle {
    pub id: Uuid,
    pub peer: String,
    pub peer_key: PublicKey,
    /// Messages that arrived while unattached, oldest first.
    pub backlog: Vec<Event>,
    pub rx: mpsc::Receiver<Event>,
    /// Cancelled when the session is removed or the daemon goes offline.
    pub cancel: CancellationToken,
}

/// What [`SessionTable::deliver`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Buffered,
    UnknownPeer,
}

/// All chat sessions of one daemon, keyed by peer address.
pub struct SessionTable {
    sessions: DashMap<String, ChatSession>,
    backlog_limit: usize,
    /// Parent of every attachment token.
    root: CancellationToken,
}

impl SessionTable {
    pub fn new(backlog_limit: usize, root: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            backlog_limit,
            root,
        }
    }

    pub fn create(&self, peer: &str, peer_key: PublicKey) -> Result<(), SessionError> {
        match self.sessions.entry(peer.to_string()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyExists(peer.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ChatSession {
                    peer_key,
                    attachment: None,
                    backlog: VecDeque::new(),
                    peer_online: None,
                });
                tracing::info!(peer, "chat created");
                Ok(())
            }
        }
    }

    pub fn attach(&self, peer: &str) -> Result<AttachHandle, SessionError> {
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| SessionError::NotFound(peer.to_string()))?;
        if session.attachment.as_ref().is_some_and(Attachment::is_live) {
            return Err(SessionError::AlreadyAttached(peer.to_string()));
        }

        let (sink, rx) = mpsc::channel(SINK_CAPACITY);
        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        session.attachment = Some(Attachment {
            id,
            sink,
            cancel: cancel.clone(),
        });
        let backlog: Vec<Event> = session.backlog.drain(..).collect();
        tracing::info!(peer, attachment = %id, backlog = backlog.len(), "chat attached");

        Ok(AttachHandle {
            id,
            peer: peer.to_string(),
            peer_key: session.peer_key.clone(),
            backlog,
            rx,
            cancel,
        })
    }

    /// Release the attachment `id`. `leftovers` are events the stream took
    /// from its sink but never wrote; they go back to the head of the backlog.
    /// A newer attachment is left in place.
    pub fn detach(&self, peer: &str, id: Uuid, leftovers: Vec<Event>) {
        let Some(mut session) = self.sessions.get_mut(peer) else {
            tracing::debug!(peer, attachment = %id, "detach after session removal");
            return;
        };
        if session.attachment.as_ref().map(|a| a.id) == Some(id) {
            session.attachment = None;
        }
        let requeued = leftovers.len();
        for event in leftovers.into_iter().rev() {
            if matches!(event, Event::Message { .. }) {
                session.backlog.push_front(event);
            }
        }
        while session.backlog.len() > self.backlog_limit {
            session.backlog.pop_front();
        }
        tracing::info!(peer, attachment = %id, requeued, "chat detached");
    }

    /// Drop the session. An attached stream is cancelled.
    pub fn remove(&self, peer: &str) -> Result<PublicKey, SessionError> {
        let (_, session) = self
            .sessions
            .remove(peer)
            .ok_or_else(|| SessionError::NotFound(peer.to_string()))?;
        if let Some(attachment) = session.attachment {
            attachment.cancel.cancel();
        }
        tracing::info!(peer, dropped = session.backlog.len(), "chat removed");
        Ok(session.peer_key)
    }

    /// Remove every session, returning the peers that were registered.
    pub fn drain(&self) -> Vec<(String, PublicKey)> {
        let peers: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        peers
            .into_iter()
            .filter_map(|peer| self.remove(&peer).ok().map(|key| (peer, key)))
            .collect()
    }

    /// Hand a chat event to the attached stream, or buffer it. Never waits:
    /// a stream that is not keeping up gets its overflow in the backlog, and
    /// later events queue behind it until the stream catches up.
    pub fn deliver(&self, peer: &str, event: Event) -> Delivery {
        let Some(mut session) = self.sessions.get_mut(peer) else {
            return Delivery::UnknownPeer;
        };
        let event = match session.attachment.as_ref().filter(|a| a.is_live()) {
            Some(a) if session.backlog.is_empty() => match a.sink.try_send(event) {
                Ok(()) => return Delivery::Delivered,
                Err(TrySendError::Full(event)) => {
                    tracing::warn!(peer, "chat stream is not keeping up, buffering");
                    event
                }
                Err(TrySendError::Closed(event)) => event,
            },
            _ => event,
        };
        session.push_backlog(peer, event, self.backlog_limit);
        Delivery::Buffered
    }

    /// Move the backlog to attachment `id`. Called by the stream once its
    /// sink is empty, which keeps overflow behind everything sent earlier.
    pub fn take_backlog(&self, peer: &str, id: Uuid) -> Vec<Event> {
        match self.sessions.get_mut(peer) {
            Some(mut session) if session.attachment.as_ref().map(|a| a.id) == Some(id) => {
                session.backlog.drain(..).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Record a presence announcement. Returns false for unknown peers.
    pub fn set_presence(&self, peer: &str, online: bool) -> bool {
        let Some(mut session) = self.sessions.get_mut(peer) else {
            return false;
        };
        session.peer_online = Some(online);
        if let Some(attachment) = session.attachment.as_ref().filter(|a| a.is_live()) {
            let event = Event::Presence {
                peer: peer.to_string(),
                online,
            };
            if attachment.sink.try_send(event).is_err() {
                tracing::debug!(peer, "chat stream busy, presence update skipped");
            }
        }
        true
    }

    pub fn peer_key(&self, peer: &str) -> Option<PublicKey> {
        self.sessions.get(peer).map(|s| s.peer_key.clone())
    }

    /// The peer of the only session, if exactly one exists.
    pub fn sole_peer(&self) -> Option<String> {
        if self.sessions.len() != 1 {
            return None;
        }
        self.sessions.iter().next().map(|s| s.key().clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|s| SessionInfo {
                peer: s.key().clone(),
                attached: s.attachment.as_ref().is_some_and(Attachment::is_live),
                backlog: s.backlog.len(),
                peer_online: s.peer_online,
            })
            .collect();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::SecretKey;
    use rand::rngs::OsRng;

    fn key() -> PublicKey {
        SecretKey::random(&mut OsRng).public_key()
    }

    fn msg(text: &str) -> Event {
        Event::Message {
            from: "peer".into(),
            text: text.into(),
            sent_at_ms: 0,
        }
    }

    fn table(limit: usize) -> SessionTable {
        SessionTable::new(limit, CancellationToken::new())
    }

    fn texts(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn create_twice_is_already_exists() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let err = t.create("peer", key()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
        assert_eq!(err.to_error_code(), ErrorCode::AlreadyExists);
    }

    #[test]
    fn attach_unknown_is_not_found() {
        let t = table(8);
        assert!(matches!(t.attach("ghost"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn second_attach_is_rejected_until_detach() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let first = t.attach("peer").unwrap();
        assert!(matches!(
            t.attach("peer"),
            Err(SessionError::AlreadyAttached(_))
        ));

        t.detach("peer", first.id, Vec::new());
        assert!(t.attach("peer").is_ok());
    }

    #[test]
    fn stale_detach_is_ignored() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let first = t.attach("peer").unwrap();
        t.detach("peer", first.id, Vec::new());
        let _second = t.attach("peer").unwrap();

        t.detach("peer", first.id, Vec::new());
        assert!(t.list()[0].attached);
    }

    #[test]
    fn backlog_is_delivered_on_attach_in_order() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        for text in ["one", "two", "three"] {
            assert_eq!(t.deliver("peer", msg(text)), Delivery::Buffered);
        }

        let handle = t.attach("peer").unwrap();
        assert_eq!(texts(&handle.backlog), ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn live_delivery_goes_to_sink() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let mut handle = t.attach("peer").unwrap();

        assert_eq!(t.deliver("peer", msg("hi")), Delivery::Delivered);
        assert_eq!(handle.rx.recv().await.unwrap(), msg("hi"));
    }

    #[test]
    fn leftovers_return_ahead_of_newer_backlog() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let mut handle = t.attach("peer").unwrap();
        t.deliver("peer", msg("a"));
        t.deliver("peer", msg("b"));

        handle.rx.close();
        let mut leftovers = Vec::new();
        while let Ok(event) = handle.rx.try_recv() {
            leftovers.push(event);
        }
        assert_eq!(t.deliver("peer", msg("c")), Delivery::Buffered);
        t.detach("peer", handle.id, leftovers);

        let again = t.attach("peer").unwrap();
        assert_eq!(texts(&again.backlog), ["a", "b", "c"]);
    }

    #[test]
    fn backlog_drops_oldest_when_full() {
        let t = table(2);
        t.create("peer", key()).unwrap();
        for text in ["1", "2", "3"] {
            t.deliver("peer", msg(text));
        }
        assert_eq!(texts(&t.attach("peer").unwrap().backlog), ["2", "3"]);
    }

    #[test]
    fn remove_cancels_attached_stream() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let handle = t.attach("peer").unwrap();

        t.remove("peer").unwrap();
        assert!(handle.cancel.is_cancelled());
        assert!(matches!(t.remove("peer"), Err(SessionError::NotFound(_))));
        assert_eq!(t.deliver("peer", msg("late")), Delivery::UnknownPeer);
    }

    #[test]
    fn full_sink_overflows_into_backlog_in_order() {
        let t = table(SINK_CAPACITY * 2);
        t.create("slow", key()).unwrap();
        t.create("other", key()).unwrap();
        let mut handle = t.attach("slow").unwrap();

        for i in 0..SINK_CAPACITY {
            assert_eq!(t.deliver("slow", msg(&i.to_string())), Delivery::Delivered);
        }
        assert_eq!(t.deliver("slow", msg("overflow-1")), Delivery::Buffered);
        // a slot frees up, but order still puts this behind the overflow
        handle.rx.try_recv().unwrap();
        assert_eq!(t.deliver("slow", msg("overflow-2")), Delivery::Buffered);

        // other peers are unaffected
        assert_eq!(t.deliver("other", msg("hi")), Delivery::Buffered);
        assert_eq!(t.list()[0].backlog, 1);

        assert_eq!(
            texts(&t.take_backlog("slow", handle.id)),
            ["overflow-1", "overflow-2"]
        );
        assert!(t.take_backlog("slow", handle.id).is_empty());
    }

    #[test]
    fn take_backlog_ignores_stale_attachment() {
        let t = table(8);
        t.create("peer", key()).unwrap();
        let first = t.attach("peer").unwrap();
        t.detach("peer", first.id, vec![msg("kept")]);

        assert!(t.take_backlog("peer", first.id).is_empty());
        assert_eq!(texts(&t.attach("peer").unwrap().backlog), ["kept"]);
    }

    #[test]
    fn root_cancel_reaches_every_attachment() {
        let root = CancellationToken::new();
        let t = SessionTable::new(8, root.clone());
        t.create("a", key()).unwrap();
        t.create("b", key()).unwrap();
        let ha = t.attach("a").unwrap();
        let hb = t.attach("b").unwrap();

        root.cancel();
        assert!(ha.cancel.is_cancelled());
        assert!(hb.cancel.is_cancelled());
    }

    #[test]
    fn drain_empties_table() {
        let t = table(8);
        t.create("a", key()).unwrap();
        t.create("b", key()).unwrap();
        let mut peers: Vec<String> = t.drain().into_iter().map(|(p, _)| p).collect();
        peers.sort();
        assert_eq!(peers, ["a", "b"]);
        assert!(t.is_empty());
    }

    #[test]
    fn presence_is_recorded_and_forwarded() {
        let t = table(8);
        assert!(!t.set_presence("peer", true));

        t.create("peer", key()).unwrap();
        let mut handle = t.attach("peer").unwrap();
        assert!(t.set_presence("peer", false));

        assert_eq!(t.list()[0].peer_online, Some(false));
        assert_eq!(
            handle.rx.try_recv().unwrap(),
            Event::Presence {
                peer: "peer".into(),
                online: false
            }
        );
    }

    #[test]
    fn sole_peer_requires_exactly_one() {
        let t = table(8);
        assert_eq!(t.sole_peer(), None);
        t.create("a", key()).unwrap();
        assert_eq!(t.sole_peer().as_deref(), Some("a"));
        t.create("b", key()).unwrap();
        assert_eq!(t.sole_peer(), None);
    }
}
