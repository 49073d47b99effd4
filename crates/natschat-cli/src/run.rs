//! Legacy direct mode: one conversation relayed straight over NATS, no
//! daemon. Ends on stdin EOF or when the peer announces it went offline.
//!
//! Stdin is read on a detached thread, so a peer leaving cannot interrupt a
//! pending read; the process exits around it. Daemon mode has no such gap.

use crate::term::{format_message, stdin_lines};
use anyhow::{Context, Result, bail};
use k256::PublicKey;
use natschat_mesh::broker::{Broker, NatsBroker, NatsOptions, Subscription};
use natschat_mesh::envelope::{self, Payload, topic_for};
use natschat_mesh::identity::{Identity, address_of, read_public_key};
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;

pub async fn run(profile: &Path, recepient_key: &Path, nats_url: &str) -> Result<()> {
    let identity = Identity::load(profile)?;
    let peer_key = read_public_key(recepient_key)?;
    let broker = NatsBroker::connect(nats_url, &NatsOptions::default()).await?;
    let sub = broker.subscribe(&topic_for(&identity.address)).await?;
    eprintln!(
        "Chatting with {} as {}. Ctrl-D to leave.",
        address_of(&peer_key),
        identity.address
    );

    let result = relay(
        &broker,
        sub,
        &identity,
        &peer_key,
        stdin_lines(),
        &mut std::io::stdout(),
    )
    .await;
    broker.close().await;
    result.map(|_| ())
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    InputClosed,
    PeerLeft,
}

/// Relay `lines` to the peer and the peer's chat lines to `out`.
pub async fn relay<W: Write>(
    broker: &dyn Broker,
    mut sub: Subscription,
    identity: &Identity,
    peer_key: &PublicKey,
    mut lines: mpsc::Receiver<String>,
    out: &mut W,
) -> Result<RelayEnd> {
    let peer = address_of(peer_key);
    let topic = topic_for(&peer);
    let publish = |payload: Payload| {
        let topic = topic.clone();
        async move {
            let bytes = envelope::encode(&payload, identity, peer_key)?;
            broker.publish(&topic, bytes).await?;
            anyhow::Ok(())
        }
    };

    publish(Payload::Presence {
        online: true,
        reply_requested: true,
    })
    .await
    .context("failed to announce presence")?;

    let end = loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(text) => {
                    if let Err(e) = publish(Payload::chat(text)).await {
                        eprintln!("error: {e:#}");
                    }
                }
                None => break RelayEnd::InputClosed,
            },
            bytes = sub.next() => {
                let Some(bytes) = bytes else {
                    bail!("broker connection lost");
                };
                let inbound = match envelope::decode(&bytes, identity) {
                    Ok(i) if i.from == peer => i,
                    Ok(i) => {
                        tracing::debug!(from = %i.from, "ignoring message from another peer");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(err = %e, "dropping inbound envelope");
                        continue;
                    }
                };
                match inbound.payload {
                    Payload::Chat { text, sent_at_ms } => {
                        writeln!(out, "{}", format_message(sent_at_ms, &text))?;
                        out.flush()?;
                    }
                    Payload::Presence { online: false, .. } => {
                        eprintln!("* {peer} went offline");
                        break RelayEnd::PeerLeft;
                    }
                    Payload::Presence { online: true, reply_requested } => {
                        if reply_requested {
                            publish(Payload::Presence {
                                online: true,
                                reply_requested: false,
                            })
                            .await
                            .ok();
                        }
                    }
                }
            }
        }
    };

    if end == RelayEnd::InputClosed
        && let Err(e) = publish(Payload::Presence {
            online: false,
            reply_requested: false,
        })
        .await
    {
        tracing::debug!(err = %e, "offline notice not sent");
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use natschat_mesh::broker::MemoryHub;
    use std::time::Duration;

    #[tokio::test]
    async fn two_relays_exchange_and_stop_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Identity::generate(&dir.path().join("alice")).unwrap();
        let bob = Identity::generate(&dir.path().join("bob")).unwrap();

        let hub = MemoryHub::new();
        let (a_broker, b_broker) = (hub.connect(), hub.connect());
        let a_sub = a_broker.subscribe(&topic_for(&alice.address)).await.unwrap();
        let b_sub = b_broker.subscribe(&topic_for(&bob.address)).await.unwrap();

        let (a_tx, a_lines) = mpsc::channel(8);
        let (_b_tx, b_lines) = mpsc::channel::<String>(8);
        a_tx.send("Hello!".to_string()).await.unwrap();
        a_tx.send(String::new()).await.unwrap();
        drop(a_tx);

        let mut a_out = Vec::new();
        let mut b_out = Vec::new();
        let (a_end, b_end) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                relay(&a_broker, a_sub, &alice, &bob.public_key, a_lines, &mut a_out),
                relay(&b_broker, b_sub, &bob, &alice.public_key, b_lines, &mut b_out),
            )
        })
        .await
        .unwrap();

        assert_eq!(a_end.unwrap(), RelayEnd::InputClosed);
        assert_eq!(b_end.unwrap(), RelayEnd::PeerLeft);
        let printed = String::from_utf8(b_out).unwrap();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Hello!"));
        assert!(lines[1].ends_with("] "));
    }

    #[tokio::test]
    async fn messages_from_other_senders_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let me = Identity::generate(&dir.path().join("me")).unwrap();
        let peer = Identity::generate(&dir.path().join("peer")).unwrap();
        let stranger = Identity::generate(&dir.path().join("stranger")).unwrap();

        let hub = MemoryHub::new();
        let broker = hub.connect();
        let sub = broker.subscribe(&topic_for(&me.address)).await.unwrap();
        let topic = topic_for(&me.address);
        let spam = envelope::encode(&Payload::chat("spam"), &stranger, &me.public_key).unwrap();
        hub.inject(&topic, spam).await;
        hub.inject(&topic, Bytes::from_static(b"garbage")).await;
        let real = envelope::encode(&Payload::chat("real"), &peer, &me.public_key).unwrap();
        hub.inject(&topic, real).await;
        let bye = Payload::Presence {
            online: false,
            reply_requested: false,
        };
        hub.inject(&topic, envelope::encode(&bye, &peer, &me.public_key).unwrap())
            .await;

        let (_tx, lines) = mpsc::channel::<String>(1);
        let mut out = Vec::new();
        let end = relay(&broker, sub, &me, &peer.public_key, lines, &mut out)
            .await
            .unwrap();

        assert_eq!(end, RelayEnd::PeerLeft);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("real"));
        assert!(!printed.contains("spam"));
    }
}
