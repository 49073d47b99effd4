//! Wire format for everything published on the broker.
//!
//! An envelope is one JSON object carrying the sender and recipient
//! addresses, a ChaCha20-Poly1305 ciphertext under the pair's ECDH key, and
//! an ECDSA signature over the canonical bytes of the other fields. The
//! ciphertext holds a [`Payload`].

use crate::crypto::{self, Sealed, signing_input};
use crate::identity::{Identity, public_key_from_address};
use bytes::Bytes;
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENVELOPE_VERSION: u8 = 1;
pub const TOPIC_PREFIX: &str = "natschat.chat";

/// Broker subject an identity listens on.
pub fn topic_for(address: &str) -> String {
    format!("{TOPIC_PREFIX}.{address}")
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("envelope is addressed to {0}")]
    Misdirected(String),

    #[error("chat text must be a single line")]
    MultiLine,

    #[error("failed to seal envelope: {0}")]
    Seal(String),
}

/// Decrypted envelope contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// One line of chat text.
    Chat { text: String, sent_at_ms: u64 },
    /// Presence announcement. `reply_requested` asks the peer to answer with
    /// its own presence if it has a session for us.
    Presence {
        online: bool,
        #[serde(default)]
        reply_requested: bool,
    },
}

impl Payload {
    pub fn chat(text: impl Into<String>) -> Self {
        Payload::Chat {
            text: text.into(),
            sent_at_ms: crate::now_ms(),
        }
    }
}

/// An authenticated, decrypted inbound envelope.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub sender_key: PublicKey,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    v: u8,
    from: String,
    to: String,
    nonce_b64: String,
    ciphertext_b64: String,
    signature_b64: String,
}

fn signed_fields(v: u8, from: &str, to: &str, nonce_b64: &str, ciphertext_b64: &str) -> Vec<u8> {
    signing_input(v, &[from, to, nonce_b64, ciphertext_b64])
}

fn is_single_line(text: &str) -> bool {
    !text.contains(['\n', '\r'])
}

/// Seal `payload` from `sender` for the holder of `recipient`.
pub fn encode(
    payload: &Payload,
    sender: &Identity,
    recipient: &PublicKey,
) -> Result<Bytes, CodecError> {
    if let Payload::Chat { text, .. } = payload
        && !is_single_line(text)
    {
        return Err(CodecError::MultiLine);
    }

    let plaintext = serde_json::to_vec(payload).map_err(|e| CodecError::Seal(e.to_string()))?;
    let sealed = sender
        .chat_key(recipient)
        .seal(&plaintext)
        .map_err(|e| CodecError::Seal(e.to_string()))?;
    let (nonce_b64, ciphertext_b64) = sealed.to_b64();

    let to = crate::identity::address_of(recipient);
    let signature_b64 = sender.sign(&signed_fields(
        ENVELOPE_VERSION,
        &sender.address,
        &to,
        &nonce_b64,
        &ciphertext_b64,
    ));

    let wire = WireEnvelope {
        v: ENVELOPE_VERSION,
        from: sender.address.clone(),
        to,
        nonce_b64,
        ciphertext_b64,
        signature_b64,
    };
    let bytes = serde_json::to_vec(&wire).map_err(|e| CodecError::Seal(e.to_string()))?;
    Ok(Bytes::from(bytes))
}

/// Open an envelope addressed to `recipient`.
pub fn decode(bytes: &[u8], recipient: &Identity) -> Result<Inbound, CodecError> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if wire.v != ENVELOPE_VERSION {
        return Err(CodecError::Malformed(format!(
            "unsupported version {}",
            wire.v
        )));
    }
    if wire.to != recipient.address {
        return Err(CodecError::Misdirected(wire.to));
    }
    let sender_key = public_key_from_address(&wire.from)
        .map_err(|_| CodecError::Malformed("sender is not a valid address".into()))?;

    let signed = signed_fields(
        wire.v,
        &wire.from,
        &wire.to,
        &wire.nonce_b64,
        &wire.ciphertext_b64,
    );
    if !crypto::verify(&sender_key, &signed, &wire.signature_b64) {
        return Err(CodecError::AuthenticationFailed("bad signature"));
    }

    let sealed = Sealed::from_b64(&wire.nonce_b64, &wire.ciphertext_b64)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    let plaintext = recipient
        .chat_key(&sender_key)
        .open(&sealed)
        .map_err(|_| CodecError::AuthenticationFailed("ciphertext does not open"))?;
    let payload: Payload =
        serde_json::from_slice(&plaintext).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if let Payload::Chat { text, .. } = &payload
        && !is_single_line(text)
    {
        return Err(CodecError::Malformed("chat text spans lines".into()));
    }

    Ok(Inbound {
        from: wire.from,
        sender_key,
        payload,
    })
}
