//! Primitives behind the envelope: an ECDH-agreed ChaCha20-Poly1305 key per
//! identity pair, and ECDSA signatures over length-prefixed fields.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use k256::ecdh::diffie_hellman;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const CHAT_KEY_BYTES: usize = 32;
pub const CHAT_NONCE_BYTES: usize = 12;

/// Domain separation for the pairwise key.
const CHAT_KEY_LABEL: &[u8] = b"natschat-chat-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{0} is not valid base64")]
    Base64(&'static str),

    #[error("nonce must be {CHAT_NONCE_BYTES} bytes, got {0}")]
    NonceLength(usize),

    #[error("encryption failed")]
    Seal,

    #[error("ciphertext failed authentication")]
    Open,
}

/// The symmetric key two identities share. Either side derives the same key
/// from its own secret and the other's public key.
pub struct ChatKey(Zeroizing<[u8; CHAT_KEY_BYTES]>);

impl ChatKey {
    pub fn agree(secret: &SecretKey, peer_public: &PublicKey) -> Self {
        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer_public.as_affine());
        let digest = Sha256::new()
            .chain_update(CHAT_KEY_LABEL)
            .chain_update(shared.raw_secret_bytes())
            .finalize();
        let mut key = Zeroizing::new([0u8; CHAT_KEY_BYTES]);
        key.copy_from_slice(&digest);
        Self(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()))
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut nonce = [0u8; CHAT_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;
        Ok(Sealed { nonce, ciphertext })
    }

    pub fn open(&self, sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.cipher()
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Open)
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8; CHAT_KEY_BYTES] {
        &self.0
    }
}

/// AEAD output together with its nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; CHAT_NONCE_BYTES],
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// `(nonce_b64, ciphertext_b64)`
    pub fn to_b64(&self) -> (String, String) {
        (B64.encode(self.nonce), B64.encode(&self.ciphertext))
    }

    pub fn from_b64(nonce_b64: &str, ciphertext_b64: &str) -> Result<Self, CryptoError> {
        let raw_nonce = B64.decode(nonce_b64).map_err(|_| CryptoError::Base64("nonce"))?;
        let nonce: [u8; CHAT_NONCE_BYTES] = raw_nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::NonceLength(raw_nonce.len()))?;
        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::Base64("ciphertext"))?;
        Ok(Self { nonce, ciphertext })
    }
}

/// ECDSA-sign `message`; the result is a base64 DER signature.
pub fn sign(secret: &SecretKey, message: &[u8]) -> String {
    let signature: Signature = SigningKey::from(secret).sign(message);
    B64.encode(signature.to_der().as_bytes())
}

pub fn verify(public_key: &PublicKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(der) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&der) else {
        return false;
    };
    VerifyingKey::from(public_key)
        .verify(message, &signature)
        .is_ok()
}

/// Signing input for a versioned record: the version byte, then each field
/// as a big-endian `u32` length followed by its bytes.
pub fn signing_input(version: u8, fields: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + fields.iter().map(|f| 4 + f.len()).sum::<usize>());
    out.push(version);
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecretKey, SecretKey) {
        (SecretKey::random(&mut OsRng), SecretKey::random(&mut OsRng))
    }

    #[test]
    fn both_sides_agree_on_the_key() {
        let (a, b) = pair();
        let ab = ChatKey::agree(&a, &b.public_key());
        let ba = ChatKey::agree(&b, &a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());

        let sealed = ab.seal(b"hello world").unwrap();
        assert_eq!(ba.open(&sealed).unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn third_party_key_cannot_open() {
        let (a, b) = pair();
        let eve = SecretKey::random(&mut OsRng);
        let sealed = ChatKey::agree(&a, &b.public_key()).seal(b"secret").unwrap();
        let wrong = ChatKey::agree(&eve, &b.public_key());
        assert!(matches!(wrong.open(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn nonces_are_fresh() {
        let (a, b) = pair();
        let key = ChatKey::agree(&a, &b.public_key());
        assert_ne!(key.seal(b"x").unwrap().nonce, key.seal(b"x").unwrap().nonce);
    }

    #[test]
    fn short_nonce_rejected() {
        let short = B64.encode([0u8; 4]);
        assert!(matches!(
            Sealed::from_b64(&short, "AAAA"),
            Err(CryptoError::NonceLength(4))
        ));
        assert!(matches!(
            Sealed::from_b64("***", "AAAA"),
            Err(CryptoError::Base64("nonce"))
        ));
    }

    #[test]
    fn signature_binds_key_and_message() {
        let (a, b) = pair();
        let sig = sign(&a, b"payload");
        assert!(verify(&a.public_key(), b"payload", &sig));
        assert!(!verify(&a.public_key(), b"other", &sig));
        assert!(!verify(&b.public_key(), b"payload", &sig));
        assert!(!verify(&a.public_key(), b"payload", "not-base64!"));
    }

    #[test]
    fn signing_input_separates_fields() {
        assert_ne!(signing_input(1, &["ab", "c"]), signing_input(1, &["a", "bc"]));
        assert_ne!(signing_input(1, &["a"]), signing_input(2, &["a"]));
    }
}
