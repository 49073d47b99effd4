use crate::crypto::{self, ChatKey};
use crate::profile_dir::ensure_profile_dir;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub const PRIVATE_KEY_FILE: &str = "private.pem";
pub const PUBLIC_KEY_FILE: &str = "public.pem";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key file already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("no key file at {} (run `nats-chat generate` first)", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid key in {}: {reason}", path.display())]
    InvalidKey { path: PathBuf, reason: String },

    #[error("{} does not match the private key", path.display())]
    Mismatch { path: PathBuf },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A chat identity backed by a secp256k1 key pair.
#[derive(Clone)]
pub struct Identity {
    secret_key: SecretKey,
    pub public_key: PublicKey,
    pub address: String,
}

impl Identity {
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        let address = address_of(&public_key);
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    /// Create a new key pair under `out_dir`.
    ///
    /// Both files are created with `O_EXCL`, so an existing key (or a
    /// concurrent `generate` racing for the same directory) makes this fail
    /// with [`IdentityError::AlreadyExists`] and leaves the files on disk
    /// untouched.
    pub fn generate(out_dir: &Path) -> Result<Self, IdentityError> {
        ensure_profile_dir(out_dir).map_err(|source| IdentityError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let private_path = out_dir.join(PRIVATE_KEY_FILE);
        let public_path = out_dir.join(PUBLIC_KEY_FILE);
        if public_path.exists() {
            return Err(IdentityError::AlreadyExists { path: public_path });
        }

        let identity = Self::from_secret_key(SecretKey::random(&mut OsRng));
        let private_pem = identity
            .secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey {
                path: private_path.clone(),
                reason: e.to_string(),
            })?;
        let public_pem = identity
            .public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey {
                path: public_path.clone(),
                reason: e.to_string(),
            })?;

        write_new(&private_path, private_pem.as_bytes(), 0o600)?;
        if let Err(e) = write_new(&public_path, public_pem.as_bytes(), 0o644) {
            // private.pem was created by us above, nobody else can own it
            std::fs::remove_file(&private_path).ok();
            return Err(e);
        }

        tracing::info!(address = %identity.address, dir = %out_dir.display(), "generated identity");
        Ok(identity)
    }

    /// Load the identity stored in `profile_dir`.
    pub fn load(profile_dir: &Path) -> Result<Self, IdentityError> {
        let private_path = profile_dir.join(PRIVATE_KEY_FILE);
        let pem = read_key_file(&private_path)?;
        let secret_key =
            SecretKey::from_pkcs8_pem(&pem).map_err(|e| IdentityError::InvalidKey {
                path: private_path.clone(),
                reason: e.to_string(),
            })?;
        let identity = Self::from_secret_key(secret_key);

        let public_path = profile_dir.join(PUBLIC_KEY_FILE);
        if public_path.exists() && read_public_key(&public_path)? != identity.public_key {
            return Err(IdentityError::Mismatch { path: public_path });
        }

        Ok(identity)
    }

    /// Base64 DER signature over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        crypto::sign(&self.secret_key, message)
    }

    /// Symmetric key shared with `peer_public` via ECDH.
    pub fn chat_key(&self, peer_public: &PublicKey) -> ChatKey {
        ChatKey::agree(&self.secret_key, peer_public)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// The address of a public key: base58 of its compressed SEC1 encoding.
pub fn address_of(public_key: &PublicKey) -> String {
    bs58::encode(public_key.to_encoded_point(true).as_bytes()).into_string()
}

/// Recover the public key an address was derived from.
pub fn public_key_from_address(address: &str) -> Result<PublicKey, IdentityError> {
    let invalid = || IdentityError::InvalidAddress(address.to_string());
    let bytes = bs58::decode(address).into_vec().map_err(|_| invalid())?;
    let public_key = PublicKey::from_sec1_bytes(&bytes).map_err(|_| invalid())?;
    // uncompressed encodings decode too, but would land on a different topic
    if address_of(&public_key) != address {
        return Err(invalid());
    }
    Ok(public_key)
}

/// Read a `public.pem` file, e.g. a peer's key handed over out of band.
pub fn read_public_key(path: &Path) -> Result<PublicKey, IdentityError> {
    let pem = read_key_file(path)?;
    PublicKey::from_public_key_pem(&pem).map_err(|e| IdentityError::InvalidKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_key_file(path: &Path) -> Result<Zeroizing<String>, IdentityError> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => IdentityError::NotFound {
                path: path.to_path_buf(),
            },
            _ => IdentityError::Io {
                path: path.to_path_buf(),
                source,
            },
        })
}

fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<(), IdentityError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::AlreadyExists => IdentityError::AlreadyExists {
            path: path.to_path_buf(),
        },
        _ => IdentityError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;

    if let Err(source) = file.write_all(contents).and_then(|()| file.sync_all()) {
        drop(file);
        std::fs::remove_file(path).ok();
        return Err(IdentityError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn generate_then_load_same_address() {
        let dir = tempfile::tempdir().unwrap();
        let created = Identity::generate(dir.path()).unwrap();
        let loaded = Identity::load(dir.path()).unwrap();
        assert_eq!(created.address, loaded.address);
        assert_eq!(created.public_key, loaded.public_key);
    }

    #[test]
    fn address_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::generate(dir.path()).unwrap();
        assert_eq!(address_of(&identity.public_key), identity.address);
        assert_eq!(
            Identity::load(dir.path()).unwrap().address,
            Identity::load(dir.path()).unwrap().address
        );
    }

    #[test]
    fn different_keys_different_addresses() {
        let a = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        let b = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn second_generate_fails_and_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        Identity::generate(dir.path()).unwrap();
        let private_before = std::fs::read(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        let public_before = std::fs::read(dir.path().join(PUBLIC_KEY_FILE)).unwrap();

        let err = Identity::generate(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyExists { .. }));

        assert_eq!(
            std::fs::read(dir.path().join(PRIVATE_KEY_FILE)).unwrap(),
            private_before
        );
        assert_eq!(
            std::fs::read(dir.path().join(PUBLIC_KEY_FILE)).unwrap(),
            public_before
        );
    }

    #[test]
    fn lone_public_key_blocks_generate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PUBLIC_KEY_FILE), "placeholder").unwrap();

        let err = Identity::generate(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyExists { .. }));
        assert!(!dir.path().join(PRIVATE_KEY_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(PUBLIC_KEY_FILE)).unwrap(),
            "placeholder"
        );
    }

    #[test]
    fn concurrent_generate_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = dir.path().to_path_buf();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    Identity::generate(&path).map(|id| id.address)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(&Identity::load(dir.path()).unwrap().address, winners[0]);
    }

    #[cfg(unix)]
    #[test]
    fn private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        Identity::generate(dir.path()).unwrap();
        let meta = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn load_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Identity::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, IdentityError::NotFound { .. }));
    }

    #[test]
    fn mismatched_public_key_rejected() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        Identity::generate(a.path()).unwrap();
        Identity::generate(b.path()).unwrap();
        std::fs::copy(b.path().join(PUBLIC_KEY_FILE), a.path().join(PUBLIC_KEY_FILE)).unwrap();

        let err = Identity::load(a.path()).unwrap_err();
        assert!(matches!(err, IdentityError::Mismatch { .. }));
    }

    #[test]
    fn address_resolves_to_public_key() {
        let identity = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        let resolved = public_key_from_address(&identity.address).unwrap();
        assert_eq!(resolved, identity.public_key);
    }

    #[test]
    fn garbage_address_rejected() {
        assert!(public_key_from_address("not-base58-0OIl").is_err());
        assert!(public_key_from_address("3mJr7AoUXx2Wqd").is_err());
        assert!(public_key_from_address("").is_err());
    }

    #[test]
    fn uncompressed_address_rejected() {
        let identity = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        let uncompressed =
            bs58::encode(identity.public_key.to_encoded_point(false).as_bytes()).into_string();
        assert!(public_key_from_address(&uncompressed).is_err());
    }

    #[test]
    fn read_public_key_matches_generated() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::generate(dir.path()).unwrap();
        let key = read_public_key(&dir.path().join(PUBLIC_KEY_FILE)).unwrap();
        assert_eq!(key, identity.public_key);
    }

    #[test]
    fn sign_verify_round_trip() {
        let identity = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        let sig = identity.sign(b"test message");
        assert!(crypto::verify(&identity.public_key, b"test message", &sig));
    }

    #[test]
    fn shared_key_is_symmetric() {
        let a = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        let b = Identity::from_secret_key(SecretKey::random(&mut OsRng));
        assert_eq!(
            a.chat_key(&b.public_key).as_bytes(),
            b.chat_key(&a.public_key).as_bytes()
        );
    }
}
