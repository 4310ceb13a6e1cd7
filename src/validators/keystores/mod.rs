mod local;
pub mod scrypt;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use blst::min_pk::SecretKey;
use rand::RngCore;
use thiserror::Error;

use super::signing::{self, ExitSignatureShards, SigningError, VoluntaryExit};

pub use local::{list_keystore_files, load_keystores, KeystoreFile};
pub use scrypt::{ContainerError, ScryptCost, ScryptKeystore};

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Invalid keystore format in {file}: {reason}")]
    InvalidFormat { file: String, reason: String },

    #[error("Invalid password for keystore {file}")]
    InvalidPassword { file: String },

    #[error("Keystore {file} does not hold a valid BLS secret key")]
    InvalidSecretKey { file: String },

    #[error("No password found for keystore {file}")]
    MissingPassword { file: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load keystores ({dispatched}/{total} dispatched): {}", summarize(.errors))]
    LoadFailed {
        dispatched: usize,
        total: usize,
        errors: Vec<KeystoreError>,
    },

    #[error("Keystore worker failed: {0}")]
    Worker(String),
}

impl KeystoreError {
    pub(crate) fn from_container(file: &str, err: ContainerError) -> Self {
        match err {
            ContainerError::InvalidFormat(reason) => KeystoreError::InvalidFormat {
                file: file.to_string(),
                reason,
            },
            ContainerError::InvalidPassword => KeystoreError::InvalidPassword {
                file: file.to_string(),
            },
        }
    }
}

fn summarize(errors: &[KeystoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Compressed BLS12-381 public key of `secret`, `0x`-prefixed
pub fn derive_public_key(secret: &[u8]) -> Option<String> {
    let secret_key = SecretKey::from_bytes(secret).ok()?;
    Some(format!("0x{}", hex::encode(secret_key.sk_to_pk().to_bytes())))
}

/// Decrypted signing keys indexed by public key
#[derive(Clone, Default)]
pub struct Keystores {
    keys: HashMap<String, Vec<u8>>,
}

impl Keystores {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.keys.contains_key(public_key)
    }

    pub fn get(&self, public_key: &str) -> Option<&[u8]> {
        self.keys.get(public_key).map(Vec::as_slice)
    }

    /// Sorted public keys
    pub fn public_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Exit signature of `public_key` for `exit`
    pub fn exit_signature(
        &self,
        public_key: &str,
        exit: &VoluntaryExit,
    ) -> Result<[u8; 96], SigningError> {
        let secret = self.secret(public_key)?;
        signing::sign(secret, exit.signing_root().as_slice())
    }

    /// Splits the key of `public_key` into `total` shares and signs `exit`
    /// with each of them
    pub fn exit_signature_shards<R: RngCore>(
        &self,
        public_key: &str,
        exit: &VoluntaryExit,
        threshold: usize,
        total: usize,
        rng: &mut R,
    ) -> Result<ExitSignatureShards, SigningError> {
        let secret = self.secret(public_key)?;
        signing::exit_signature_shards(
            secret,
            exit.signing_root().as_slice(),
            threshold,
            total,
            rng,
        )
    }

    fn secret(&self, public_key: &str) -> Result<&[u8], SigningError> {
        self.get(public_key)
            .ok_or_else(|| SigningError::UnknownPublicKey(public_key.to_string()))
    }

    /// Returns the replaced secret when the public key was already present
    pub(crate) fn insert(&mut self, public_key: String, secret: Vec<u8>) -> Option<Vec<u8>> {
        self.keys.insert(public_key, secret)
    }
}

// secrets stay out of logs
impl fmt::Debug for Keystores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystores")
            .field("public_keys", &self.public_keys())
            .finish()
    }
}
