//! Password-encrypted keystore container with a scrypt KDF, AES-128-CTR cipher
//! and SHA-256 checksum.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const KDF_FUNCTION: &str = "scrypt";
const CHECKSUM_FUNCTION: &str = "sha256";
const CIPHER_FUNCTION: &str = "aes-128-ctr";
const KEYSTORE_VERSION: u32 = 4;
const DERIVED_KEY_LENGTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("{0}")]
    InvalidFormat(String),

    #[error("checksum mismatch")]
    InvalidPassword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScryptKeystore {
    pub crypto: KeystoreCrypto,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub uuid: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub kdf: KdfModule,
    pub checksum: ChecksumModule,
    pub cipher: CipherModule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfModule {
    pub function: String,
    pub params: ScryptParams,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScryptParams {
    pub dklen: usize,
    pub n: u64,
    pub r: u32,
    pub p: u32,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumModule {
    pub function: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherModule {
    pub function: String,
    pub params: CipherParams,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

/// scrypt work factors used when creating a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptCost {
    pub n: u64,
    pub r: u32,
    pub p: u32,
}

impl Default for ScryptCost {
    fn default() -> Self {
        Self {
            n: 262_144,
            r: 8,
            p: 1,
        }
    }
}

impl ScryptKeystore {
    pub fn from_json(json: &str) -> Result<Self, ContainerError> {
        let keystore: Self = serde_json::from_str(json)
            .map_err(|e| ContainerError::InvalidFormat(format!("invalid keystore json: {}", e)))?;
        keystore.check_functions()?;
        Ok(keystore)
    }

    pub fn to_json(&self) -> Result<String, ContainerError> {
        serde_json::to_string_pretty(self).map_err(|e| ContainerError::InvalidFormat(e.to_string()))
    }

    /// Returns the secret held by the container
    pub fn decrypt(&self, password: &str) -> Result<Vec<u8>, ContainerError> {
        self.check_functions()?;

        let kdf = &self.crypto.kdf.params;
        let salt = decode_field(&kdf.salt, "kdf salt")?;
        let checksum = decode_field(&self.crypto.checksum.message, "checksum")?;
        let iv = decode_field(&self.crypto.cipher.params.iv, "cipher iv")?;
        let mut secret = decode_field(&self.crypto.cipher.message, "cipher message")?;

        let derived = derive_key(&process_password(password), &salt, kdf)?;
        if checksum_of(&derived, &secret).as_slice() != checksum.as_slice() {
            return Err(ContainerError::InvalidPassword);
        }

        let mut cipher = Aes128Ctr::new_from_slices(&derived[..16], &iv)
            .map_err(|_| ContainerError::InvalidFormat("cipher iv must be 16 bytes".to_string()))?;
        cipher.apply_keystream(&mut secret);
        Ok(secret)
    }

    /// Wraps `secret` in a new container protected by `password`
    pub fn encrypt<R: RngCore>(
        secret: &[u8],
        password: &str,
        cost: ScryptCost,
        rng: &mut R,
    ) -> Result<Self, ContainerError> {
        let mut salt = [0u8; 32];
        let mut iv = [0u8; 16];
        let mut uuid_bytes = [0u8; 16];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);
        rng.fill_bytes(&mut uuid_bytes);

        let params = ScryptParams {
            dklen: DERIVED_KEY_LENGTH,
            n: cost.n,
            r: cost.r,
            p: cost.p,
            salt: hex::encode(salt),
        };
        let derived = derive_key(&process_password(password), &salt, &params)?;

        let mut message = secret.to_vec();
        let mut cipher = Aes128Ctr::new_from_slices(&derived[..16], &iv)
            .map_err(|_| ContainerError::InvalidFormat("cipher iv must be 16 bytes".to_string()))?;
        cipher.apply_keystream(&mut message);

        let pubkey = super::derive_public_key(secret)
            .map(|pk| pk.trim_start_matches("0x").to_string())
            .unwrap_or_default();

        Ok(Self {
            crypto: KeystoreCrypto {
                kdf: KdfModule {
                    function: KDF_FUNCTION.to_string(),
                    params,
                    message: String::new(),
                },
                checksum: ChecksumModule {
                    function: CHECKSUM_FUNCTION.to_string(),
                    params: serde_json::Map::new(),
                    message: hex::encode(checksum_of(&derived, &message)),
                },
                cipher: CipherModule {
                    function: CIPHER_FUNCTION.to_string(),
                    params: CipherParams {
                        iv: hex::encode(iv),
                    },
                    message: hex::encode(message),
                },
            },
            description: String::new(),
            pubkey,
            path: String::new(),
            uuid: uuid::Builder::from_random_bytes(uuid_bytes).into_uuid().to_string(),
            version: KEYSTORE_VERSION,
        })
    }

    fn check_functions(&self) -> Result<(), ContainerError> {
        let crypto = &self.crypto;
        if crypto.kdf.function != KDF_FUNCTION {
            return Err(ContainerError::InvalidFormat(format!(
                "unsupported kdf {}",
                crypto.kdf.function
            )));
        }
        if crypto.checksum.function != CHECKSUM_FUNCTION {
            return Err(ContainerError::InvalidFormat(format!(
                "unsupported checksum {}",
                crypto.checksum.function
            )));
        }
        if crypto.cipher.function != CIPHER_FUNCTION {
            return Err(ContainerError::InvalidFormat(format!(
                "unsupported cipher {}",
                crypto.cipher.function
            )));
        }
        Ok(())
    }
}

/// NFKD normalisation with C0, C1 and DEL control characters removed
pub fn process_password(password: &str) -> Vec<u8> {
    password
        .nfkd()
        .filter(|c| !matches!(*c as u32, 0x00..=0x1f | 0x7f..=0x9f))
        .collect::<String>()
        .into_bytes()
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: &ScryptParams,
) -> Result<Vec<u8>, ContainerError> {
    if params.dklen < DERIVED_KEY_LENGTH {
        return Err(ContainerError::InvalidFormat(format!(
            "dklen must be at least {}, got {}",
            DERIVED_KEY_LENGTH, params.dklen
        )));
    }
    if params.n < 2 || !params.n.is_power_of_two() {
        return Err(ContainerError::InvalidFormat(format!(
            "scrypt n must be a power of two, got {}",
            params.n
        )));
    }
    let log_n = params.n.trailing_zeros() as u8;

    let scrypt_params = ::scrypt::Params::new(log_n, params.r, params.p, params.dklen)
        .map_err(|e| ContainerError::InvalidFormat(format!("invalid scrypt params: {}", e)))?;
    let mut derived = vec![0u8; params.dklen];
    ::scrypt::scrypt(password, salt, &scrypt_params, &mut derived)
        .map_err(|e| ContainerError::InvalidFormat(format!("scrypt failed: {}", e)))?;
    Ok(derived)
}

fn checksum_of(derived: &[u8], cipher_message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&derived[16..32]);
    hasher.update(cipher_message);
    hasher.finalize().into()
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, ContainerError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| ContainerError::InvalidFormat(format!("{} is not valid hex: {}", field, e)))
}
