#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use alloy_primitives::B256;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{self, EnvFilter};

use vault_operator::contracts::{RegistryRootReader, ValidatorIndexSource};
use vault_operator::validators::keystores::{derive_public_key, ScryptCost, ScryptKeystore};

static INIT: Once = Once::new();

pub const FAST_SCRYPT: ScryptCost = ScryptCost { n: 16, r: 8, p: 1 };

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    });
}

/// 32-byte secret whose last byte is `value`
pub fn secret(value: u8) -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    secret[31] = value;
    secret
}

/// Writes a fast keystore and returns its public key
pub fn write_keystore(dir: &Path, name: &str, secret_value: u8, password: &str) -> String {
    let secret = secret(secret_value);
    let mut rng = StdRng::seed_from_u64(secret_value as u64);
    let keystore = ScryptKeystore::encrypt(&secret, password, FAST_SCRYPT, &mut rng)
        .expect("keystore encryption");
    fs::write(dir.join(name), keystore.to_json().expect("keystore json")).expect("write keystore");
    derive_public_key(&secret).expect("valid secret")
}

/// Round-state source returning fixed values and counting lookups
pub struct FixedRoundState {
    pub root: B256,
    pub index: u64,
    pub root_calls: AtomicUsize,
    pub index_calls: AtomicUsize,
}

impl FixedRoundState {
    pub fn new(root: B256, index: u64) -> Self {
        Self {
            root,
            index,
            root_calls: AtomicUsize::new(0),
            index_calls: AtomicUsize::new(0),
        }
    }

    pub fn root_calls(&self) -> usize {
        self.root_calls.load(Ordering::SeqCst)
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryRootReader for FixedRoundState {
    async fn registry_root(&self) -> anyhow::Result<B256> {
        self.root_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.root)
    }
}

#[async_trait]
impl ValidatorIndexSource for FixedRoundState {
    async fn next_validator_index(&self) -> anyhow::Result<u64> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.index)
    }
}
