//! Voluntary exit signatures and their threshold shards.
//!
//! The validator secret is split with a random polynomial over the BLS12-381
//! scalar field; share `i` is the polynomial evaluated at `x = i + 1`. Any
//! `threshold` exit signature shards recombine into the signature of the
//! original key.

use alloy_primitives::{uint, B256, U256};
use blst::min_pk::{SecretKey, Signature};
use blst::{
    blst_p2, blst_p2_add_or_double, blst_p2_affine, blst_p2_compress, blst_p2_from_affine,
    blst_p2_mult, blst_p2_uncompress, BLST_ERROR,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Order of the BLS12-381 scalar field
pub const CURVE_ORDER: U256 =
    uint!(0x73eda753299d7d483339d80809a1d80553bda402fffe5bfeffffffff00000001_U256);

pub const SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

const DOMAIN_VOLUNTARY_EXIT: [u8; 4] = [0x04, 0x00, 0x00, 0x00];
const SCALAR_BITS: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("No keystore for public key {0}")]
    UnknownPublicKey(String),

    #[error("Invalid BLS secret key")]
    InvalidSecretKey,

    #[error("Invalid threshold {threshold} for {total} shares")]
    InvalidThreshold { threshold: usize, total: usize },

    #[error("Invalid signature share {0}")]
    InvalidSignature(usize),

    #[error("Duplicate signature share {0}")]
    DuplicateShare(usize),

    #[error("No signature shares to combine")]
    NoShares,
}

/// Fork the exit is signed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusFork {
    pub version: [u8; 4],
    pub epoch: u64,
}

/// Voluntary exit of one validator on one network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoluntaryExit {
    pub validator_index: u64,
    pub fork: ConsensusFork,
    pub genesis_validators_root: B256,
}

impl VoluntaryExit {
    /// `compute_signing_root(VoluntaryExit(epoch, validator_index), domain)`
    pub fn signing_root(&self) -> B256 {
        let object_root = sha256_pair(
            &chunk(&self.fork.epoch.to_le_bytes()),
            &chunk(&self.validator_index.to_le_bytes()),
        );
        let fork_data_root =
            sha256_pair(&chunk(&self.fork.version), &self.genesis_validators_root.0);

        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&DOMAIN_VOLUNTARY_EXIT);
        domain[4..].copy_from_slice(&fork_data_root[..28]);

        B256::from(sha256_pair(&object_root, &domain))
    }
}

/// Shard public keys and exit signatures, index-aligned with the oracle set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSignatureShards {
    pub public_keys: Vec<String>,
    pub exit_signatures: Vec<String>,
}

pub fn sign(secret: &[u8], message: &[u8]) -> Result<[u8; 96], SigningError> {
    let secret_key = SecretKey::from_bytes(secret).map_err(|_| SigningError::InvalidSecretKey)?;
    Ok(secret_key.sign(message, SIGNATURE_DST, &[]).to_bytes())
}

/// Splits `secret` into `total` shares, any `threshold` of which recover it
pub fn private_key_to_private_key_shares<R: RngCore>(
    secret: &[u8],
    threshold: usize,
    total: usize,
    rng: &mut R,
) -> Result<Vec<[u8; 32]>, SigningError> {
    if threshold == 0 || threshold > total {
        return Err(SigningError::InvalidThreshold { threshold, total });
    }
    SecretKey::from_bytes(secret).map_err(|_| SigningError::InvalidSecretKey)?;

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(U256::from_be_slice(secret));
    for _ in 1..threshold {
        coefficients.push(random_scalar(rng));
    }

    (1..=total as u64)
        .map(|x| {
            let point = evaluate_polynomial(&coefficients, U256::from(x));
            // a zero share is not a valid secret key
            if point.is_zero() {
                return Err(SigningError::InvalidSecretKey);
            }
            Ok(point.to_be_bytes::<32>())
        })
        .collect()
}

/// Signs `message` with every share of `secret`
pub fn exit_signature_shards<R: RngCore>(
    secret: &[u8],
    message: &[u8],
    threshold: usize,
    total: usize,
    rng: &mut R,
) -> Result<ExitSignatureShards, SigningError> {
    let shares = private_key_to_private_key_shares(secret, threshold, total, rng)?;

    let mut shards = ExitSignatureShards::default();
    for share in &shares {
        let secret_key =
            SecretKey::from_bytes(share).map_err(|_| SigningError::InvalidSecretKey)?;
        shards
            .public_keys
            .push(format!("0x{}", hex::encode(secret_key.sk_to_pk().to_bytes())));
        shards.exit_signatures.push(format!(
            "0x{}",
            hex::encode(secret_key.sign(message, SIGNATURE_DST, &[]).to_bytes())
        ));
    }
    debug!(threshold, total, "split exit signature");
    Ok(shards)
}

/// Recombines `(share index, signature)` pairs by Lagrange interpolation at zero
pub fn reconstruct_shared_bls_signature(
    signatures: &[(usize, [u8; 96])],
) -> Result<[u8; 96], SigningError> {
    if signatures.is_empty() {
        return Err(SigningError::NoShares);
    }
    let xs: Vec<U256> = signatures
        .iter()
        .map(|(index, _)| U256::from(*index as u64 + 1))
        .collect();
    for (position, (index, _)) in signatures.iter().enumerate() {
        if xs[..position].contains(&xs[position]) {
            return Err(SigningError::DuplicateShare(*index));
        }
    }

    let mut sum = blst_p2::default();
    for (position, (index, signature)) in signatures.iter().enumerate() {
        Signature::from_bytes(signature).map_err(|_| SigningError::InvalidSignature(*index))?;
        let scalar = lagrange_coefficient(&xs, position).to_le_bytes::<32>();

        let mut affine = blst_p2_affine::default();
        let mut point = blst_p2::default();
        let mut term = blst_p2::default();
        // SAFETY: every pointer refers to a live, correctly sized local
        unsafe {
            if blst_p2_uncompress(&mut affine, signature.as_ptr()) != BLST_ERROR::BLST_SUCCESS {
                return Err(SigningError::InvalidSignature(*index));
            }
            blst_p2_from_affine(&mut point, &affine);
            blst_p2_mult(&mut term, &point, scalar.as_ptr(), SCALAR_BITS);
            let sum_ptr: *mut blst_p2 = &mut sum;
            blst_p2_add_or_double(sum_ptr, sum_ptr, &term);
        }
    }

    let mut combined = [0u8; 96];
    // SAFETY: `combined` holds the 96 bytes of a compressed G2 point
    unsafe { blst_p2_compress(combined.as_mut_ptr(), &sum) };
    Ok(combined)
}

fn lagrange_coefficient(xs: &[U256], position: usize) -> U256 {
    let x_i = xs[position];
    let mut numerator = U256::from(1u64);
    let mut denominator = U256::from(1u64);
    for (j, x_j) in xs.iter().enumerate() {
        if j == position {
            continue;
        }
        numerator = numerator.mul_mod(*x_j, CURVE_ORDER);
        denominator = denominator.mul_mod(x_j.add_mod(CURVE_ORDER - x_i, CURVE_ORDER), CURVE_ORDER);
    }
    // Fermat inverse, the order is prime
    let inverse = denominator.pow_mod(CURVE_ORDER - U256::from(2u64), CURVE_ORDER);
    numerator.mul_mod(inverse, CURVE_ORDER)
}

fn evaluate_polynomial(coefficients: &[U256], x: U256) -> U256 {
    coefficients
        .iter()
        .rev()
        .fold(U256::ZERO, |acc, c| acc.mul_mod(x, CURVE_ORDER).add_mod(*c, CURVE_ORDER))
}

fn random_scalar<R: RngCore>(rng: &mut R) -> U256 {
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        bytes[0] &= 0x7f;
        let scalar = U256::from_be_bytes(bytes);
        if scalar < CURVE_ORDER {
            return scalar;
        }
    }
}

fn chunk(bytes: &[u8]) -> [u8; 32] {
    let mut chunk = [0u8; 32];
    chunk[..bytes.len()].copy_from_slice(bytes);
    chunk
}

fn sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blst::min_pk::PublicKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn secret(value: u8) -> [u8; 32] {
        let mut secret = [0u8; 32];
        secret[0] = 0x2a;
        secret[31] = value;
        secret
    }

    fn decode<const N: usize>(value: &str) -> [u8; N] {
        hex::decode(value.trim_start_matches("0x"))
            .unwrap()
            .try_into()
            .unwrap()
    }

    fn mainnet_exit(validator_index: u64) -> VoluntaryExit {
        VoluntaryExit {
            validator_index,
            fork: ConsensusFork {
                version: [0x03, 0x00, 0x00, 0x00],
                epoch: 194_048,
            },
            genesis_validators_root: B256::from(decode::<32>(
                "4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95",
            )),
        }
    }

    #[test]
    fn test_exit_signing_root() {
        assert_eq!(
            hex::encode(mainnet_exit(5).signing_root()),
            "dc17c33620c8a1b896e32c4fc4e0b8fe6c89606be6ad2a65be4d986fa85ac19c"
        );
        assert_ne!(mainnet_exit(5).signing_root(), mainnet_exit(6).signing_root());
    }

    #[test]
    fn test_shards_recombine_to_exit_signature() {
        let secret = secret(9);
        let message = mainnet_exit(5).signing_root();
        let mut rng = StdRng::seed_from_u64(11);
        let shards = exit_signature_shards(&secret, message.as_slice(), 3, 5, &mut rng).unwrap();
        assert_eq!(shards.public_keys.len(), 5);
        assert_eq!(shards.exit_signatures.len(), 5);

        let signatures: Vec<[u8; 96]> =
            shards.exit_signatures.iter().map(|s| decode::<96>(s)).collect();
        let expected = sign(&secret, message.as_slice()).unwrap();

        for subset in [[0usize, 1, 2], [0, 2, 4], [4, 1, 3]] {
            let picked: Vec<(usize, [u8; 96])> =
                subset.iter().map(|i| (*i, signatures[*i])).collect();
            assert_eq!(reconstruct_shared_bls_signature(&picked).unwrap(), expected);
        }

        let too_few = vec![(0, signatures[0]), (3, signatures[3])];
        assert_ne!(reconstruct_shared_bls_signature(&too_few).unwrap(), expected);
    }

    #[test]
    fn test_every_shard_verifies_with_its_public_key() {
        let message = mainnet_exit(42).signing_root();
        let mut rng = StdRng::seed_from_u64(3);
        let shards = exit_signature_shards(&secret(1), message.as_slice(), 2, 3, &mut rng).unwrap();

        for (public_key, signature) in shards.public_keys.iter().zip(&shards.exit_signatures) {
            let public_key = PublicKey::from_bytes(&decode::<48>(public_key)).unwrap();
            let signature = Signature::from_bytes(&decode::<96>(signature)).unwrap();
            assert_eq!(
                signature.verify(true, message.as_slice(), SIGNATURE_DST, &[], &public_key, true),
                BLST_ERROR::BLST_SUCCESS
            );
        }
    }

    #[test]
    fn test_single_share_threshold_copies_secret() {
        let mut rng = StdRng::seed_from_u64(1);
        let shares = private_key_to_private_key_shares(&secret(4), 1, 3, &mut rng).unwrap();
        assert!(shares.iter().all(|share| *share == secret(4)));
    }

    #[test]
    fn test_invalid_sharing_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            private_key_to_private_key_shares(&secret(1), 4, 3, &mut rng),
            Err(SigningError::InvalidThreshold {
                threshold: 4,
                total: 3
            })
        );
        assert_eq!(
            private_key_to_private_key_shares(&secret(1), 0, 3, &mut rng),
            Err(SigningError::InvalidThreshold {
                threshold: 0,
                total: 3
            })
        );
        assert_eq!(
            private_key_to_private_key_shares(&[0u8; 32], 1, 1, &mut rng),
            Err(SigningError::InvalidSecretKey)
        );
    }

    #[test]
    fn test_reconstruct_rejects_bad_input() {
        assert_eq!(
            reconstruct_shared_bls_signature(&[]),
            Err(SigningError::NoShares)
        );

        let signature = sign(&secret(2), b"exit").unwrap();
        assert_eq!(
            reconstruct_shared_bls_signature(&[(1, signature), (1, signature)]),
            Err(SigningError::DuplicateShare(1))
        );
        assert_eq!(
            reconstruct_shared_bls_signature(&[(0, [0xffu8; 96])]),
            Err(SigningError::InvalidSignature(0))
        );
    }
}
