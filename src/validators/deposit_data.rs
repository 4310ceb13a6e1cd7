//! Deposit data loading and the validators commitment tree.
//!
//! Every deposit data entry becomes a `(bytes, uint256)` leaf: the encoded
//! validator (public key, signature and deposit data root) and its position in
//! the file. Oracles rebuild the same tree independently, so the encoding has
//! to stay byte-exact.

use std::path::{Path, PathBuf};

use alloy_primitives::{Address, Bytes, B256, U256};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use tree_builder::{StandardMerkleTree, TreeBuilderError, TreeDump};

use super::types::{DepositDataEntry, Validator, ValidatorsProof};

pub const PUBLIC_KEY_LENGTH: usize = 48;
pub const SIGNATURE_LENGTH: usize = 96;

/// Leaf of the validators tree: encoded validator and deposit data index
pub type ValidatorLeaf = (Bytes, U256);

#[derive(Debug, Error)]
pub enum DepositDataError {
    #[error("Failed to read deposit data file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Deposit data is not a JSON array: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid deposit data entry {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("Validator {0} is not part of the deposit data")]
    UnknownValidator(String),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeBuilderError),
}

/// Validators from one deposit data file and the tree committing to them
#[derive(Debug, Clone)]
pub struct DepositData {
    validators: Vec<Validator>,
    tree: StandardMerkleTree<ValidatorLeaf>,
    withdrawal_credentials: [u8; 32],
    deposit_amount_gwei: u64,
}

impl DepositData {
    /// Loads and verifies the deposit data file
    pub fn load(
        vault: Address,
        deposit_data_file: &Path,
        deposit_amount_gwei: u64,
    ) -> Result<Self, DepositDataError> {
        info!("Loading deposit data from {}...", deposit_data_file.display());
        let contents =
            std::fs::read_to_string(deposit_data_file).map_err(|source| DepositDataError::Io {
                path: deposit_data_file.to_path_buf(),
                source,
            })?;

        let entries = parse_deposit_data(&contents)?;
        let deposit_data = Self::from_entries(vault, &entries, deposit_amount_gwei)?;
        info!(
            "Loaded deposit data with {} validators, root {}",
            deposit_data.validators.len(),
            deposit_data.root()
        );
        Ok(deposit_data)
    }

    pub fn from_entries(
        vault: Address,
        entries: &[DepositDataEntry],
        deposit_amount_gwei: u64,
    ) -> Result<Self, DepositDataError> {
        let (tree, validators) = generate_validators_tree(vault, entries, deposit_amount_gwei)?;
        Ok(Self {
            validators,
            tree,
            withdrawal_credentials: withdrawal_credentials(vault),
            deposit_amount_gwei,
        })
    }

    pub fn root(&self) -> B256 {
        B256::from(self.tree.root())
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn tree(&self) -> &StandardMerkleTree<ValidatorLeaf> {
        &self.tree
    }

    pub fn dump(&self) -> TreeDump {
        self.tree.dump()
    }

    /// Sibling path for a single validator
    pub fn validator_proof(&self, validator: &Validator) -> Result<Vec<B256>, DepositDataError> {
        self.ensure_known(validator)?;
        Ok(self
            .tree
            .get_proof(validator.deposit_data_index)?
            .into_iter()
            .map(B256::from)
            .collect())
    }

    /// Multiproof for a batch of validators, as embedded in approval requests
    pub fn validators_proof(
        &self,
        validators: &[Validator],
    ) -> Result<ValidatorsProof, DepositDataError> {
        for validator in validators {
            self.ensure_known(validator)?;
        }
        let indices: Vec<usize> = validators.iter().map(|v| v.deposit_data_index).collect();
        let multi_proof = self.tree.get_multi_proof(&indices)?;
        debug!(
            validators = validators.len(),
            proof_nodes = multi_proof.proof.len(),
            "built validators multiproof"
        );

        Ok(ValidatorsProof {
            tx_validators: multi_proof
                .leaves
                .iter()
                .map(|(encoded, _)| encoded.to_vec())
                .collect(),
            proof: multi_proof.proof.into_iter().map(B256::from).collect(),
            proof_flags: multi_proof.proof_flags,
            proof_indexes: multi_proof.value_indices,
        })
    }

    /// Recomputes the root from a validators proof
    pub fn verify_validators_proof(
        &self,
        proof: &ValidatorsProof,
    ) -> Result<bool, DepositDataError> {
        let leaves: Vec<[u8; 32]> = proof
            .tx_validators
            .iter()
            .zip(&proof.proof_indexes)
            .map(|(encoded, index)| {
                tree_builder::leaf_hash(&(Bytes::from(encoded.clone()), U256::from(*index)))
            })
            .collect();
        let nodes: Vec<[u8; 32]> = proof.proof.iter().map(|node| node.0).collect();
        let root = tree_builder::process_multi_proof(&leaves, &nodes, &proof.proof_flags)?;
        Ok(root == self.tree.root())
    }

    /// Encoded form of a validator as stored in its tree leaf
    pub fn encode_validator(&self, validator: &Validator) -> Result<Vec<u8>, DepositDataError> {
        encode_tx_validator(
            &self.withdrawal_credentials,
            validator,
            self.deposit_amount_gwei,
        )
    }

    fn ensure_known(&self, validator: &Validator) -> Result<(), DepositDataError> {
        match self.validators.get(validator.deposit_data_index) {
            Some(known) if known == validator => Ok(()),
            _ => Err(DepositDataError::UnknownValidator(
                validator.public_key.clone(),
            )),
        }
    }
}

/// Parses a deposit data JSON array, reporting the first malformed entry
pub fn parse_deposit_data(contents: &str) -> Result<Vec<DepositDataEntry>, DepositDataError> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(contents)?;
    raw.into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value).map_err(|e| DepositDataError::InvalidEntry {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Builds the validators tree. Validator `i` is the `i`-th entry.
pub fn generate_validators_tree(
    vault: Address,
    deposit_data: &[DepositDataEntry],
    deposit_amount_gwei: u64,
) -> Result<(StandardMerkleTree<ValidatorLeaf>, Vec<Validator>), DepositDataError> {
    let credentials = withdrawal_credentials(vault);
    let mut leaves: Vec<ValidatorLeaf> = Vec::with_capacity(deposit_data.len());
    let mut validators = Vec::with_capacity(deposit_data.len());

    for (i, data) in deposit_data.iter().enumerate() {
        let validator = Validator {
            deposit_data_index: i,
            public_key: add_0x_prefix(&data.pubkey),
            signature: add_0x_prefix(&data.signature),
        };
        let encoded = encode_tx_validator(&credentials, &validator, deposit_amount_gwei)?;
        leaves.push((Bytes::from(encoded), U256::from(i)));
        validators.push(validator);
    }

    let tree = StandardMerkleTree::of(leaves)?;
    Ok((tree, validators))
}

/// 0x01 credentials pointing at the vault
pub fn withdrawal_credentials(vault: Address) -> [u8; 32] {
    let mut credentials = [0u8; 32];
    credentials[0] = 0x01;
    credentials[12..].copy_from_slice(vault.as_slice());
    credentials
}

/// `public_key ++ signature ++ deposit_data_root`
pub fn encode_tx_validator(
    withdrawal_credentials: &[u8; 32],
    validator: &Validator,
    deposit_amount_gwei: u64,
) -> Result<Vec<u8>, DepositDataError> {
    let index = validator.deposit_data_index;
    let public_key: [u8; PUBLIC_KEY_LENGTH] =
        decode_fixed(&validator.public_key, index, "pubkey")?;
    let signature: [u8; SIGNATURE_LENGTH] = decode_fixed(&validator.signature, index, "signature")?;

    let root = deposit_data_root(
        &public_key,
        withdrawal_credentials,
        deposit_amount_gwei,
        &signature,
    );

    let mut encoded = Vec::with_capacity(PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH + 32);
    encoded.extend_from_slice(&public_key);
    encoded.extend_from_slice(&signature);
    encoded.extend_from_slice(&root);
    Ok(encoded)
}

/// SSZ `hash_tree_root` of a beacon chain `DepositData` container
pub fn deposit_data_root(
    public_key: &[u8; PUBLIC_KEY_LENGTH],
    withdrawal_credentials: &[u8; 32],
    amount_gwei: u64,
    signature: &[u8; SIGNATURE_LENGTH],
) -> [u8; 32] {
    let zero = [0u8; 32];

    let public_key_root = sha256_pair(&chunk(&public_key[..32]), &chunk(&public_key[32..]));
    let signature_root = sha256_pair(
        &sha256_pair(&chunk(&signature[..32]), &chunk(&signature[32..64])),
        &sha256_pair(&chunk(&signature[64..]), &zero),
    );
    let amount = chunk(&amount_gwei.to_le_bytes());

    sha256_pair(
        &sha256_pair(&public_key_root, withdrawal_credentials),
        &sha256_pair(&amount, &signature_root),
    )
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

pub fn add_0x_prefix(value: &str) -> String {
    if value.starts_with("0x") || value.starts_with("0X") {
        value.to_string()
    } else {
        format!("0x{}", value)
    }
}

fn decode_fixed<const N: usize>(
    value: &str,
    index: usize,
    field: &str,
) -> Result<[u8; N], DepositDataError> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(stripped).map_err(|e| DepositDataError::InvalidEntry {
        index,
        reason: format!("{} is not valid hex: {}", field, e),
    })?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| DepositDataError::InvalidEntry {
            index,
            reason: format!("{} must be {} bytes, got {}", field, N, len),
        })
}
