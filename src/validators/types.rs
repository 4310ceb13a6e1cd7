use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use super::signing::ExitSignatureShards;

/// Validator record taken from a deposit data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Position of the record in the deposit data file
    pub deposit_data_index: usize,
    pub public_key: String,
    pub signature: String,
}

/// One raw deposit data entry; extra fields in the file are ignored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositDataEntry {
    pub pubkey: String,
    pub signature: String,
}

/// Proof material for a batch of validators against the deposit data root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorsProof {
    /// Encoded validators in proof order
    pub tx_validators: Vec<Vec<u8>>,
    pub proof: Vec<B256>,
    pub proof_flags: Vec<bool>,
    /// Deposit data indexes in proof order
    pub proof_indexes: Vec<usize>,
}

/// Approval request posted verbatim to every oracle replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub validator_index: u64,
    pub vault_address: Address,
    pub validators_root: B256,
    pub public_keys: Vec<String>,
    pub deposit_signatures: Vec<String>,
    pub public_key_shards: Vec<Vec<String>>,
    pub exit_signature_shards: Vec<Vec<String>>,
    pub proof: Vec<B256>,
    pub proof_flags: Vec<bool>,
    pub proof_indexes: Vec<usize>,
    pub deadline: u64,
}

impl ApprovalRequest {
    /// Request skeleton for `validators`; exit signature shards are attached
    /// per validator with [`ApprovalRequest::push_exit_signature_shards`].
    pub fn new(
        vault_address: Address,
        validators_root: B256,
        validator_index: u64,
        validators: &[Validator],
        proof: ValidatorsProof,
        deadline: u64,
    ) -> Self {
        Self {
            validator_index,
            vault_address,
            validators_root,
            public_keys: validators.iter().map(|v| v.public_key.clone()).collect(),
            deposit_signatures: validators.iter().map(|v| v.signature.clone()).collect(),
            public_key_shards: Vec::new(),
            exit_signature_shards: Vec::new(),
            proof: proof.proof,
            proof_flags: proof.proof_flags,
            proof_indexes: proof.proof_indexes,
            deadline,
        }
    }

    /// Attaches the shards of the next validator, in `public_keys` order
    pub fn push_exit_signature_shards(&mut self, shards: ExitSignatureShards) {
        self.public_key_shards.push(shards.public_keys);
        self.exit_signature_shards.push(shards.exit_signatures);
    }
}
