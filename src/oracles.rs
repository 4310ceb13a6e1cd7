//! Oracle set description, single-oracle approvals and their combination into
//! the threshold-signed artifact consumed by registration transactions.

use std::collections::HashMap;

use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OraclesError {
    #[error("Oracles addresses and endpoints differ in length: {addresses} != {endpoints}")]
    LengthMismatch { addresses: usize, endpoints: usize },

    #[error("Oracle {0} has no endpoints")]
    NoEndpoints(Address),

    #[error("Invalid endpoint {endpoint} for oracle {address}: {reason}")]
    InvalidEndpoint {
        address: Address,
        endpoint: String,
        reason: String,
    },
}

/// Fewer distinct approvals than the oracle set requires.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Not enough oracle approvals: received {num_votes}, threshold is {threshold}")]
pub struct NotEnoughOracleApprovals {
    pub num_votes: usize,
    pub threshold: usize,
}

/// Oracle set for one approval round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oracles {
    pub addresses: Vec<Address>,
    /// Replica URLs, index-aligned with `addresses`
    pub endpoints: Vec<Vec<String>>,
    pub validators_threshold: usize,
}

impl Oracles {
    pub fn new(
        addresses: Vec<Address>,
        endpoints: Vec<Vec<String>>,
        validators_threshold: usize,
    ) -> Result<Self, OraclesError> {
        let oracles = Self {
            addresses,
            endpoints,
            validators_threshold,
        };
        oracles.validate()?;
        Ok(oracles)
    }

    /// Checks shape invariants; used after deserializing an oracle set
    pub fn validate(&self) -> Result<(), OraclesError> {
        if self.addresses.len() != self.endpoints.len() {
            return Err(OraclesError::LengthMismatch {
                addresses: self.addresses.len(),
                endpoints: self.endpoints.len(),
            });
        }
        for (address, replicas) in self.iter() {
            if replicas.is_empty() {
                return Err(OraclesError::NoEndpoints(*address));
            }
            for endpoint in replicas {
                url::Url::parse(endpoint).map_err(|e| OraclesError::InvalidEndpoint {
                    address: *address,
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Oracles in address order paired with their replicas
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Vec<String>)> {
        self.addresses.iter().zip(self.endpoints.iter())
    }
}

/// One oracle's signed attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleApproval {
    pub ipfs_hash: String,
    pub signature: Bytes,
    pub deadline: u64,
}

/// Threshold-satisfying combination of oracle approvals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclesApproval {
    pub ipfs_hash: String,
    pub signatures: Bytes,
    pub deadline: u64,
}

/// Turns the collected approvals into the artifact a registration transaction
/// carries. Approvals arrive in oracle-address order.
pub trait ApprovalCombiner: Send + Sync {
    fn combine(
        &self,
        approvals: &[(Address, OracleApproval)],
        threshold: usize,
    ) -> Result<OraclesApproval, NotEnoughOracleApprovals>;
}

/// Picks the `(ipfs_hash, deadline)` pair most oracles agreed on and
/// concatenates `threshold` signatures ordered by oracle address.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityCombiner;

impl ApprovalCombiner for MajorityCombiner {
    fn combine(
        &self,
        approvals: &[(Address, OracleApproval)],
        threshold: usize,
    ) -> Result<OraclesApproval, NotEnoughOracleApprovals> {
        let mut order: Vec<(&str, u64)> = Vec::new();
        let mut candidates: HashMap<(&str, u64), Vec<(Address, &Bytes)>> = HashMap::new();

        for (address, approval) in approvals {
            let key = (approval.ipfs_hash.as_str(), approval.deadline);
            let votes = candidates.entry(key).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            votes.push((*address, &approval.signature));
        }

        // first candidate wins ties
        let mut winner: Option<(&str, u64)> = None;
        let mut winner_votes = 0;
        for key in order {
            let votes = candidates.get(&key).map_or(0, Vec::len);
            if votes > winner_votes {
                winner = Some(key);
                winner_votes = votes;
            }
        }

        let Some((ipfs_hash, deadline)) = winner else {
            return Err(NotEnoughOracleApprovals {
                num_votes: 0,
                threshold,
            });
        };

        let mut votes = candidates.remove(&(ipfs_hash, deadline)).unwrap_or_default();
        if votes.len() < threshold {
            return Err(NotEnoughOracleApprovals {
                num_votes: votes.len(),
                threshold,
            });
        }

        votes.sort_by_key(|(address, _)| *address);
        let signatures: Vec<u8> = votes
            .iter()
            .take(threshold)
            .flat_map(|(_, signature)| signature.iter().copied())
            .collect();

        Ok(OraclesApproval {
            ipfs_hash: ipfs_hash.to_string(),
            signatures: Bytes::from(signatures),
            deadline,
        })
    }
}
