//! Standard Merkle tree over ABI-encoded leaf tuples.
//!
//! The layout and hashing rules follow the "standard" tree used by Solidity
//! `MerkleProof` verifiers, so a root computed here matches the root computed by
//! any other implementation given the same values and leaf encoding:
//!
//! - leaf hash: `keccak256(keccak256(abi.encode(values...)))`
//! - internal node: `keccak256(min(a, b) ++ max(a, b))`
//! - leaves are sorted by hash and stored at the tail of a flat array, the root
//!   lives at index 0 and the children of node `i` are `2i + 1` and `2i + 2`.

use std::collections::VecDeque;

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::{Result, TreeBuilderError};

pub type Hash = [u8; 32];

/// A tuple that can be committed to as a tree leaf.
pub trait LeafValue: Clone {
    /// Solidity types of the tuple members, e.g. `["bytes", "uint256"]`.
    fn leaf_encoding() -> Vec<String>;

    /// `abi.encode` of the tuple members (parameter encoding, no outer offset).
    fn abi_encode_leaf(&self) -> Vec<u8>;

    /// Human readable members, as written to a tree dump.
    fn dump_members(&self) -> Vec<String>;
}

impl LeafValue for (Bytes, U256) {
    fn leaf_encoding() -> Vec<String> {
        vec!["bytes".to_string(), "uint256".to_string()]
    }

    fn abi_encode_leaf(&self) -> Vec<u8> {
        self.abi_encode_params()
    }

    fn dump_members(&self) -> Vec<String> {
        vec![self.0.to_string(), self.1.to_string()]
    }
}

fn keccak(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a leaf value (double keccak to rule out second preimage attacks)
pub fn leaf_hash<V: LeafValue>(value: &V) -> Hash {
    keccak(&keccak(&value.abi_encode_leaf()))
}

/// Hash two nodes together, smaller one first
pub fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    if a <= b {
        hasher.update(a);
        hasher.update(b);
    } else {
        hasher.update(b);
        hasher.update(a);
    }
    hasher.finalize().into()
}

/// Recompute the root from a leaf and its sibling path
pub fn process_proof(leaf: Hash, proof: &[Hash]) -> Hash {
    proof
        .iter()
        .fold(leaf, |current, sibling| hash_pair(&current, sibling))
}

/// Recompute the root from a set of leaves, proof nodes and proof flags
pub fn process_multi_proof(leaves: &[Hash], proof: &[Hash], proof_flags: &[bool]) -> Result<Hash> {
    if proof.len() < proof_flags.iter().filter(|flag| !**flag).count() {
        return Err(TreeBuilderError::InvalidMultiProof(
            "not enough proof nodes for the given flags".to_string(),
        ));
    }
    if leaves.len() + proof.len() != proof_flags.len() + 1 {
        return Err(TreeBuilderError::InvalidMultiProof(
            "provided leaves and proof do not match flags".to_string(),
        ));
    }

    let mut stack: VecDeque<Hash> = leaves.iter().copied().collect();
    let mut proof: VecDeque<Hash> = proof.iter().copied().collect();

    for &flag in proof_flags {
        let a = stack
            .pop_front()
            .ok_or_else(|| TreeBuilderError::InvalidMultiProof("stack exhausted".to_string()))?;
        let b = if flag {
            stack.pop_front()
        } else {
            proof.pop_front()
        }
        .ok_or_else(|| TreeBuilderError::InvalidMultiProof("stack exhausted".to_string()))?;
        stack.push_back(hash_pair(&a, &b));
    }

    stack
        .pop_back()
        .or_else(|| proof.pop_front())
        .ok_or_else(|| TreeBuilderError::InvalidMultiProof("no root produced".to_string()))
}

/// Convert 32-byte hash to 0x-prefixed hex
pub fn hash_to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Parse a 0x-prefixed (or bare) hex string into a 32-byte hash
pub fn hash_from_hex(hex_str: &str) -> Result<Hash> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| {
            TreeBuilderError::InvalidHash(format!("expected 32 bytes, got {}", bytes.len()))
        })
}

fn sibling_index(i: usize) -> usize {
    if i % 2 == 1 {
        i + 1
    } else {
        i - 1
    }
}

fn parent_index(i: usize) -> usize {
    (i - 1) / 2
}

/// Multiproof over a subset of the tree values
#[derive(Debug, Clone, PartialEq)]
pub struct MultiProof<V> {
    /// Proven values, ordered by descending tree index
    pub leaves: Vec<V>,
    /// Value indexes (input positions) of `leaves`
    pub value_indices: Vec<usize>,
    pub proof: Vec<Hash>,
    pub proof_flags: Vec<bool>,
}

/// Serializable snapshot of a tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDump {
    pub format: String,
    pub tree: Vec<String>,
    pub values: Vec<DumpValue>,
    pub leaf_encoding: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpValue {
    pub value: Vec<String>,
    pub tree_index: usize,
}

#[derive(Debug, Clone)]
struct TreeValue<V> {
    value: V,
    tree_index: usize,
}

/// Standard Merkle tree built once from a fixed set of values
#[derive(Debug, Clone)]
pub struct StandardMerkleTree<V> {
    tree: Vec<Hash>,
    values: Vec<TreeValue<V>>,
}

impl<V: LeafValue> StandardMerkleTree<V> {
    /// Builds the tree; values keep their input position as value index
    pub fn of(values: Vec<V>) -> Result<Self> {
        if values.is_empty() {
            return Err(TreeBuilderError::EmptyLeaves);
        }

        let mut hashed: Vec<(Hash, usize)> = values
            .iter()
            .enumerate()
            .map(|(value_index, value)| (leaf_hash(value), value_index))
            .collect();
        hashed.sort();

        let tree_len = 2 * hashed.len() - 1;
        let mut tree = vec![[0u8; 32]; tree_len];
        let mut tree_indices = vec![0usize; values.len()];

        for (leaf_index, (hash, value_index)) in hashed.iter().enumerate() {
            let tree_index = tree_len - 1 - leaf_index;
            tree[tree_index] = *hash;
            tree_indices[*value_index] = tree_index;
        }

        for i in (0..tree_len - hashed.len()).rev() {
            tree[i] = hash_pair(&tree[2 * i + 1], &tree[2 * i + 2]);
        }

        let values = values
            .into_iter()
            .zip(tree_indices)
            .map(|(value, tree_index)| TreeValue { value, tree_index })
            .collect();

        Ok(Self { tree, values })
    }

    pub fn root(&self) -> Hash {
        self.tree[0]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values with their input position
    pub fn entries(&self) -> impl Iterator<Item = (usize, &V)> {
        self.values.iter().enumerate().map(|(i, v)| (i, &v.value))
    }

    fn tree_index(&self, value_index: usize) -> Result<usize> {
        self.values
            .get(value_index)
            .map(|v| v.tree_index)
            .ok_or(TreeBuilderError::IndexOutOfBounds(value_index))
    }

    fn value_index_for_tree_index(&self, tree_index: usize) -> Option<usize> {
        self.values.iter().position(|v| v.tree_index == tree_index)
    }

    /// Sibling path for the value at `value_index`
    pub fn get_proof(&self, value_index: usize) -> Result<Vec<Hash>> {
        let mut i = self.tree_index(value_index)?;
        let mut proof = Vec::new();
        while i > 0 {
            proof.push(self.tree[sibling_index(i)]);
            i = parent_index(i);
        }
        Ok(proof)
    }

    /// Multiproof for the values at the given input positions
    pub fn get_multi_proof(&self, value_indices: &[usize]) -> Result<MultiProof<V>> {
        let mut indices = value_indices
            .iter()
            .map(|&i| self.tree_index(i))
            .collect::<Result<Vec<_>>>()?;
        indices.sort_unstable_by(|a, b| b.cmp(a));

        if let Some(dup) = indices.windows(2).find(|w| w[0] == w[1]) {
            let value_index = self.value_index_for_tree_index(dup[0]).unwrap_or(dup[0]);
            return Err(TreeBuilderError::DuplicatedIndex(value_index));
        }

        let mut stack: VecDeque<usize> = indices.iter().copied().collect();
        let mut proof = Vec::new();
        let mut proof_flags = Vec::new();

        while let Some(&j) = stack.front() {
            if j == 0 {
                break;
            }
            stack.pop_front();
            let s = sibling_index(j);
            let p = parent_index(j);
            if stack.front() == Some(&s) {
                proof_flags.push(true);
                stack.pop_front();
            } else {
                proof_flags.push(false);
                proof.push(self.tree[s]);
            }
            stack.push_back(p);
        }

        if indices.is_empty() {
            proof.push(self.tree[0]);
        }

        let mut leaves = Vec::with_capacity(indices.len());
        let mut proven_indices = Vec::with_capacity(indices.len());
        for tree_index in indices {
            let value_index = self
                .value_index_for_tree_index(tree_index)
                .ok_or_else(|| TreeBuilderError::LeafNotFound(tree_index.to_string()))?;
            leaves.push(self.values[value_index].value.clone());
            proven_indices.push(value_index);
        }

        Ok(MultiProof {
            leaves,
            value_indices: proven_indices,
            proof,
            proof_flags,
        })
    }

    /// Checks a single-leaf proof against this tree's root
    pub fn verify(&self, value: &V, proof: &[Hash]) -> bool {
        process_proof(leaf_hash(value), proof) == self.root()
    }

    /// Checks a multiproof against this tree's root
    pub fn verify_multi_proof(&self, multi_proof: &MultiProof<V>) -> Result<bool> {
        let leaves: Vec<Hash> = multi_proof.leaves.iter().map(leaf_hash).collect();
        let root = process_multi_proof(&leaves, &multi_proof.proof, &multi_proof.proof_flags)?;
        Ok(root == self.root())
    }

    pub fn dump(&self) -> TreeDump {
        TreeDump {
            format: "standard-v1".to_string(),
            tree: self.tree.iter().map(hash_to_hex).collect(),
            values: self
                .values
                .iter()
                .map(|v| DumpValue {
                    value: v.value.dump_members(),
                    tree_index: v.tree_index,
                })
                .collect(),
            leaf_encoding: V::leaf_encoding(),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::*;

    fn leaf(byte: u8, index: u64) -> (Bytes, U256) {
        (Bytes::from(vec![byte; 176]), U256::from(index))
    }

    fn sample(count: u64) -> Vec<(Bytes, U256)> {
        (0..count).map(|i| leaf(i as u8 + 1, i)).collect()
    }

    #[test]
    fn test_leaf_encoding_is_parameter_encoding() {
        let value = (Bytes::from(vec![0xab]), U256::from(7));
        let encoded = value.abi_encode_leaf();

        // offset, uint256, length, one padded data word
        assert_eq!(encoded.len(), 128);
        assert_eq!(encoded[31], 0x40);
        assert_eq!(encoded[63], 7);
        assert_eq!(encoded[95], 1);
        assert_eq!(encoded[96], 0xab);
    }

    #[test]
    fn test_two_leaf_root() -> Result<()> {
        let values = sample(2);
        let tree = StandardMerkleTree::of(values.clone())?;

        let expected = hash_pair(&leaf_hash(&values[0]), &leaf_hash(&values[1]));
        assert_eq!(tree.root(), expected);
        Ok(())
    }

    #[test]
    fn test_single_leaf_tree() -> Result<()> {
        let values = sample(1);
        let tree = StandardMerkleTree::of(values.clone())?;

        assert_eq!(tree.root(), leaf_hash(&values[0]));
        assert!(tree.get_proof(0)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_leaves_error() {
        let result = StandardMerkleTree::<(Bytes, U256)>::of(vec![]);
        assert!(matches!(result, Err(TreeBuilderError::EmptyLeaves)));
    }

    #[test]
    fn test_every_proof_verifies() -> Result<()> {
        for count in 1..=9 {
            let values = sample(count);
            let tree = StandardMerkleTree::of(values.clone())?;
            for (i, value) in values.iter().enumerate() {
                let proof = tree.get_proof(i)?;
                assert!(tree.verify(value, &proof), "leaf {} of {} should verify", i, count);
            }
        }
        Ok(())
    }

    #[test]
    fn test_proof_rejects_foreign_leaf() -> Result<()> {
        let tree = StandardMerkleTree::of(sample(4))?;
        let proof = tree.get_proof(0)?;
        assert!(!tree.verify(&leaf(0xee, 0), &proof));
        Ok(())
    }

    #[test]
    fn test_root_independent_of_input_order() -> Result<()> {
        let values = sample(5);
        let mut reversed = values.clone();
        reversed.reverse();

        let a = StandardMerkleTree::of(values)?;
        let b = StandardMerkleTree::of(reversed)?;
        assert_eq!(a.root(), b.root());
        Ok(())
    }

    #[test]
    fn test_multi_proof_verifies() -> Result<()> {
        let values = sample(7);
        let tree = StandardMerkleTree::of(values)?;

        for subset in [vec![0], vec![1, 4], vec![6, 2, 3], vec![0, 1, 2, 3, 4, 5, 6]] {
            let multi_proof = tree.get_multi_proof(&subset)?;
            assert_eq!(multi_proof.leaves.len(), subset.len());
            assert!(tree.verify_multi_proof(&multi_proof)?);
        }
        Ok(())
    }

    #[test]
    fn test_multi_proof_of_single_leaf_tree() -> Result<()> {
        let tree = StandardMerkleTree::of(sample(1))?;
        let multi_proof = tree.get_multi_proof(&[0])?;

        assert!(multi_proof.proof.is_empty());
        assert!(multi_proof.proof_flags.is_empty());
        assert!(tree.verify_multi_proof(&multi_proof)?);
        Ok(())
    }

    #[test]
    fn test_multi_proof_duplicated_index() -> Result<()> {
        let tree = StandardMerkleTree::of(sample(3))?;
        let result = tree.get_multi_proof(&[1, 1]);
        assert!(matches!(result, Err(TreeBuilderError::DuplicatedIndex(1))));
        Ok(())
    }

    #[test]
    fn test_proof_index_out_of_bounds() -> Result<()> {
        let tree = StandardMerkleTree::of(sample(3))?;
        assert!(matches!(tree.get_proof(3), Err(TreeBuilderError::IndexOutOfBounds(3))));
        Ok(())
    }

    #[test]
    fn test_dump_layout() -> Result<()> {
        let tree = StandardMerkleTree::of(sample(3))?;
        let dump = tree.dump();

        assert_eq!(dump.format, "standard-v1");
        assert_eq!(dump.tree.len(), 5);
        assert_eq!(dump.tree[0], hash_to_hex(&tree.root()));
        assert_eq!(dump.leaf_encoding, vec!["bytes", "uint256"]);
        assert_eq!(dump.values[2].value[1], "2");

        let json = serde_json::to_value(&dump).expect("dump serializes");
        assert!(json.get("leafEncoding").is_some());
        assert!(json["values"][0].get("treeIndex").is_some());
        Ok(())
    }

    #[test]
    fn test_hash_hex_roundtrip() -> Result<()> {
        let hash = [0x11u8; 32];
        assert_eq!(hash_from_hex(&hash_to_hex(&hash))?, hash);
        assert!(hash_from_hex("0x1234").is_err());
        Ok(())
    }

    impl LeafValue for (Address, U256) {
        fn leaf_encoding() -> Vec<String> {
            vec!["address".to_string(), "uint256".to_string()]
        }

        fn abi_encode_leaf(&self) -> Vec<u8> {
            self.abi_encode_params()
        }

        fn dump_members(&self) -> Vec<String> {
            vec![self.0.to_string(), self.1.to_string()]
        }
    }

    #[test]
    fn test_matches_openzeppelin_reference_root() -> Result<()> {
        let values = vec![
            (Address::repeat_byte(0x11), U256::from(5_000_000_000_000_000_000u128)),
            (Address::repeat_byte(0x22), U256::from(2_500_000_000_000_000_000u128)),
        ];
        let tree = StandardMerkleTree::of(values.clone())?;

        assert_eq!(
            hash_to_hex(&tree.root()),
            "0xd4dee0beab2d53f2cc83e567171bd2820e49898130a22622b10ead383e90bd77"
        );
        for (index, value) in values.iter().enumerate() {
            assert!(tree.verify(value, &tree.get_proof(index)?));
        }
        Ok(())
    }
}
