mod error;
pub mod standard_tree;

// Re-export commonly used types
pub use error::{Result, TreeBuilderError};
pub use standard_tree::{
    hash_from_hex, hash_pair, hash_to_hex, leaf_hash, process_multi_proof, process_proof, Hash,
    LeafValue, MultiProof, StandardMerkleTree, TreeDump,
};
