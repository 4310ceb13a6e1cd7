use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeBuilderError>;

#[derive(Debug, Error)]
pub enum TreeBuilderError {
    #[error("Expected non-zero number of leaves")]
    EmptyLeaves,
    #[error("Value index out of bounds: {0}")]
    IndexOutOfBounds(usize),
    #[error("Cannot prove duplicated index: {0}")]
    DuplicatedIndex(usize),
    #[error("Leaf not found: {0}")]
    LeafNotFound(String),
    #[error("Invalid hash: {0}")]
    InvalidHash(String),
    #[error("Invalid multiproof: {0}")]
    InvalidMultiProof(String),
    #[error(transparent)]
    FromHexError(#[from] hex::FromHexError),
}
