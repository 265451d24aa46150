//! Error types for the history structures.

use thiserror::Error;

/// Red-black tree errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// An explicit key collided with an existing node.
    #[error("duplicate key {0}")]
    DuplicateKey(u64),
}

/// Merkle tree errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    /// Leaf count could not be brought in line with the blob count.
    #[error("leaf count {leaves} does not match blob count {blobs}")]
    Unbalanced { leaves: usize, blobs: usize },
}

/// Step DAG errors. All of these indicate a caller bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("unknown branch: {0}")]
    InvalidBranch(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("cannot ingest an empty step list")]
    EmptyBranch,

    #[error("unknown step: {0}")]
    UnknownStep(uuid::Uuid),
}
