//! Error types for autotrust-identity.

use autotrust_structures::{DagError, MerkleError};
use thiserror::Error;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Private key material is required but this is a public-only copy.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Signature did not verify.
    #[error("bad signature")]
    BadSignature,

    #[error("encryption failed")]
    Encryption,

    /// Ciphertext failed authentication or was malformed.
    #[error("decryption failed")]
    Decryption,

    /// Key bytes were not a valid key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Wire encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Config file encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history error: {0}")]
    Dag(#[from] DagError),

    #[error("membership tree error: {0}")]
    Merkle(#[from] MerkleError),

    /// A required subsystem was not supplied.
    #[error("unmet dependency: {0}")]
    UnmetDependency(&'static str),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
