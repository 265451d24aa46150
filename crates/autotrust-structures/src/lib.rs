//! AutonomousTrust History Structures
//!
//! The data structures behind the membership ledger:
//!
//! - [`RedBlackTree`]: arena-backed balanced tree keyed by insertion order.
//! - [`MerkleTree`]: hash-linked membership set over [`Blob`]s, shaped by a
//!   red-black tree, producing and auditing inclusion proofs.
//! - [`StepDag`]: named branches of timestamped steps that can be forked,
//!   diffed, merged and ingested from peers.
//!
//! All digests are 32-byte BLAKE3 hashes.

mod error;
mod hash;
pub mod dag;
pub mod merkle;
pub mod redblack;

pub use dag::{now_ms, Source, Step, StepDag, StepId, StepRecord, MAIN};
pub use error::{DagError, MerkleError, TreeError};
pub use hash::{hash, hash_pair, hash_with_nonce, Digest, DIGEST_LEN};
pub use merkle::{fold_proof, Blob, DuplicateSubtree, MerkleTree, ProofStep};
pub use redblack::{NodeId, RedBlackTree, Shape};
