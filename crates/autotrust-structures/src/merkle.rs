//! Merkle membership tree over immutable blobs.
//!
//! The tree shape comes from a [`RedBlackTree`]: after every mutation the
//! red-black tree is padded or trimmed until it has exactly one leaf per blob,
//! then every digest is recomputed bottom-up. Leaf `i` (left to right) holds
//! blob `i` in insertion order.
//!
//! A node with a single child takes that child's digest unchanged. Unpaired
//! nodes are never re-hashed.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MerkleError;
use crate::hash::{hash, hash_pair, hash_with_nonce, Digest};
use crate::redblack::{NodeId, RedBlackTree};

/// Result type for Merkle operations.
pub type Result<T> = std::result::Result<T, MerkleError>;

/// One level of an inclusion proof: the sibling digest on the left or right,
/// or `(None, None)` for an unpaired node.
pub type ProofStep = (Option<Digest>, Option<Digest>);

/// An object stored as a Merkle leaf.
pub trait Blob: Clone {
    /// Unique id of this blob. Two blobs with the same id are the same member.
    fn uuid(&self) -> Uuid;

    /// Who created this blob.
    fn originator(&self) -> Uuid;

    /// Uniquely identifying bytes; the hash pre-image.
    fn designation(&self) -> Vec<u8>;

    /// `hash(designation ++ nonce)`.
    fn digest(&self, nonce: &[u8]) -> Digest {
        hash_with_nonce(&self.designation(), nonce)
    }
}

/// Root of a subtree whose digest also appears elsewhere in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateSubtree {
    pub key: u64,
    pub digest: Digest,
}

/// Merkle tree keyed by blob insertion order.
#[derive(Debug, Clone)]
pub struct MerkleTree<B> {
    tree: RedBlackTree<Digest>,
    blobs: Vec<B>,
    leaves: Vec<NodeId>,
    super_hash: Option<Digest>,
}

impl<B: Blob> Default for MerkleTree<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Blob> MerkleTree<B> {
    pub fn new() -> Self {
        Self {
            tree: RedBlackTree::new(),
            blobs: Vec::new(),
            leaves: Vec::new(),
            super_hash: None,
        }
    }

    /// Build a tree from blobs in order.
    pub fn from_blobs(blobs: impl IntoIterator<Item = B>) -> Result<Self> {
        let mut tree = Self::new();
        tree.merge(blobs)?;
        Ok(tree)
    }

    pub fn blobs(&self) -> &[B] {
        &self.blobs
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Number of leaves in the backing tree.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Total nodes in the backing tree.
    pub fn node_count(&self) -> usize {
        self.tree.size()
    }

    pub fn contains(&self, blob: &B) -> bool {
        self.position(blob).is_some()
    }

    /// Digest of the root node, `None` while empty.
    pub fn root_digest(&self) -> Option<Digest> {
        self.tree.root().and_then(|root| self.tree.data(root).copied())
    }

    pub fn super_hash(&self) -> Option<Digest> {
        self.super_hash
    }

    /// Audit against a remote or ancestor root instead of the local one.
    pub fn set_super_hash(&mut self, super_hash: Option<Digest>) {
        self.super_hash = super_hash;
    }

    /// Add a blob. No-op if an equal blob is already present.
    pub fn insert(&mut self, blob: B) -> Result<()> {
        if self.contains(&blob) {
            return Ok(());
        }
        self.blobs.push(blob);
        self.rehash()
    }

    /// Remove a blob. No-op if absent.
    pub fn delete(&mut self, blob: &B) -> Result<()> {
        let Some(idx) = self.position(blob) else {
            return Ok(());
        };
        self.blobs.remove(idx);
        self.rehash()
    }

    /// Append every unseen blob, rehashing once. Returns how many were added.
    pub fn merge(&mut self, blobs: impl IntoIterator<Item = B>) -> Result<usize> {
        let mut added = 0;
        for blob in blobs {
            if !self.contains(&blob) {
                self.blobs.push(blob);
                added += 1;
            }
        }
        if added > 0 {
            self.rehash()?;
        }
        Ok(added)
    }

    /// Bring the leaf count in line with the blob count and recompute all
    /// digests.
    pub fn rehash(&mut self) -> Result<()> {
        self.balance_leaves()?;

        let mut leaf_digests = HashMap::with_capacity(self.leaves.len());
        for (leaf, blob) in self.leaves.iter().zip(&self.blobs) {
            leaf_digests.insert(*leaf, hash(&blob.designation()));
        }

        for id in self.tree.post_order() {
            let digest = match leaf_digests.get(&id) {
                Some(digest) => *digest,
                None => {
                    let left = self.tree.left(id).and_then(|l| self.tree.data(l).copied());
                    let right = self.tree.right(id).and_then(|r| self.tree.data(r).copied());
                    match (left, right) {
                        (Some(l), Some(r)) => hash_pair(&l, &r),
                        (Some(only), None) | (None, Some(only)) => only,
                        (None, None) => {
                            return Err(MerkleError::Unbalanced {
                                leaves: self.leaves.len(),
                                blobs: self.blobs.len(),
                            })
                        }
                    }
                }
            };
            if let Some(slot) = self.tree.data_mut(id) {
                *slot = digest;
            }
        }
        debug!(blobs = self.blobs.len(), nodes = self.tree.size(), "rehashed merkle tree");
        Ok(())
    }

    fn balance_leaves(&mut self) -> Result<()> {
        let limit = 2 * (self.blobs.len() + self.tree.size()) + 8;
        for _ in 0..limit {
            let leaves = self.tree.leaves();
            if leaves.len() == self.blobs.len() {
                self.leaves = leaves;
                return Ok(());
            }
            if leaves.len() < self.blobs.len() {
                self.tree.insert(Digest::default());
            } else if let Some(last) = self.tree.last() {
                self.tree.delete(last);
            }
        }
        let leaves = self.tree.leaves().len();
        warn!(leaves, blobs = self.blobs.len(), "merkle leaf count did not converge");
        Err(MerkleError::Unbalanced {
            leaves,
            blobs: self.blobs.len(),
        })
    }

    /// Sibling digests from the blob's leaf up to the root.
    pub fn inclusion_proof(&self, blob: &B) -> Option<Vec<ProofStep>> {
        let idx = self.position(blob)?;
        let mut node = *self.leaves.get(idx)?;
        let mut proof = Vec::new();
        while self.tree.parent(node).is_some() {
            let step = match self.tree.sibling(node) {
                None => (None, None),
                Some(sibling) => {
                    let digest = self.tree.data(sibling).copied();
                    if self.tree.is_left_child(node) {
                        (None, digest)
                    } else {
                        (digest, None)
                    }
                }
            };
            proof.push(step);
            node = self.tree.parent(node)?;
        }
        Some(proof)
    }

    /// Replay `proof` (or the local proof) from the blob's own digest and
    /// compare with the super hash, or the root digest if none is set.
    pub fn audit(&self, blob: &B, proof: Option<&[ProofStep]>) -> bool {
        let local;
        let proof = match proof {
            Some(proof) => proof,
            None => match self.inclusion_proof(blob) {
                Some(p) => {
                    local = p;
                    &local
                }
                None => return false,
            },
        };
        let Some(expected) = self.super_hash.or_else(|| self.root_digest()) else {
            return false;
        };
        match fold_proof(hash(&blob.designation()), proof) {
            Some(digest) => digest == expected,
            None => false,
        }
    }

    /// Audit against an ancestor tree: the local proof is prefixed to
    /// `remote_chain`, whose leaf is this tree's root.
    pub fn audit_chain(&self, blob: &B, remote_chain: &[ProofStep]) -> bool {
        let Some(mut chain) = self.inclusion_proof(blob) else {
            return false;
        };
        chain.extend_from_slice(remote_chain);
        self.audit(blob, Some(&chain))
    }

    /// Whether another tree with `size` blobs and root `root` matches this one.
    pub fn consistent_with(&self, size: usize, root: Option<Digest>) -> bool {
        self.blobs.len() == size && self.root_digest() == root
    }

    /// Roots of distinct subtrees carrying identical digests. Pass-through
    /// nodes (one child) are excluded since they copy their child's digest.
    pub fn subtree_duplications(&self) -> Vec<DuplicateSubtree> {
        let mut seen: HashMap<Digest, Vec<u64>> = HashMap::new();
        for id in self.tree.post_order() {
            let children = usize::from(self.tree.left(id).is_some())
                + usize::from(self.tree.right(id).is_some());
            if children == 1 {
                continue;
            }
            if let Some(digest) = self.tree.data(id) {
                seen.entry(*digest).or_default().push(self.tree.key(id));
            }
        }
        let mut dups: Vec<DuplicateSubtree> = seen
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .flat_map(|(digest, keys)| {
                keys.into_iter().map(move |key| DuplicateSubtree { key, digest })
            })
            .collect();
        dups.sort_by_key(|d| d.key);
        dups
    }

    fn position(&self, blob: &B) -> Option<usize> {
        let uuid = blob.uuid();
        self.blobs.iter().position(|b| b.uuid() == uuid)
    }
}

/// Fold a proof onto a starting digest. `None` if a step names both siblings.
pub fn fold_proof(start: Digest, proof: &[ProofStep]) -> Option<Digest> {
    proof.iter().try_fold(start, |digest, step| match step {
        (None, None) => Some(digest),
        (None, Some(right)) => Some(hash_pair(&digest, right)),
        (Some(left), None) => Some(hash_pair(left, &digest)),
        (Some(_), Some(_)) => None,
    })
}
