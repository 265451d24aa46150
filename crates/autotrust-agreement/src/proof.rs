//! Votes and the peers that cast them.

use autotrust_structures::{hash_with_nonce, Blob, Digest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A provable, transmissible vote over a proposal's hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementProof {
    /// Who voted.
    pub voter: Uuid,
    /// Hash of the proposal (with `nonce` appended, if any).
    pub digest: Digest,
    pub approval: bool,
    pub nonce: Option<Vec<u8>>,
}

impl AgreementProof {
    pub fn new(voter: Uuid, digest: Digest, approval: bool) -> Self {
        Self {
            voter,
            digest,
            approval,
            nonce: None,
        }
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Canonical encoding; this is what voters sign.
    pub fn to_bytes(&self) -> Vec<u8> {
        let nonce = self.nonce.as_deref().unwrap_or_default();
        let mut bytes = Vec::with_capacity(36 + 32 + 1 + nonce.len());
        bytes.extend_from_slice(self.voter.hyphenated().to_string().as_bytes());
        bytes.extend_from_slice(self.digest.as_bytes());
        bytes.push(u8::from(self.approval));
        bytes.extend_from_slice(nonce);
        bytes
    }
}

/// A peer that may take part in agreements.
pub trait AgreementVoter {
    fn uuid(&self) -> Uuid;

    /// Authority rank; higher outranks lower.
    fn rank(&self) -> i64;

    /// Was `proof` signed by this voter?
    fn verify(&self, proof: &AgreementProof, sig: &[u8]) -> bool;
}

/// The parts of a blob the strategies look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub uuid: Uuid,
    pub originator: Uuid,
    pub designation: Vec<u8>,
}

impl Candidate {
    pub fn of<B: Blob>(blob: &B) -> Self {
        Self {
            uuid: blob.uuid(),
            originator: blob.originator(),
            designation: blob.designation(),
        }
    }

    /// `hash(designation ++ nonce)`.
    pub fn digest(&self, nonce: &[u8]) -> Digest {
        hash_with_nonce(&self.designation, nonce)
    }
}

/// A verified vote, as recorded for tallying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub proof: AgreementProof,
    /// Voter rank when the vote was recorded.
    pub rank: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrust_structures::hash;

    #[test]
    fn canonical_bytes_layout() {
        let voter = Uuid::from_u128(7);
        let digest = hash(b"proposal");
        let proof = AgreementProof::new(voter, digest, true).with_nonce(b"42".to_vec());
        let bytes = proof.to_bytes();
        assert_eq!(&bytes[..36], voter.hyphenated().to_string().as_bytes());
        assert_eq!(&bytes[36..68], digest.as_bytes());
        assert_eq!(bytes[68], 1);
        assert_eq!(&bytes[69..], b"42");
    }

    #[test]
    fn approval_changes_bytes() {
        let digest = hash(b"proposal");
        let yea = AgreementProof::new(Uuid::nil(), digest, true);
        let nay = AgreementProof::new(Uuid::nil(), digest, false);
        assert_ne!(yea.to_bytes(), nay.to_bytes());
    }
}
