//! Agreement by computation: a vote is only valid with a proof of work.

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::proof::{AgreementProof, Ballot, Candidate};
use crate::strategy::{AgreementKind, Strategy};

/// Default leading zero bytes required of a work proof.
pub const DIFFICULTY: usize = 2;

/// Nonces tried between checks of the stop flag.
const STOP_CHECK: u64 = 4096;

/// Proof-of-work strategy.
#[derive(Debug, Clone)]
pub struct ByWork {
    difficulty: usize,
}

impl Default for ByWork {
    fn default() -> Self {
        Self::new(DIFFICULTY)
    }
}

impl ByWork {
    pub fn new(difficulty: usize) -> Self {
        Self { difficulty }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    fn attempt(&self, voter: Uuid, candidate: &Candidate, counter: u64) -> Option<AgreementProof> {
        let nonce = counter.to_string().into_bytes();
        let digest = candidate.digest(&nonce);
        (digest.leading_zero_bytes() >= self.difficulty)
            .then(|| AgreementProof::new(voter, digest, true).with_nonce(nonce))
    }
}

impl Strategy for ByWork {
    fn kind(&self) -> AgreementKind {
        AgreementKind::Work
    }

    /// Search decimal nonces until the digest has enough leading zero bytes.
    /// Expected cost is 256^difficulty hashes.
    fn prove(&self, voter: Uuid, candidate: &Candidate) -> AgreementProof {
        let mut counter: u64 = 0;
        loop {
            if let Some(proof) = self.attempt(voter, candidate, counter) {
                return proof;
            }
            counter = counter.wrapping_add(1);
        }
    }

    fn prove_until(&self, voter: Uuid, candidate: &Candidate, stop: &AtomicBool) -> Option<AgreementProof> {
        let mut counter: u64 = 0;
        loop {
            if counter % STOP_CHECK == 0 && stop.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(proof) = self.attempt(voter, candidate, counter) {
                return Some(proof);
            }
            counter = counter.wrapping_add(1);
        }
    }

    fn pre_verify(&self, candidate: &Candidate, proof: &AgreementProof) -> bool {
        let Some(nonce) = proof.nonce.as_deref() else {
            return false;
        };
        proof.digest.leading_zero_bytes() >= self.difficulty && proof.digest == candidate.digest(nonce)
    }

    /// Approved iff any valid proof was recorded; the approval flag is not
    /// consulted.
    fn tally(&self, _candidate: &Candidate, ballots: &[Ballot]) -> bool {
        !ballots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            uuid: Uuid::new_v4(),
            originator: Uuid::new_v4(),
            designation: b"newcomer".to_vec(),
        }
    }

    #[test]
    fn proof_meets_difficulty() {
        let work = ByWork::new(1);
        let c = candidate();
        let proof = work.prove(Uuid::nil(), &c);
        assert!(proof.digest.leading_zero_bytes() >= 1);
        assert!(work.pre_verify(&c, &proof));
    }

    #[test]
    fn raised_stop_abandons_search() {
        let work = ByWork::new(8);
        let stop = AtomicBool::new(true);
        assert!(work.prove_until(Uuid::nil(), &candidate(), &stop).is_none());

        let easy = ByWork::new(1);
        let c = candidate();
        let proof = easy.prove_until(Uuid::nil(), &c, &AtomicBool::new(false)).unwrap();
        assert!(easy.pre_verify(&c, &proof));
    }

    #[test]
    fn default_difficulty_proof() {
        let work = ByWork::default();
        let c = candidate();
        let proof = work.prove(Uuid::nil(), &c);
        assert!(proof.digest.leading_zero_bytes() >= DIFFICULTY);
        assert!(work.pre_verify(&c, &proof));
    }

    #[test]
    fn missing_nonce_rejected() {
        let work = ByWork::new(1);
        let c = candidate();
        let mut proof = work.prove(Uuid::nil(), &c);
        proof.nonce = None;
        assert!(!work.pre_verify(&c, &proof));
    }

    #[test]
    fn any_nonce_bit_flip_rejected() {
        let work = ByWork::new(1);
        let c = candidate();
        let proof = work.prove(Uuid::nil(), &c);
        let nonce = proof.nonce.clone().unwrap();
        for byte in 0..nonce.len() {
            for bit in 0..8 {
                let mut tampered = proof.clone();
                let mut bytes = nonce.clone();
                bytes[byte] ^= 1 << bit;
                tampered.nonce = Some(bytes);
                assert!(!work.pre_verify(&c, &tampered), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn insufficient_zeros_rejected() {
        let easy = ByWork::new(0);
        let hard = ByWork::new(4);
        let c = candidate();
        let proof = easy.prove(Uuid::nil(), &c);
        // "0" almost never yields four zero bytes
        assert!(proof.digest.leading_zero_bytes() < 4);
        assert!(!hard.pre_verify(&c, &proof));
    }
}
