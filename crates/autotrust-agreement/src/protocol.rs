//! The generic prove/verify/finalize contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use autotrust_structures::Blob;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proof::{AgreementProof, AgreementVoter, Ballot, Candidate};
use crate::strategy::{AgreementKind, Strategy};

/// Collects votes on candidate blobs and decides on them through a strategy.
#[derive(Debug)]
pub struct AgreementProtocol<V> {
    myself: Uuid,
    voters: BTreeMap<Uuid, V>,
    votes: HashMap<Uuid, Vec<Ballot>>,
    strategy: Arc<dyn Strategy>,
}

/// Detached handle for producing local votes away from the protocol, e.g.
/// on a blocking thread when proofs are expensive.
#[derive(Debug, Clone)]
pub struct Prover {
    myself: Uuid,
    strategy: Arc<dyn Strategy>,
}

impl Prover {
    pub fn prove(&self, candidate: &Candidate) -> AgreementProof {
        self.strategy.prove(self.myself, candidate)
    }

    /// Give up with `None` once `stop` is raised.
    pub fn prove_until(&self, candidate: &Candidate, stop: &AtomicBool) -> Option<AgreementProof> {
        self.strategy.prove_until(self.myself, candidate, stop)
    }
}

impl<V: AgreementVoter> AgreementProtocol<V> {
    pub fn new(myself: Uuid, strategy: Box<dyn Strategy>) -> Self {
        Self {
            myself,
            voters: BTreeMap::new(),
            votes: HashMap::new(),
            strategy: Arc::from(strategy),
        }
    }

    pub fn myself(&self) -> Uuid {
        self.myself
    }

    pub fn kind(&self) -> AgreementKind {
        self.strategy.kind()
    }

    /// Register (or replace) a voter.
    pub fn add_voter(&mut self, voter: V) {
        self.voters.insert(voter.uuid(), voter);
    }

    pub fn remove_voter(&mut self, uuid: &Uuid) -> Option<V> {
        self.voters.remove(uuid)
    }

    pub fn voter(&self, uuid: &Uuid) -> Option<&V> {
        self.voters.get(uuid)
    }

    pub fn voters(&self) -> impl Iterator<Item = &V> {
        self.voters.values()
    }

    /// Votes recorded so far for a blob.
    pub fn pending_votes(&self, blob: &Uuid) -> usize {
        self.votes.get(blob).map_or(0, Vec::len)
    }

    /// The local vote on `blob`.
    pub fn prove<B: Blob>(&self, blob: &B) -> AgreementProof {
        self.strategy.prove(self.myself, &Candidate::of(blob))
    }

    pub fn prover(&self) -> Prover {
        Prover {
            myself: self.myself,
            strategy: Arc::clone(&self.strategy),
        }
    }

    /// Check a vote and record it. Rejected votes are logged and not counted.
    /// A later vote from the same voter replaces the earlier one.
    pub fn verify<B: Blob>(&mut self, blob: &B, proof: &AgreementProof, sig: &[u8]) -> bool {
        let candidate = Candidate::of(blob);
        let Some(voter) = self.voters.get(&proof.voter) else {
            warn!(voter = %proof.voter, candidate = %candidate.uuid, "vote from unknown voter");
            return false;
        };
        if !voter.verify(proof, sig) {
            warn!(voter = %proof.voter, candidate = %candidate.uuid, "bad vote signature");
            return false;
        }
        let nonce = proof.nonce.as_deref().unwrap_or_default();
        if proof.digest != candidate.digest(nonce) {
            warn!(voter = %proof.voter, candidate = %candidate.uuid, "vote digest mismatch");
            return false;
        }
        if !self.strategy.pre_verify(&candidate, proof) {
            warn!(voter = %proof.voter, candidate = %candidate.uuid, "vote failed proof check");
            return false;
        }

        let ballot = Ballot {
            proof: proof.clone(),
            rank: voter.rank(),
        };
        let bucket = self.votes.entry(candidate.uuid).or_default();
        bucket.retain(|b| b.proof.voter != proof.voter);
        bucket.push(ballot);
        debug!(voter = %proof.voter, candidate = %candidate.uuid, approval = proof.approval, "recorded vote");
        true
    }

    /// Decide on `blob` and clear its votes. A blob originated by the local
    /// node is approved outright.
    pub fn finalize<B: Blob>(&mut self, blob: &B) -> bool {
        let ballots = self.votes.remove(&blob.uuid()).unwrap_or_default();
        if blob.originator() == self.myself {
            return true;
        }
        let decision = self.strategy.tally(&Candidate::of(blob), &ballots);
        debug!(candidate = %blob.uuid(), votes = ballots.len(), decision, "finalized");
        decision
    }

    /// Forget any votes for a blob without deciding.
    pub fn discard(&mut self, blob: &Uuid) {
        self.votes.remove(blob);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::ByAuthority;
    use crate::stake::ByStake;
    use crate::work::ByWork;
    use autotrust_structures::{hash, Digest};

    #[derive(Debug, Clone)]
    struct Voter {
        id: Uuid,
        rank: i64,
    }

    impl Voter {
        fn new(rank: i64) -> Self {
            Self {
                id: Uuid::new_v4(),
                rank,
            }
        }

        // keyed hash standing in for a real signature
        fn sign(&self, proof: &AgreementProof) -> Vec<u8> {
            let mut bytes = self.id.as_bytes().to_vec();
            bytes.extend(proof.to_bytes());
            hash(&bytes).0.to_vec()
        }
    }

    impl AgreementVoter for Voter {
        fn uuid(&self) -> Uuid {
            self.id
        }

        fn rank(&self) -> i64 {
            self.rank
        }

        fn verify(&self, proof: &AgreementProof, sig: &[u8]) -> bool {
            self.sign(proof) == sig
        }
    }

    #[derive(Debug, Clone)]
    struct Obj {
        id: Uuid,
        originator: Uuid,
    }

    impl Blob for Obj {
        fn uuid(&self) -> Uuid {
            self.id
        }

        fn originator(&self) -> Uuid {
            self.originator
        }

        fn designation(&self) -> Vec<u8> {
            let mut bytes = self.originator.as_bytes().to_vec();
            bytes.extend_from_slice(self.id.as_bytes());
            bytes
        }
    }

    fn obj() -> Obj {
        Obj {
            id: Uuid::new_v4(),
            originator: Uuid::new_v4(),
        }
    }

    fn vote(voter: &Voter, blob: &Obj, approval: bool) -> (AgreementProof, Vec<u8>) {
        let proof = AgreementProof::new(voter.id, Candidate::of(blob).digest(&[]), approval);
        let sig = voter.sign(&proof);
        (proof, sig)
    }

    fn protocol(strategy: Box<dyn Strategy>, voters: &[Voter]) -> AgreementProtocol<Voter> {
        let mut protocol = AgreementProtocol::new(Uuid::new_v4(), strategy);
        for voter in voters {
            protocol.add_voter(voter.clone());
        }
        protocol
    }

    #[test]
    fn authority_example() {
        let voters = [Voter::new(5), Voter::new(3), Voter::new(8)];
        let mut p = protocol(Box::new(ByAuthority::new(4)), &voters);
        let blob = obj();
        for (voter, approval) in voters.iter().zip([true, false, true]) {
            let (proof, sig) = vote(voter, &blob, approval);
            assert!(p.verify(&blob, &proof, &sig));
        }
        assert_eq!(p.pending_votes(&blob.id), 3);
        assert!(p.finalize(&blob));
    }

    #[test]
    fn finalize_clears_votes() {
        let voters = [Voter::new(1)];
        let mut p = protocol(Box::new(ByStake::default()), &voters);
        let blob = obj();
        let (proof, sig) = vote(&voters[0], &blob, true);
        assert!(p.verify(&blob, &proof, &sig));
        assert!(p.finalize(&blob));
        assert_eq!(p.pending_votes(&blob.id), 0);
        assert!(!p.finalize(&blob));
    }

    #[test]
    fn self_originated_auto_approves() {
        let mut p: AgreementProtocol<Voter> = protocol(Box::new(ByAuthority::new(100)), &[]);
        let blob = Obj {
            id: Uuid::new_v4(),
            originator: p.myself(),
        };
        assert!(p.finalize(&blob));
    }

    #[test]
    fn unknown_voter_rejected() {
        let mut p = protocol(Box::new(ByStake::default()), &[]);
        let stranger = Voter::new(9);
        let blob = obj();
        let (proof, sig) = vote(&stranger, &blob, true);
        assert!(!p.verify(&blob, &proof, &sig));
        assert_eq!(p.pending_votes(&blob.id), 0);
    }

    #[test]
    fn bad_signature_rejected() {
        let voters = [Voter::new(1)];
        let mut p = protocol(Box::new(ByStake::default()), &voters);
        let blob = obj();
        let (proof, mut sig) = vote(&voters[0], &blob, true);
        sig[0] ^= 0xff;
        assert!(!p.verify(&blob, &proof, &sig));
        assert!(!p.finalize(&blob));
    }

    #[test]
    fn digest_mismatch_rejected() {
        let voters = [Voter::new(1)];
        let mut p = protocol(Box::new(ByStake::default()), &voters);
        let blob = obj();
        let proof = AgreementProof::new(voters[0].id, Digest::default(), true);
        let sig = voters[0].sign(&proof);
        assert!(!p.verify(&blob, &proof, &sig));
    }

    #[test]
    fn revote_replaces() {
        let voters = [Voter::new(1)];
        let mut p = protocol(Box::new(ByStake::default()), &voters);
        let blob = obj();
        let (yea, yea_sig) = vote(&voters[0], &blob, true);
        let (nay, nay_sig) = vote(&voters[0], &blob, false);
        assert!(p.verify(&blob, &yea, &yea_sig));
        assert!(p.verify(&blob, &nay, &nay_sig));
        assert_eq!(p.pending_votes(&blob.id), 1);
        assert!(!p.finalize(&blob));
    }

    #[test]
    fn work_requires_valid_proof() {
        let voters = [Voter::new(1), Voter::new(1)];
        let mut p = protocol(Box::new(ByWork::new(1)), &voters);
        let blob = obj();

        // plain vote without a nonce is not work
        let (lazy, lazy_sig) = vote(&voters[0], &blob, true);
        assert!(!p.verify(&blob, &lazy, &lazy_sig));
        assert!(!p.finalize(&blob));

        let mut proof = ByWork::new(1).prove(voters[1].id, &Candidate::of(&blob));
        proof.approval = false;
        let sig = voters[1].sign(&proof);
        assert!(p.verify(&blob, &proof, &sig));
        assert!(p.finalize(&blob));
    }

    #[test]
    fn detached_prover_votes_like_the_protocol() {
        let p: AgreementProtocol<Voter> = protocol(Box::new(ByWork::new(1)), &[]);
        let candidate = Candidate::of(&obj());
        let prover = p.prover();
        let moved = candidate.clone();
        let proof = std::thread::spawn(move || prover.prove(&moved)).join().unwrap();
        assert_eq!(proof.voter, p.myself());
        assert!(ByWork::new(1).pre_verify(&candidate, &proof));
    }
}
