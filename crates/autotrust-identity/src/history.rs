//! Membership history: who has been admitted, and in what order.
//!
//! Every membership change updates the Merkle tree of [`IdentityObj`]s and
//! appends a step carrying the new root digest to the `main` branch. Peers
//! exchange step lists to converge on one history.

use std::time::Duration;

use autotrust_agreement::{AgreementProof, AgreementProtocol, Prover, StrategyParams};
use autotrust_structures::{
    Blob, Digest, MerkleTree, ProofStep, StepDag, StepRecord, MAIN,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::peers::Peers;

/// Merkle leaf recording one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityObj {
    identity: Identity,
    originator: Uuid,
}

impl IdentityObj {
    /// Membership record for `identity`. The identity is its own originator
    /// so every node derives the same leaf.
    pub fn new(identity: &Identity) -> Self {
        Self {
            identity: identity.publish(),
            originator: identity.uuid(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl PartialEq for IdentityObj {
    fn eq(&self, other: &Self) -> bool {
        self.identity.uuid() == other.identity.uuid()
    }
}

impl Eq for IdentityObj {}

impl Blob for IdentityObj {
    fn uuid(&self) -> Uuid {
        self.identity.uuid()
    }

    fn originator(&self) -> Uuid {
        self.originator
    }

    fn designation(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + self.identity.fullname().len());
        bytes.extend_from_slice(self.originator.as_bytes());
        bytes.extend_from_slice(self.identity.uuid().as_bytes());
        bytes.extend_from_slice(self.identity.fullname().as_bytes());
        bytes.extend_from_slice(self.identity.signature().public());
        bytes
    }
}

/// Tunables for [`IdentityHistory`].
#[derive(Debug, Clone, Copy)]
pub struct HistoryParams {
    /// How long a vote stays open.
    pub timeout: Duration,
    pub strategy: StrategyParams,
}

impl Default for HistoryParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            strategy: StrategyParams::default(),
        }
    }
}

/// Membership ledger of the local node.
pub struct IdentityHistory {
    myself: Identity,
    peers: Peers,
    dag: StepDag,
    merkle: MerkleTree<IdentityObj>,
    agreement: AgreementProtocol<Identity>,
    blacklist: Vec<Identity>,
    timeout: Duration,
}

impl IdentityHistory {
    /// Start a history rooted at `myself`. Already-known peers are recorded
    /// in the same first step.
    pub fn new(myself: Identity, peers: Peers, params: HistoryParams) -> Result<Self> {
        if myself.public_only() {
            return Err(Error::PermissionDenied(
                "history needs a private identity".into(),
            ));
        }
        let strategy = myself.agreement().strategy(params.strategy);
        let mut agreement = AgreementProtocol::new(myself.uuid(), strategy);
        agreement.add_voter(myself.publish());
        for peer in peers.iter() {
            agreement.add_voter(peer.clone());
        }

        let mut merkle = MerkleTree::new();
        merkle.merge(
            std::iter::once(IdentityObj::new(&myself)).chain(peers.iter().map(IdentityObj::new)),
        )?;
        let mut dag = StepDag::new();
        let root = merkle.root_digest().unwrap_or_default();
        dag.add_step(root, MAIN)?;

        let history = Self {
            myself,
            peers,
            dag,
            merkle,
            agreement,
            blacklist: Vec::new(),
            timeout: params.timeout,
        };
        history.warn_duplications();
        Ok(history)
    }

    pub fn myself(&self) -> &Identity {
        &self.myself
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn dag(&self) -> &StepDag {
        &self.dag
    }

    pub fn merkle(&self) -> &MerkleTree<IdentityObj> {
        &self.merkle
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Public copies of every member, local node included.
    pub fn members(&self) -> Vec<Identity> {
        std::iter::once(self.myself.publish())
            .chain(self.peers.iter().cloned())
            .collect()
    }

    /// Number of steps on `main`.
    pub fn length(&self) -> usize {
        self.dag.len(MAIN).unwrap_or(0)
    }

    pub fn root_digest(&self) -> Option<Digest> {
        self.merkle.root_digest()
    }

    /// Raise a peer one valuation tier, admitting it first if unknown.
    pub fn upgrade_peer(&mut self, identity: &Identity) -> Result<()> {
        if self.is_me(identity) {
            return Ok(());
        }
        if !self.peers.contains(&identity.uuid()) {
            self.record_member(identity)?;
        }
        self.peers.promote(identity);
        Ok(())
    }

    /// Admit a peer at a hierarchy level. A known peer is only moved;
    /// returns whether the peer was new.
    pub fn insert_peer(&mut self, identity: &Identity, level: usize) -> Result<bool> {
        if self.is_me(identity) {
            return Ok(false);
        }
        if self.peers.contains(&identity.uuid()) {
            self.peers.move_to(&identity.uuid(), level);
            return Ok(false);
        }
        self.record_member(identity)?;
        self.peers.add(identity.publish(), Some(level));
        Ok(true)
    }

    /// Lower a peer one valuation tier; a peer that falls off the last tier
    /// leaves the membership.
    pub fn downgrade_peer(&mut self, identity: &Identity) -> Result<()> {
        if self.is_me(identity) {
            debug!("not downgrading ourselves");
            return Ok(());
        }
        if self.peers.demote(&identity.uuid()) {
            return Ok(());
        }
        let obj = IdentityObj::new(identity);
        if self.merkle.contains(&obj) {
            self.merkle.delete(&obj)?;
            self.record_step()?;
            self.agreement.remove_voter(&identity.uuid());
            info!(peer = %identity, "peer left membership");
        }
        Ok(())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.merkle.contains(&IdentityObj::new(identity))
    }

    pub fn prove_existence(&self, identity: &Identity) -> Option<Vec<ProofStep>> {
        self.merkle.inclusion_proof(&IdentityObj::new(identity))
    }

    pub fn verify_existence(&self, identity: &Identity, proof: &[ProofStep]) -> bool {
        self.merkle.audit(&IdentityObj::new(identity), Some(proof))
    }

    /// Signed wire form of `main`.
    pub fn share(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let steps = self.dag.recite(MAIN, None)?;
        let bytes = bincode::serialize(&steps)?;
        let sig = self.myself.sign(&bytes)?;
        Ok((bytes, sig))
    }

    /// Decode a step list shared by `sender`.
    pub fn hear(&self, bytes: &[u8], sig: &[u8], sender: &Identity) -> Result<Vec<StepRecord>> {
        if !sender.verify(bytes, sig) {
            return Err(Error::BadSignature);
        }
        Ok(bincode::deserialize(bytes)?)
    }

    /// Merge a peer's full history into `main`. Returns the part of theirs
    /// beyond our common ancestor, or nothing if it was rejected.
    pub fn catch_up(&mut self, steps: &[StepRecord]) -> Result<Vec<StepRecord>> {
        let diff = self.dag.catch_up(steps, validate_branch)?;
        debug!(received = steps.len(), diff = diff.len(), length = self.length(), "caught up");
        Ok(diff)
    }

    /// Merge a partial history whose oldest step hangs off a known step.
    /// Returns whether the branch was valid and merged.
    pub fn apply_diff(&mut self, steps: &[StepRecord]) -> Result<bool> {
        if steps.is_empty() {
            return Ok(false);
        }
        let name = self.dag.graft_branch(steps, None)?;
        if !validate_branch(&self.dag, &name) {
            warn!(branch = %name, "rejected invalid diff");
            self.dag.remove_branch(&name)?;
            return Ok(false);
        }
        self.dag.merge(&name, MAIN, false)?;
        debug!(steps = steps.len(), length = self.length(), "applied diff");
        Ok(true)
    }

    pub fn validate(&self, branch: &str) -> bool {
        validate_branch(&self.dag, branch)
    }

    pub fn blacklist(&mut self, identity: &Identity) {
        if !self.is_blacklisted(identity) {
            self.blacklist.push(identity.publish());
        }
    }

    pub fn is_blacklisted(&self, identity: &Identity) -> bool {
        self.blacklist
            .iter()
            .any(|banned| banned.uuid() == identity.uuid() || banned.address() == identity.address())
    }

    /// Our vote on admitting `obj`, or `None` for a banned identity.
    pub fn prove(&self, obj: &IdentityObj) -> Option<AgreementProof> {
        if self.is_blacklisted(obj.identity()) {
            warn!(candidate = %obj.identity(), "refusing to vote for blacklisted identity");
            return None;
        }
        Some(self.agreement.prove(obj))
    }

    /// Owned prover for the local vote on `obj`, for running expensive
    /// proofs off the caller's thread. Same refusals as [`Self::prove`].
    pub fn prover(&self, obj: &IdentityObj) -> Option<Prover> {
        if self.is_blacklisted(obj.identity()) {
            warn!(candidate = %obj.identity(), "refusing to vote for blacklisted identity");
            return None;
        }
        Some(self.agreement.prover())
    }

    /// Record someone's vote on `obj`.
    pub fn verify(&mut self, obj: &IdentityObj, proof: &AgreementProof, sig: &[u8]) -> bool {
        if self.peers.contains(&obj.identity().uuid()) {
            error!(candidate = %obj.identity(), "vote on an existing peer");
            return false;
        }
        if self.is_blacklisted(obj.identity()) {
            warn!(candidate = %obj.identity(), "vote on a blacklisted identity");
            return false;
        }
        self.agreement.verify(obj, proof, sig)
    }

    /// Decide on `obj` from the recorded votes.
    pub fn finalize(&mut self, obj: &IdentityObj) -> bool {
        let approved = self.agreement.finalize(obj);
        debug!(candidate = %obj.identity(), approved, "finalized vote");
        approved
    }

    fn is_me(&self, identity: &Identity) -> bool {
        identity.uuid() == self.myself.uuid()
    }

    fn record_member(&mut self, identity: &Identity) -> Result<()> {
        self.merkle.insert(IdentityObj::new(identity))?;
        self.record_step()?;
        self.agreement.add_voter(identity.publish());
        Ok(())
    }

    fn record_step(&mut self) -> Result<()> {
        let root = self.merkle.root_digest().unwrap_or_default();
        self.dag.add_step(root, MAIN)?;
        self.warn_duplications();
        Ok(())
    }

    fn warn_duplications(&self) {
        for dup in self.merkle.subtree_duplications() {
            warn!(key = dup.key, digest = %dup.digest, "duplicate membership subtree");
        }
    }
}

/// A branch is acceptable if its timestamps never go backwards.
pub fn validate_branch(dag: &StepDag, branch: &str) -> bool {
    let Ok(chain) = dag.chain(branch) else {
        return false;
    };
    chain.windows(2).all(|pair| {
        let (parent, child) = (dag.step(pair[0]), dag.step(pair[1]));
        child.parent == Some(pair[0]) && child.timestamp >= parent.timestamp
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrust_agreement::AgreementKind;
    use autotrust_structures::Source;

    fn me() -> Identity {
        Identity::initialize("Alice Example", "alice", "10.0.0.1")
    }

    fn history() -> IdentityHistory {
        IdentityHistory::new(me(), Peers::new(), HistoryParams::default()).unwrap()
    }

    fn stranger(nick: &str) -> Identity {
        Identity::initialize(&format!("{nick} Example"), nick, "10.0.0.9")
    }

    #[test]
    fn starts_with_myself() {
        let history = history();
        assert_eq!(history.length(), 1);
        assert!(history.contains(history.myself()));
        assert!(history.root_digest().is_some());
        assert!(history.peers().is_empty());
    }

    #[test]
    fn rejects_public_identity() {
        let public = me().publish();
        assert!(IdentityHistory::new(public, Peers::new(), HistoryParams::default()).is_err());
    }

    #[test]
    fn insert_peer_records_step() {
        let mut history = history();
        let bob = stranger("bob");
        let before = history.root_digest();
        assert!(history.insert_peer(&bob, Peers::mid_level()).unwrap());
        assert_eq!(history.length(), 2);
        assert_ne!(history.root_digest(), before);
        assert!(history.contains(&bob));
        assert!(!history.insert_peer(&bob, 0).unwrap());
        assert_eq!(history.length(), 2);
        assert_eq!(history.peers().placement(&bob.uuid()).map(|p| p.level), Some(0));
    }

    #[test]
    fn downgrade_removes_after_last_tier() {
        let mut history = history();
        let bob = stranger("bob");
        history.insert_peer(&bob, 1).unwrap();
        history.downgrade_peer(&bob).unwrap();
        assert!(!history.contains(&bob));
        assert!(!history.peers().contains(&bob.uuid()));
        assert_eq!(history.length(), 3);
    }

    #[test]
    fn downgrading_myself_changes_nothing() {
        let mut history = history();
        let me = history.myself().clone();
        let root = history.root_digest();
        history.downgrade_peer(&me).unwrap();
        history.downgrade_peer(&me.publish()).unwrap();
        history.upgrade_peer(&me).unwrap();
        assert!(!history.insert_peer(&me, 0).unwrap());
        assert!(history.contains(&me));
        assert!(history.peers().is_empty());
        assert_eq!(history.length(), 1);
        assert_eq!(history.root_digest(), root);
    }

    #[test]
    fn upgrade_admits_unknown_peer() {
        let mut history = history();
        let bob = stranger("bob");
        history.upgrade_peer(&bob).unwrap();
        assert!(history.contains(&bob));
        assert!(history.peers().contains(&bob.uuid()));
        history.upgrade_peer(&bob).unwrap();
        assert_eq!(history.length(), 2);
    }

    #[test]
    fn existence_proofs() {
        let mut history = history();
        let bob = stranger("bob");
        let carol = stranger("carol");
        history.insert_peer(&bob, 1).unwrap();
        history.insert_peer(&carol, 1).unwrap();
        let proof = history.prove_existence(&bob).unwrap();
        assert!(history.verify_existence(&bob, &proof));
        assert!(!history.verify_existence(&carol, &proof));
        assert!(history.prove_existence(&stranger("dave")).is_none());
    }

    #[test]
    fn share_and_hear() {
        let mut history = history();
        history.insert_peer(&stranger("bob"), 1).unwrap();
        let (bytes, sig) = history.share().unwrap();
        let listener = IdentityHistory::new(stranger("bob"), Peers::new(), HistoryParams::default()).unwrap();
        let steps = listener.hear(&bytes, &sig, &history.myself().publish()).unwrap();
        assert_eq!(steps.len(), 2);
        let impostor = stranger("mallory").publish();
        assert!(matches!(listener.hear(&bytes, &sig, &impostor), Err(Error::BadSignature)));
    }

    #[test]
    fn catch_up_merges_foreign_history() {
        let mut theirs = history();
        theirs.insert_peer(&stranger("bob"), 1).unwrap();
        let steps = theirs.dag().recite(MAIN, None).unwrap();

        let mut ours = IdentityHistory::new(stranger("newbie"), Peers::new(), HistoryParams::default()).unwrap();
        let diff = ours.catch_up(&steps).unwrap();
        assert_eq!(diff, steps);
        assert_eq!(ours.length(), 3);
    }

    #[test]
    fn catch_up_rejects_backwards_time() {
        let mut ours = history();
        let newer = StepRecord {
            uuid: Uuid::new_v4(),
            timestamp: 2_000,
            payload: autotrust_structures::hash(b"a"),
            parent_uuid: None,
        };
        let older = StepRecord {
            uuid: Uuid::new_v4(),
            timestamp: 1_000,
            payload: autotrust_structures::hash(b"b"),
            parent_uuid: Some(newer.uuid),
        };
        let diff = ours.catch_up(&[older, newer]).unwrap();
        assert!(diff.is_empty());
        assert_eq!(ours.length(), 1);
        assert_eq!(ours.dag().branches().count(), 1);
    }

    #[test]
    fn apply_diff_extends_main() {
        let mut ours = history();
        std::thread::sleep(Duration::from_millis(5));
        let mut theirs = IdentityHistory::new(stranger("bob"), Peers::new(), HistoryParams::default()).unwrap();
        theirs.catch_up(&ours.dag().recite(MAIN, None).unwrap()).unwrap();
        let shared = ours.dag().recite(MAIN, None).unwrap()[0].uuid;
        theirs.insert_peer(&stranger("carol"), 1).unwrap();

        // theirs: [carol step, bob root, our root]
        let all = theirs.dag().recite(MAIN, None).unwrap();
        let cut = all.iter().position(|record| record.uuid == shared).unwrap();
        assert_eq!(cut, 2);
        assert!(ours.apply_diff(&all[..cut]).unwrap());
        assert_eq!(ours.length(), theirs.length());
        assert!(!ours.apply_diff(&[]).unwrap());
    }

    #[test]
    fn apply_diff_with_unknown_parent_fails() {
        let mut ours = history();
        let orphan = StepRecord {
            uuid: Uuid::new_v4(),
            timestamp: 5,
            payload: autotrust_structures::hash(b"x"),
            parent_uuid: Some(Uuid::new_v4()),
        };
        assert!(matches!(ours.apply_diff(&[orphan]), Err(Error::Dag(_))));
    }

    #[test]
    fn validate_branch_checks_timestamps() {
        let mut dag = StepDag::new();
        let base = StepRecord {
            uuid: Uuid::new_v4(),
            timestamp: 10,
            payload: autotrust_structures::hash(b"a"),
            parent_uuid: None,
        };
        dag.append(&base, MAIN).unwrap();
        dag.branch(
            "back",
            &StepRecord { uuid: Uuid::new_v4(), timestamp: 5, ..base.clone() },
            Source::Branch(MAIN),
        )
        .unwrap();
        assert!(validate_branch(&dag, MAIN));
        assert!(!validate_branch(&dag, "back"));
        assert!(!validate_branch(&dag, "missing"));
    }

    #[test]
    fn votes_on_newcomer() {
        let mut history = history();
        let bob = stranger("bob");
        let obj = IdentityObj::new(&bob);
        let proof = history.prove(&obj).unwrap();
        let sig = history.myself().sign(&proof.to_bytes()).unwrap();
        assert!(history.verify(&obj, &proof, &sig));
        assert!(history.finalize(&obj));
    }

    #[test]
    fn no_votes_on_existing_or_banned() {
        let mut history = history();
        let bob = stranger("bob");
        history.insert_peer(&bob, 1).unwrap();
        let obj = IdentityObj::new(&bob);
        let proof = history.prove(&obj).unwrap();
        let sig = history.myself().sign(&proof.to_bytes()).unwrap();
        assert!(!history.verify(&obj, &proof, &sig));

        let mallory = stranger("mallory");
        history.blacklist(&mallory);
        assert!(history.prove(&IdentityObj::new(&mallory)).is_none());
    }

    #[test]
    fn work_strategy_from_identity() {
        let alice = me().with_agreement(AgreementKind::Work);
        let params = HistoryParams {
            strategy: StrategyParams { difficulty: 1, ..StrategyParams::default() },
            ..HistoryParams::default()
        };
        let mut history = IdentityHistory::new(alice, Peers::new(), params).unwrap();
        let obj = IdentityObj::new(&stranger("bob"));
        let proof = history.prove(&obj).unwrap();
        assert!(proof.nonce.is_some());
        assert!(proof.digest.leading_zero_bytes() >= 1);
        let sig = history.myself().sign(&proof.to_bytes()).unwrap();
        assert!(history.verify(&obj, &proof, &sig));
        assert!(history.finalize(&obj));
    }

    #[test]
    fn obj_designation_is_node_independent() {
        let bob = stranger("bob");
        let a = IdentityObj::new(&bob);
        let b = IdentityObj::new(&bob.publish());
        assert_eq!(a.digest(&[]), b.digest(&[]));
        assert_eq!(a, b);
    }
}
