//! Agreement by vote, where only sufficiently ranked voters count and the
//! highest rank decides.

use tracing::debug;

use crate::proof::{Ballot, Candidate};
use crate::strategy::{AgreementKind, Strategy};

/// Proof-of-authority strategy.
#[derive(Debug, Clone)]
pub struct ByAuthority {
    threshold_rank: i64,
}

impl ByAuthority {
    pub fn new(threshold_rank: i64) -> Self {
        Self { threshold_rank }
    }

    pub fn threshold_rank(&self) -> i64 {
        self.threshold_rank
    }
}

impl Strategy for ByAuthority {
    fn kind(&self) -> AgreementKind {
        AgreementKind::Authority
    }

    /// The highest-ranked qualifying voter decides. Top-ranked voters that
    /// disagree, or no qualifying votes at all, mean rejection.
    fn tally(&self, candidate: &Candidate, ballots: &[Ballot]) -> bool {
        let qualifying: Vec<&Ballot> = ballots
            .iter()
            .filter(|b| b.rank >= self.threshold_rank)
            .collect();
        let Some(top) = qualifying.iter().map(|b| b.rank).max() else {
            debug!(candidate = %candidate.uuid, "no qualifying votes");
            return false;
        };
        qualifying
            .iter()
            .filter(|b| b.rank == top)
            .all(|b| b.proof.approval)
    }
}
