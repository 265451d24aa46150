//! Agreement by vote, each vote weighted by the voter's stake.

use std::fmt;

use uuid::Uuid;

use crate::proof::{Ballot, Candidate};
use crate::strategy::{AgreementKind, Strategy};

/// Where stakes come from (normally the reputation subsystem).
pub trait StakeSource: Send + Sync + fmt::Debug {
    fn stake(&self, voter: Uuid) -> f64;
}

/// Every voter holds the same stake.
#[derive(Debug, Clone, Copy)]
pub struct EqualStake(pub f64);

impl Default for EqualStake {
    fn default() -> Self {
        Self(1.0)
    }
}

impl StakeSource for EqualStake {
    fn stake(&self, _voter: Uuid) -> f64 {
        self.0
    }
}

/// Proof-of-stake strategy: approved iff yea stake exceeds nay stake.
#[derive(Debug)]
pub struct ByStake {
    source: Box<dyn StakeSource>,
}

impl Default for ByStake {
    fn default() -> Self {
        Self::new(Box::new(EqualStake::default()))
    }
}

impl ByStake {
    pub fn new(source: Box<dyn StakeSource>) -> Self {
        Self { source }
    }
}

impl Strategy for ByStake {
    fn kind(&self) -> AgreementKind {
        AgreementKind::Stake
    }

    fn tally(&self, _candidate: &Candidate, ballots: &[Ballot]) -> bool {
        let (yea, nay) = ballots.iter().fold((0.0, 0.0), |(yea, nay), ballot| {
            let stake = self.source.stake(ballot.proof.voter);
            if ballot.proof.approval {
                (yea + stake, nay)
            } else {
                (yea, nay + stake)
            }
        });
        yea > nay
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::proof::AgreementProof;
    use autotrust_structures::hash;

    #[derive(Debug)]
    struct Table(HashMap<Uuid, f64>);

    impl StakeSource for Table {
        fn stake(&self, voter: Uuid) -> f64 {
            self.0.get(&voter).copied().unwrap_or_default()
        }
    }

    fn ballot(voter: u128, approval: bool) -> Ballot {
        Ballot {
            proof: AgreementProof::new(Uuid::from_u128(voter), hash(b"c"), approval),
            rank: 0,
        }
    }

    fn candidate() -> Candidate {
        Candidate {
            uuid: Uuid::nil(),
            originator: Uuid::nil(),
            designation: b"c".to_vec(),
        }
    }

    #[test]
    fn equal_stake_majority() {
        let stake = ByStake::default();
        let c = candidate();
        assert!(stake.tally(&c, &[ballot(1, true), ballot(2, true), ballot(3, false)]));
        assert!(!stake.tally(&c, &[ballot(1, true), ballot(2, false)]));
        assert!(!stake.tally(&c, &[]));
    }

    #[test]
    fn weighted_minority_wins() {
        let table = Table(HashMap::from([
            (Uuid::from_u128(1), 10.0),
            (Uuid::from_u128(2), 1.0),
            (Uuid::from_u128(3), 1.0),
        ]));
        let stake = ByStake::new(Box::new(table));
        assert!(stake.tally(&candidate(), &[ballot(1, true), ballot(2, false), ballot(3, false)]));
    }

    proptest::proptest! {
        #[test]
        fn equal_stake_is_simple_majority(votes in proptest::collection::vec(proptest::bool::ANY, 0..40)) {
            let ballots: Vec<Ballot> = votes
                .iter()
                .enumerate()
                .map(|(i, approval)| ballot(i as u128 + 1, *approval))
                .collect();
            let yea = votes.iter().filter(|v| **v).count();
            let nay = votes.len() - yea;
            proptest::prop_assert_eq!(ByStake::default().tally(&candidate(), &ballots), yea > nay);
        }
    }
}
