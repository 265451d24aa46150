//! Decision strategies and the tag that selects one.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::authority::ByAuthority;
use crate::proof::{AgreementProof, Ballot, Candidate};
use crate::stake::ByStake;
use crate::work::{ByWork, DIFFICULTY};

/// Rule for turning recorded votes into an accept/reject decision.
pub trait Strategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> AgreementKind;

    /// Produce the local vote for a candidate.
    fn prove(&self, voter: Uuid, candidate: &Candidate) -> AgreementProof {
        AgreementProof::new(voter, candidate.digest(&[]), true)
    }

    /// Like [`Strategy::prove`], but gives up with `None` once `stop` is
    /// raised. Strategies with expensive proofs poll the flag while working.
    fn prove_until(&self, voter: Uuid, candidate: &Candidate, stop: &AtomicBool) -> Option<AgreementProof> {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        Some(self.prove(voter, candidate))
    }

    /// Strategy-specific proof checks, run after signature and digest checks.
    fn pre_verify(&self, _candidate: &Candidate, _proof: &AgreementProof) -> bool {
        true
    }

    /// Decide on the recorded ballots.
    fn tally(&self, candidate: &Candidate, ballots: &[Ballot]) -> bool;
}

/// Which strategy an identity uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgreementKind {
    Work,
    Stake,
    #[default]
    Authority,
}

/// Tuning shared by the strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyParams {
    /// Leading zero bytes required of a work proof.
    pub difficulty: usize,
    /// Minimum rank whose vote counts under authority.
    pub threshold_rank: i64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            difficulty: DIFFICULTY,
            threshold_rank: 0,
        }
    }
}

impl AgreementKind {
    /// Build the strategy for this kind. Stake uses equal stakes.
    pub fn strategy(self, params: StrategyParams) -> Box<dyn Strategy> {
        match self {
            AgreementKind::Work => Box::new(ByWork::new(params.difficulty)),
            AgreementKind::Stake => Box::new(ByStake::default()),
            AgreementKind::Authority => Box::new(ByAuthority::new(params.threshold_rank)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementKind::Work => "work",
            AgreementKind::Stake => "stake",
            AgreementKind::Authority => "authority",
        }
    }
}

impl fmt::Display for AgreementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized agreement kind name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agreement kind: {0}")]
pub struct ParseKindError(pub String);

impl FromStr for AgreementKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "work" | "pow" => Ok(AgreementKind::Work),
            "stake" | "pos" => Ok(AgreementKind::Stake),
            "authority" | "poa" => Ok(AgreementKind::Authority),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kinds() {
        assert_eq!("PoW".parse::<AgreementKind>(), Ok(AgreementKind::Work));
        assert_eq!("stake".parse::<AgreementKind>(), Ok(AgreementKind::Stake));
        assert_eq!("poa".parse::<AgreementKind>(), Ok(AgreementKind::Authority));
        assert!("vibes".parse::<AgreementKind>().is_err());
    }

    #[test]
    fn strategy_matches_kind() {
        for kind in [AgreementKind::Work, AgreementKind::Stake, AgreementKind::Authority] {
            assert_eq!(kind.strategy(StrategyParams::default()).kind(), kind);
            assert_eq!(kind.to_string().parse::<AgreementKind>(), Ok(kind));
        }
    }
}
