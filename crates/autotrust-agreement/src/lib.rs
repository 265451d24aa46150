//! AutonomousTrust Agreement
//!
//! Peers decide whether to accept a candidate blob by exchanging signed
//! [`AgreementProof`]s. The [`AgreementProtocol`] checks and records votes;
//! the configured [`Strategy`] turns them into a decision:
//!
//! - [`ByWork`]: a vote counts only with a nonce whose digest has enough
//!   leading zero bytes; any valid proof approves.
//! - [`ByStake`]: stake-weighted majority of yea over nay.
//! - [`ByAuthority`]: voters below the threshold rank are ignored and the
//!   highest-ranked voter decides.
//!
//! A blob originated by the local node is always approved, which lets a lone
//! node bootstrap its own membership.

mod authority;
mod proof;
mod protocol;
mod stake;
mod strategy;
mod work;

pub use authority::ByAuthority;
pub use proof::{AgreementProof, AgreementVoter, Ballot, Candidate};
pub use protocol::{AgreementProtocol, Prover};
pub use stake::{ByStake, EqualStake, StakeSource};
pub use strategy::{AgreementKind, ParseKindError, Strategy, StrategyParams};
pub use work::{ByWork, DIFFICULTY};
