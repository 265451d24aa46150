//! AutonomousTrust Identity
//!
//! Admission of new peers and upkeep of the membership ledger:
//!
//! - [`Identity`]: a peer's keys (ed25519 signing, X25519 encryption) and
//!   public details.
//! - [`Peers`] and [`Group`]: who we know, and the group we belong to.
//! - [`IdentityHistory`]: Merkle membership tree plus the step DAG recording
//!   every change, with agreement on newcomers.
//! - [`IdentityProcess`]: the phased admission protocol run as a tokio task.
//!
//! Nodes exchange [`Envelope`]s through a network subsystem; [`LocalRouter`]
//! wires several processes together in one runtime.

mod error;
pub mod config;
pub mod group;
pub mod history;
pub mod identity;
pub mod keys;
pub mod message;
pub mod peers;
pub mod process;
pub mod router;
pub mod store;

pub use config::IdentityConfig;
pub use error::{Error, Result};
pub use group::Group;
pub use history::{validate_branch, HistoryParams, IdentityHistory, IdentityObj};
pub use identity::{bare_address, Identity};
pub use keys::{EncryptorKeys, Sealed, SignatureKeys};
pub use message::{
    Envelope, Function, HistoryPackage, Inbound, Introduction, Payload, Recipient, Signal,
    Snapshot, Vote, PROCESS_NAME,
};
pub use peers::{Peers, Placement, LEVELS, VALUES};
pub use process::{IdentityHandle, IdentityProcess, Phase, Subsystems, MAILBOX_CAPACITY};
pub use router::LocalRouter;
pub use store::ConfigStore;
