//! Identity protocol messages and the envelopes that carry them.

use std::collections::BTreeMap;
use std::fmt;

use autotrust_agreement::AgreementProof;
use autotrust_structures::{Digest, StepRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::group::Group;
use crate::history::IdentityObj;
use crate::identity::Identity;
use crate::peers::Peers;

/// Process name stamped on every identity envelope.
pub const PROCESS_NAME: &str = "identity";

/// Message kinds of the admission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    /// A newcomer asks to join.
    Announce,
    /// A member tells the newcomer it was admitted.
    Accept,
    /// Full history for a newcomer.
    History,
    /// Part of a history, broadcast after catching up.
    Diff,
    /// A member asks the group to vote on a newcomer.
    Propose,
    Vote,
    /// A newcomer was admitted.
    Confirm,
    /// New group details.
    Update,
}

impl Function {
    /// Wire tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Function::Announce => "request_access",
            Function::Accept => "access_granted",
            Function::History => "full_history",
            Function::Diff => "history_diff",
            Function::Propose => "propose_peer",
            Function::Vote => "vote_on_peer",
            Function::Confirm => "peer_accepted",
            Function::Update => "group_key_update",
        }
    }

    /// Whether this kind travels encrypted.
    pub fn encrypted(&self) -> bool {
        !matches!(self, Function::Announce | Function::Accept)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Who an envelope is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Broadcast,
    Group(Uuid),
    Peer { uuid: Uuid, address: String },
}

impl Recipient {
    pub fn peer(identity: &Identity) -> Self {
        Recipient::Peer {
            uuid: identity.uuid(),
            address: identity.address().to_string(),
        }
    }
}

/// Self-introduction: sent by a newcomer to ask for access, and back by the
/// member that admitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Introduction {
    pub identity: Identity,
    /// Hash of the software package the sender runs.
    pub package_hash: String,
    pub capabilities: Vec<String>,
}

/// Everything a newcomer needs to join: the signed history, the group
/// (with its secret) and the current members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPackage {
    /// bincode step list, head first.
    pub steps: Vec<u8>,
    pub signature: Vec<u8>,
    pub group: Group,
    pub members: Vec<Identity>,
}

/// One member's signed vote on a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub candidate: IdentityObj,
    pub proof: AgreementProof,
    pub signature: Vec<u8>,
}

/// Typed payload of an envelope.
#[derive(Debug, Clone)]
pub enum Payload {
    Announce(Introduction),
    Accept(Introduction),
    History(Box<HistoryPackage>),
    Diff(Vec<StepRecord>),
    Propose(IdentityObj),
    Vote(Box<Vote>),
    Confirm(IdentityObj),
    Update(Group),
}

impl Payload {
    pub fn function(&self) -> Function {
        match self {
            Payload::Announce(_) => Function::Announce,
            Payload::Accept(_) => Function::Accept,
            Payload::History(_) => Function::History,
            Payload::Diff(_) => Function::Diff,
            Payload::Propose(_) => Function::Propose,
            Payload::Vote(_) => Function::Vote,
            Payload::Confirm(_) => Function::Confirm,
            Payload::Update(_) => Function::Update,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Payload::Announce(intro) | Payload::Accept(intro) => bincode::serialize(intro)?,
            Payload::History(package) => bincode::serialize(package)?,
            Payload::Diff(steps) => bincode::serialize(steps)?,
            Payload::Propose(obj) | Payload::Confirm(obj) => bincode::serialize(obj)?,
            Payload::Vote(vote) => bincode::serialize(vote)?,
            Payload::Update(group) => bincode::serialize(group)?,
        };
        Ok(bytes)
    }
}

/// Routed message between subsystems and nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub process: String,
    pub function: Function,
    pub payload: Vec<u8>,
    pub to_whom: Recipient,
    pub from_whom: Option<Identity>,
    pub encrypt: bool,
}

impl Envelope {
    /// Wrap a payload from `from_whom` (sent as its public copy).
    pub fn new(payload: &Payload, to_whom: Recipient, from_whom: &Identity) -> Result<Self> {
        let function = payload.function();
        Ok(Self {
            process: PROCESS_NAME.to_string(),
            function,
            payload: payload.encode()?,
            to_whom,
            from_whom: Some(from_whom.publish()),
            encrypt: function.encrypted(),
        })
    }

    pub fn decode(&self) -> Result<Payload> {
        let bytes = &self.payload;
        let payload = match self.function {
            Function::Announce => Payload::Announce(bincode::deserialize(bytes)?),
            Function::Accept => Payload::Accept(bincode::deserialize(bytes)?),
            Function::History => Payload::History(bincode::deserialize(bytes)?),
            Function::Diff => Payload::Diff(bincode::deserialize(bytes)?),
            Function::Propose => Payload::Propose(bincode::deserialize(bytes)?),
            Function::Vote => Payload::Vote(bincode::deserialize(bytes)?),
            Function::Confirm => Payload::Confirm(bincode::deserialize(bytes)?),
            Function::Update => Payload::Update(bincode::deserialize(bytes)?),
        };
        Ok(payload)
    }
}

/// Input to the identity process mailbox.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Box<Envelope>),
    /// Local capabilities, reported once at startup.
    Capabilities(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Quit,
}

/// State published to observing subsystems.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Peers(Box<Peers>),
    Group(Group),
    History { length: usize, root: Option<Digest> },
    Capabilities(BTreeMap<Uuid, Vec<String>>),
}
