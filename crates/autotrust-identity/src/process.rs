//! The identity process: admits newcomers and keeps the membership current.
//!
//! A node moves through four phases:
//!
//! 0. wait for the local capabilities (bounded by `init_timeout`);
//! 1. broadcast an announce asking for access;
//! 2. collect histories from members that admitted it, then pick a group
//!    once the `init_timeout` window closes;
//! 3. steady state: vote on newcomers, confirm admissions, merge history
//!    diffs and group updates.
//!
//! Messages that arrive in the wrong phase are queued and retried on every
//! cadence tick. Vote collection runs in its own task per candidate and hands
//! the votes back to the loop, which alone decides. Local votes are proved on
//! the blocking pool so an expensive proof never stalls the loop.
//!
//! Only a vote adds a peer. An accept is honoured while the node waits for
//! its own admission, and histories are only taken from known peers; a
//! history received in steady state contributes steps, never members.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autotrust_agreement::Candidate;
use autotrust_structures::StepRecord;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::history::{IdentityHistory, IdentityObj};
use crate::identity::Identity;
use crate::message::{
    Envelope, Function, HistoryPackage, Inbound, Introduction, Payload, Recipient, Signal,
    Snapshot, Vote, PROCESS_NAME,
};
use crate::peers::Peers;
use crate::store::ConfigStore;

/// Mailbox depth of the identity process.
pub const MAILBOX_CAPACITY: usize = 256;

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Discovery = 0,
    Announce = 1,
    Acquire = 2,
    Steady = 3,
}

/// Other subsystems the identity process talks to.
#[derive(Debug, Default)]
pub struct Subsystems {
    /// Outbound envelopes. Required.
    pub network: Option<mpsc::Sender<Envelope>>,
    /// Receivers of state snapshots.
    pub observers: Vec<mpsc::Sender<Snapshot>>,
}

/// Control side of a running identity process.
#[derive(Debug, Clone)]
pub struct IdentityHandle {
    inbox: mpsc::Sender<Inbound>,
    signals: mpsc::Sender<Signal>,
}

impl IdentityHandle {
    /// Sender for inbound envelopes, for wiring into a network.
    pub fn inbox(&self) -> mpsc::Sender<Inbound> {
        self.inbox.clone()
    }

    pub async fn capabilities(&self, capabilities: Vec<String>) -> Result<()> {
        self.inbox
            .send(Inbound::Capabilities(capabilities))
            .await
            .map_err(|_| Error::ChannelClosed("identity inbox"))
    }

    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.inbox
            .send(Inbound::Message(Box::new(envelope)))
            .await
            .map_err(|_| Error::ChannelClosed("identity inbox"))
    }

    pub async fn quit(&self) -> Result<()> {
        self.signals
            .send(Signal::Quit)
            .await
            .map_err(|_| Error::ChannelClosed("identity signals"))
    }
}

enum Internal {
    ChooseGroup,
    Tally {
        candidate: IdentityObj,
        votes: Vec<Vote>,
    },
    /// Local vote on someone else's proposal, ready to go to the group.
    Voted(Vote),
}

/// Where a finished local vote goes.
enum VoteSink {
    Collection(mpsc::Sender<Vote>),
    Group,
}

struct Collection {
    votes: mpsc::Sender<Vote>,
    task: JoinHandle<()>,
}

/// A history offered by a member during phase 2.
struct Offer {
    steps: Vec<StepRecord>,
    group: Group,
    members: Vec<Identity>,
}

/// Identity admission and membership process.
pub struct IdentityProcess {
    config: IdentityConfig,
    history: IdentityHistory,
    group: Option<Group>,
    cached_group: Option<Group>,
    phase: Phase,
    capabilities: Option<Vec<String>>,
    potentials: HashMap<Uuid, Vec<String>>,
    peer_capabilities: BTreeMap<Uuid, Vec<String>>,
    offers: Vec<Offer>,
    collections: HashMap<Uuid, Collection>,
    pending: VecDeque<Envelope>,
    tasks: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    network: mpsc::Sender<Envelope>,
    observers: Vec<mpsc::Sender<Snapshot>>,
    store: Option<ConfigStore>,
    inbox: mpsc::Receiver<Inbound>,
    signals: mpsc::Receiver<Signal>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
}

impl IdentityProcess {
    /// Build the process for a private `identity` and its known `peers`.
    pub fn new(
        identity: Identity,
        peers: Peers,
        config: IdentityConfig,
        subsystems: Subsystems,
    ) -> Result<(Self, IdentityHandle)> {
        let network = subsystems
            .network
            .ok_or(Error::UnmetDependency("network"))?;
        let history = IdentityHistory::new(identity, peers, config.history_params())?;
        let store = config.cfg_dir.as_ref().map(ConfigStore::open).transpose()?;
        let cached_group = match &store {
            Some(store) => store.load_group().unwrap_or_else(|e| {
                warn!("ignoring unreadable group record: {}", e);
                None
            }),
            None => None,
        };

        let (inbox_tx, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let (signal_tx, signals) = mpsc::channel(8);
        let (internal_tx, internal_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let process = Self {
            config,
            history,
            group: None,
            cached_group,
            phase: Phase::Discovery,
            capabilities: None,
            potentials: HashMap::new(),
            peer_capabilities: BTreeMap::new(),
            offers: Vec::new(),
            collections: HashMap::new(),
            pending: VecDeque::new(),
            tasks: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            network,
            observers: subsystems.observers,
            store,
            inbox,
            signals,
            internal_tx,
            internal_rx,
        };
        let handle = IdentityHandle {
            inbox: inbox_tx,
            signals: signal_tx,
        };
        Ok((process, handle))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run until told to quit.
    pub async fn run(mut self) -> Result<()> {
        info!(me = %self.history.myself(), "identity process starting");
        if self.discover().await {
            self.announce().await;
            self.enter_acquire();
            self.event_loop().await;
        }
        self.shutdown();
        info!(me = %self.history.myself(), "identity process stopped");
        Ok(())
    }

    async fn discover(&mut self) -> bool {
        let deadline = tokio::time::sleep(self.config.init_timeout);
        tokio::pin!(deadline);
        while self.capabilities.is_none() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("no capabilities reported, announcing without");
                    break;
                }
                _ = self.signals.recv() => return false,
                inbound = self.inbox.recv() => match inbound {
                    Some(Inbound::Capabilities(capabilities)) => {
                        self.capabilities = Some(capabilities);
                    }
                    Some(Inbound::Message(envelope)) => self.queue(*envelope),
                    None => return false,
                },
            }
        }
        self.phase = Phase::Announce;
        true
    }

    async fn announce(&mut self) {
        let intro = self.introduction();
        self.send(Payload::Announce(intro), Recipient::Broadcast).await;
        info!(me = %self.history.myself(), "announced");
    }

    fn enter_acquire(&mut self) {
        self.phase = Phase::Acquire;
        let report = self.internal_tx.clone();
        let window = self.config.init_timeout;
        self.track(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if report.send(Internal::ChooseGroup).await.is_err() {
                debug!("identity loop gone before choosing a group");
            }
        }));
    }

    async fn event_loop(&mut self) {
        let mut retry = tokio::time::interval(self.config.cadence);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.signals.recv() => break,
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                inbound = self.inbox.recv() => match inbound {
                    Some(Inbound::Message(envelope)) => self.receive(*envelope).await,
                    Some(Inbound::Capabilities(capabilities)) => {
                        self.capabilities = Some(capabilities);
                    }
                    None => break,
                },
                _ = retry.tick() => self.retry_pending().await,
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for (_, collection) in self.collections.drain() {
            collection.task.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ChooseGroup => self.choose_group().await,
            Internal::Tally { candidate, votes } => self.tally(candidate, votes).await,
            Internal::Voted(vote) => {
                if let Some(to) = self.group_recipient() {
                    self.send(Payload::Vote(Box::new(vote)), to).await;
                }
            }
        }
    }

    fn accepts(&self, function: Function) -> bool {
        match function {
            Function::Accept | Function::History => self.phase >= Phase::Acquire,
            _ => self.phase == Phase::Steady,
        }
    }

    fn queue(&mut self, envelope: Envelope) {
        if self.pending.len() >= self.config.pending_limit {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(function = %dropped.function, "pending queue full, dropped oldest");
            }
        }
        self.pending.push_back(envelope);
    }

    async fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let waiting = std::mem::take(&mut self.pending);
        for envelope in waiting {
            if self.accepts(envelope.function) {
                self.dispatch(envelope).await;
            } else {
                self.pending.push_back(envelope);
            }
        }
    }

    async fn receive(&mut self, envelope: Envelope) {
        if envelope.process != PROCESS_NAME {
            debug!(process = %envelope.process, "not for the identity process");
            return;
        }
        if self.accepts(envelope.function) {
            self.dispatch(envelope).await;
        } else {
            self.queue(envelope);
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let Some(sender) = envelope.from_whom.clone() else {
            warn!(function = %envelope.function, "anonymous envelope");
            return;
        };
        if sender.uuid() == self.me() {
            return;
        }
        if let Recipient::Group(uuid) = envelope.to_whom {
            if self.group.as_ref().map(Group::uuid) != Some(uuid) {
                debug!(function = %envelope.function, "not for our group");
                return;
            }
        }
        let payload = match envelope.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(function = %envelope.function, from = %sender, "undecodable payload: {}", e);
                return;
            }
        };
        debug!(function = %envelope.function, from = %sender, "received");
        match payload {
            Payload::Announce(intro) => self.on_announce(intro).await,
            Payload::Accept(intro) => self.on_accept(intro).await,
            Payload::History(package) => self.on_history(&sender, *package),
            Payload::Diff(steps) => self.on_diff(&sender, &steps),
            Payload::Propose(candidate) => self.on_propose(candidate).await,
            Payload::Vote(vote) => self.on_vote(&sender, *vote),
            Payload::Confirm(candidate) => self.on_confirm(candidate).await,
            Payload::Update(group) => self.on_update(group).await,
        }
    }

    async fn on_announce(&mut self, intro: Introduction) {
        if !self.genuine(&intro) {
            return;
        }
        let identity = intro.identity.publish();
        if let Some(known) = self.history.peers().find_by_uuid(&identity.uuid()) {
            if *known == identity {
                info!(peer = %identity, "known peer re-announced, resending history");
                self.admitted(IdentityObj::new(&identity), true).await;
            } else {
                warn!(peer = %identity, "announce conflicts with a known peer");
            }
            return;
        }
        if self.reuses_keys(&identity) {
            warn!(peer = %identity, "newcomer reuses known keys, ignoring");
            return;
        }
        if self.collections.contains_key(&identity.uuid()) {
            debug!(peer = %identity, "vote already running");
            return;
        }
        if self.history.is_blacklisted(&identity) {
            warn!(peer = %identity, "blacklisted newcomer, ignoring");
            return;
        }
        let candidate = IdentityObj::new(&identity);
        self.potentials.insert(identity.uuid(), intro.capabilities);
        let votes = self.start_collection(candidate.clone());
        self.cast_vote(candidate.clone(), VoteSink::Collection(votes));
        if let Some(to) = self.group_recipient() {
            self.send(Payload::Propose(candidate), to).await;
        }
        info!(candidate = %identity, "proposed newcomer");
    }

    async fn on_accept(&mut self, intro: Introduction) {
        if !self.genuine(&intro) {
            return;
        }
        let identity = intro.identity.publish();
        if self.phase != Phase::Acquire {
            warn!(from = %identity, phase = ?self.phase, "unsolicited access grant, ignoring");
            return;
        }
        info!(by = %identity, "access granted");
        self.potentials.insert(identity.uuid(), intro.capabilities);
        self.add_peer(&identity).await;
    }

    fn on_history(&mut self, sender: &Identity, package: HistoryPackage) {
        let Some(signer) = self.history.peers().find_by_uuid(&sender.uuid()).cloned() else {
            warn!(from = %sender, "history from a stranger, ignoring");
            return;
        };
        let steps = match self.history.hear(&package.steps, &package.signature, &signer) {
            Ok(steps) => steps,
            Err(e) => {
                warn!(from = %sender, "unusable history: {}", e);
                return;
            }
        };
        if self.phase == Phase::Acquire {
            debug!(from = %sender, steps = steps.len(), "history offered");
            self.offers.push(Offer {
                steps,
                group: package.group,
                members: package.members,
            });
        } else {
            let diff = self.merge_history(&steps);
            debug!(from = %sender, diff = diff.len(), "merged late history");
            self.publish_snapshots();
        }
    }

    fn on_diff(&mut self, sender: &Identity, steps: &[StepRecord]) {
        match self.history.apply_diff(steps) {
            Ok(true) => {
                info!(from = %sender, length = self.history.length(), "merged history diff");
                self.publish_snapshots();
            }
            Ok(false) => warn!(from = %sender, "rejected history diff"),
            Err(e) => warn!(from = %sender, "unusable history diff: {}", e),
        }
    }

    async fn on_propose(&mut self, candidate: IdentityObj) {
        let identity = candidate.identity();
        if identity.uuid() == self.me() {
            return;
        }
        if self.history.peers().contains(&identity.uuid()) {
            debug!(candidate = %identity, "proposal for an existing peer");
            return;
        }
        if self.reuses_keys(identity) {
            warn!(candidate = %identity, "candidate reuses known keys, not voting");
            return;
        }
        self.cast_vote(candidate, VoteSink::Group);
    }

    fn on_vote(&mut self, sender: &Identity, vote: Vote) {
        if vote.proof.voter != sender.uuid() {
            warn!(from = %sender, "vote cast on behalf of another peer");
            return;
        }
        let Some(known) = self.history.peers().find_by_uuid(&sender.uuid()) else {
            warn!(from = %sender, "vote from an unknown peer");
            return;
        };
        if !known.verify(&vote.proof.to_bytes(), &vote.signature) {
            warn!(from = %sender, "bad vote signature");
            return;
        }
        let candidate = vote.candidate.identity().uuid();
        match self.collections.get(&candidate) {
            Some(collection) => {
                if collection.votes.try_send(vote).is_err() {
                    debug!(from = %sender, "vote collection already closed");
                }
            }
            None => debug!(from = %sender, "vote on a candidate we are not collecting"),
        }
    }

    async fn on_confirm(&mut self, candidate: IdentityObj) {
        let identity = candidate.identity().clone();
        if identity.uuid() == self.me() {
            debug!("our own admission confirmed");
            return;
        }
        if !self.potentials.contains_key(&identity.uuid()) {
            debug!(peer = %identity, "confirmation for an unknown candidate");
            return;
        }
        self.add_peer(&identity).await;
    }

    async fn on_update(&mut self, incoming: Group) {
        if incoming.public_only() {
            warn!(group = %incoming.nickname(), "group update without its key");
            return;
        }
        let Some(ours) = self.group.as_ref() else {
            debug!("group update before joining a group");
            return;
        };
        if incoming.outranks(ours) {
            info!(group = %incoming.nickname(), members = incoming.len(), "adopting group update");
            self.group = Some(incoming);
            self.persist_group();
            self.publish_snapshots();
        } else if ours.outranks(&incoming) {
            debug!(group = %incoming.nickname(), "countering an inferior group update");
            let ours = ours.clone();
            self.send_update(&ours).await;
        } else {
            debug!(group = %incoming.nickname(), "ignoring equal group update");
        }
    }

    async fn choose_group(&mut self) {
        let mut offers = std::mem::take(&mut self.offers);
        let cached = self.cached_group.take();
        let pick = offers
            .iter()
            .position(|offer| Some(&offer.group) == cached.as_ref())
            .or_else(|| {
                offers
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, offer)| offer.steps.len())
                    .map(|(idx, _)| idx)
            });

        let me = self.history.myself().clone();
        let mut diff = Vec::new();
        let mut group = match pick {
            Some(idx) => {
                let offer = offers.swap_remove(idx);
                info!(group = %offer.group.nickname(), steps = offer.steps.len(), "joining group");
                diff = self.merge_history(&offer.steps);
                self.learn_members(&offer.members);
                offer.group
            }
            None => match cached {
                Some(group) => {
                    info!(group = %group.nickname(), "resuming cached group");
                    group
                }
                None => {
                    let group = Group::initialize(Vec::new(), &Group::random_nickname());
                    info!(group = %group.nickname(), "starting a new group");
                    group
                }
            },
        };
        group.add_address(me.uuid(), me.address());
        self.group = Some(group);
        self.persist_group();
        self.phase = Phase::Steady;

        if !diff.is_empty() {
            if let Some(to) = self.group_recipient() {
                self.send(Payload::Diff(diff), to).await;
            }
        }
        self.publish_snapshots();
    }

    /// Merge a member's history. Returns the diff to forward.
    fn merge_history(&mut self, steps: &[StepRecord]) -> Vec<StepRecord> {
        match self.history.catch_up(steps) {
            Ok(diff) => diff,
            Err(e) => {
                warn!("could not merge history: {}", e);
                Vec::new()
            }
        }
    }

    /// Record the members listed by the peer that admitted us.
    fn learn_members(&mut self, members: &[Identity]) {
        let me = self.me();
        for member in members.iter().filter(|member| member.uuid() != me) {
            if self.reuses_keys(member) {
                warn!(peer = %member, "listed member reuses known keys, skipping");
                continue;
            }
            if let Err(e) = self.history.insert_peer(member, Peers::mid_level()) {
                warn!(peer = %member, "could not record member: {}", e);
            }
        }
        self.persist_peers();
    }

    /// Prove and sign the local vote on the blocking pool, then hand it to
    /// `sink`. The proof is abandoned when the process stops.
    fn cast_vote(&mut self, candidate: IdentityObj, sink: VoteSink) {
        let Some(prover) = self.history.prover(&candidate) else {
            return;
        };
        let me = self.history.myself().clone();
        let stop = Arc::clone(&self.stop);
        let report = self.internal_tx.clone();
        self.track(tokio::spawn(async move {
            let subject = Candidate::of(&candidate);
            let proved =
                tokio::task::spawn_blocking(move || prover.prove_until(&subject, &stop)).await;
            let proof = match proved {
                Ok(Some(proof)) => proof,
                Ok(None) => {
                    debug!(candidate = %candidate.identity(), "vote abandoned");
                    return;
                }
                Err(e) => {
                    error!(candidate = %candidate.identity(), "vote proof failed: {}", e);
                    return;
                }
            };
            let signature = match me.sign(&proof.to_bytes()) {
                Ok(signature) => signature,
                Err(e) => {
                    error!("cannot sign vote: {}", e);
                    return;
                }
            };
            let vote = Vote {
                candidate,
                proof,
                signature,
            };
            let delivered = match sink {
                VoteSink::Collection(votes) => votes.send(vote).await.is_ok(),
                VoteSink::Group => report.send(Internal::Voted(vote)).await.is_ok(),
            };
            if !delivered {
                debug!("vote ready after its collection closed");
            }
        }));
    }

    /// Open the vote on a newcomer. Returns the sender feeding it votes.
    fn start_collection(&mut self, candidate: IdentityObj) -> mpsc::Sender<Vote> {
        let uuid = candidate.identity().uuid();
        let expected = self.history.peers().len() + 1;
        let (votes, rx) = mpsc::channel(expected + 8);
        let task = tokio::spawn(collect_votes(
            candidate,
            expected,
            rx,
            self.config.vote_timeout,
            self.internal_tx.clone(),
        ));
        self.collections.insert(
            uuid,
            Collection {
                votes: votes.clone(),
                task,
            },
        );
        votes
    }

    async fn tally(&mut self, candidate: IdentityObj, votes: Vec<Vote>) {
        let identity = candidate.identity().clone();
        self.collections.remove(&identity.uuid());
        if self.history.peers().contains(&identity.uuid()) {
            debug!(candidate = %identity, "already admitted elsewhere");
            return;
        }
        for vote in &votes {
            self.history.verify(&candidate, &vote.proof, &vote.signature);
        }
        if self.history.finalize(&candidate) {
            info!(candidate = %identity, votes = votes.len(), "newcomer approved");
            self.admitted(candidate, false).await;
        } else {
            info!(candidate = %identity, votes = votes.len(), "newcomer rejected");
            self.potentials.remove(&identity.uuid());
        }
    }

    /// Tell the group and the newcomer about an admission. An amnesiac peer is
    /// only re-sent what it forgot.
    async fn admitted(&mut self, candidate: IdentityObj, amnesia: bool) {
        let Some(group_to) = self.group_recipient() else {
            warn!("cannot admit before joining a group");
            return;
        };
        let identity = candidate.identity().clone();
        self.send(Payload::Confirm(candidate), group_to).await;
        if !amnesia {
            self.add_peer(&identity).await;
        }
        let to = Recipient::peer(&identity);
        self.send(Payload::Accept(self.introduction()), to.clone()).await;
        match self.history_package() {
            Ok(package) => self.send(Payload::History(Box::new(package)), to).await,
            Err(e) => error!(peer = %identity, "cannot package history: {}", e),
        }
    }

    async fn add_peer(&mut self, identity: &Identity) {
        let update = self.group.as_mut().map(|group| {
            group.add_address(identity.uuid(), identity.address());
            group.clone()
        });
        if let Some(update) = update {
            self.persist_group();
            self.send_update(&update).await;
        }
        match self.history.insert_peer(identity, Peers::mid_level()) {
            Ok(true) => info!(peer = %identity, length = self.history.length(), "peer added"),
            Ok(false) => debug!(peer = %identity, "peer already known"),
            Err(e) => {
                error!(peer = %identity, "could not record peer: {}", e);
                return;
            }
        }
        let capabilities = self.potentials.remove(&identity.uuid()).unwrap_or_default();
        self.peer_capabilities.insert(identity.uuid(), capabilities);
        self.persist_peers();
        self.publish_snapshots();
    }

    async fn send_update(&self, group: &Group) {
        let recipients: Vec<Recipient> = self
            .history
            .peers()
            .my_level_peers()
            .into_iter()
            .map(Recipient::peer)
            .collect();
        for to in recipients {
            self.send(Payload::Update(group.clone()), to).await;
        }
    }

    async fn send(&self, payload: Payload, to: Recipient) {
        let function = payload.function();
        let envelope = match Envelope::new(&payload, to, self.history.myself()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(%function, "cannot encode: {}", e);
                return;
            }
        };
        match tokio::time::timeout(self.config.cadence, self.network.send(envelope)).await {
            Ok(Ok(())) => debug!(%function, "sent"),
            Ok(Err(_)) => warn!(%function, "network closed, message lost"),
            Err(_) => warn!(%function, "network busy, message dropped"),
        }
    }

    fn history_package(&self) -> Result<HistoryPackage> {
        let (steps, signature) = self.history.share()?;
        let group = self.group.clone().ok_or(Error::UnmetDependency("group"))?;
        Ok(HistoryPackage {
            steps,
            signature,
            group,
            members: self.history.members(),
        })
    }

    fn introduction(&self) -> Introduction {
        Introduction {
            identity: self.history.myself().publish(),
            package_hash: self.config.package_hash.clone(),
            capabilities: self.capabilities.clone().unwrap_or_default(),
        }
    }

    fn genuine(&self, intro: &Introduction) -> bool {
        if intro.package_hash != self.config.package_hash {
            error!(peer = %intro.identity, "counterfeit package, ignoring");
            return false;
        }
        true
    }

    fn reuses_keys(&self, identity: &Identity) -> bool {
        std::iter::once(self.history.myself())
            .chain(self.history.peers().iter())
            .any(|known| known.uuid() != identity.uuid() && known.shares_keys_with(identity))
    }

    fn group_recipient(&self) -> Option<Recipient> {
        self.group.as_ref().map(|group| Recipient::Group(group.uuid()))
    }

    fn me(&self) -> Uuid {
        self.history.myself().uuid()
    }

    fn persist_peers(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_peers(self.history.peers()) {
                error!("failed to save peers: {}", e);
            }
        }
    }

    fn persist_group(&self) {
        if let (Some(store), Some(group)) = (&self.store, &self.group) {
            if let Err(e) = store.save_group(group) {
                error!("failed to save group: {}", e);
            }
        }
    }

    fn publish_snapshots(&self) {
        if self.observers.is_empty() {
            return;
        }
        let mut snapshots = vec![
            Snapshot::Peers(Box::new(self.history.peers().clone())),
            Snapshot::History {
                length: self.history.length(),
                root: self.history.root_digest(),
            },
            Snapshot::Capabilities(self.peer_capabilities.clone()),
        ];
        if let Some(group) = &self.group {
            snapshots.push(Snapshot::Group(group.publish()));
        }
        for observer in &self.observers {
            for snapshot in &snapshots {
                if let Err(e) = observer.try_send(snapshot.clone()) {
                    warn!("snapshot dropped: {}", e);
                }
            }
        }
    }
}

/// Gather votes on one candidate until every expected voter has voted or the
/// window closes, then hand them back to the loop.
async fn collect_votes(
    candidate: IdentityObj,
    expected: usize,
    mut incoming: mpsc::Receiver<Vote>,
    window: Duration,
    report: mpsc::Sender<Internal>,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut votes: Vec<Vote> = Vec::new();
    while votes.len() < expected {
        tokio::select! {
            _ = &mut deadline => break,
            vote = incoming.recv() => match vote {
                Some(vote) => {
                    match votes.iter_mut().find(|v| v.proof.voter == vote.proof.voter) {
                        Some(slot) => *slot = vote,
                        None => votes.push(vote),
                    }
                }
                None => break,
            },
        }
    }
    debug!(candidate = %candidate.identity(), votes = votes.len(), expected, "vote collection closed");
    if report.send(Internal::Tally { candidate, votes }).await.is_err() {
        debug!("identity loop gone before tally");
    }
}
