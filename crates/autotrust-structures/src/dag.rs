//! Branching history of hash-linked steps.
//!
//! Steps live in an append-only arena and are never mutated. A branch is a
//! named head pointer into the arena; forking just records another head. A
//! `None` parent means the step hangs directly off genesis.
//!
//! Replaying a step onto a parent that already carries the same step reuses
//! the existing arena entry, so re-merging known history is free.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DagError;
use crate::hash::Digest;

/// Result type for DAG operations.
pub type Result<T> = std::result::Result<T, DagError>;

/// The canonical branch.
pub const MAIN: &str = "main";

/// Index of a step in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(usize);

/// One link of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub uuid: Uuid,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Merkle root digest at this point in history.
    pub payload: Digest,
    pub parent: Option<StepId>,
}

/// Transmissible form of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub uuid: Uuid,
    pub timestamp: u64,
    pub payload: Digest,
    pub parent_uuid: Option<Uuid>,
}

/// Where a new branch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source<'a> {
    /// The head of an existing branch.
    Branch(&'a str),
    /// Directly off genesis.
    Genesis,
}

/// Current time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Directed acyclic graph of steps with named branches.
#[derive(Debug, Clone)]
pub struct StepDag {
    steps: Vec<Step>,
    index: HashMap<(Uuid, Option<StepId>), StepId>,
    heads: BTreeMap<String, Option<StepId>>,
}

impl Default for StepDag {
    fn default() -> Self {
        Self::new()
    }
}

impl StepDag {
    /// A DAG holding only an empty `main` branch.
    pub fn new() -> Self {
        let mut heads = BTreeMap::new();
        heads.insert(MAIN.to_string(), None);
        Self {
            steps: Vec::new(),
            index: HashMap::new(),
            heads,
        }
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0]
    }

    /// Wire form of a stored step.
    pub fn record(&self, id: StepId) -> StepRecord {
        let step = self.step(id);
        StepRecord {
            uuid: step.uuid,
            timestamp: step.timestamp,
            payload: step.payload,
            parent_uuid: step.parent.map(|p| self.step(p).uuid),
        }
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.heads.contains_key(name)
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.heads.keys().map(String::as_str)
    }

    /// Head step of a branch; `None` if the branch is still at genesis.
    pub fn head(&self, branch: &str) -> Result<Option<StepId>> {
        self.heads
            .get(branch)
            .copied()
            .ok_or_else(|| DagError::InvalidBranch(branch.to_string()))
    }

    /// Number of steps from genesis to the branch head.
    pub fn len(&self, branch: &str) -> Result<usize> {
        Ok(self.walk(self.head(branch)?).count())
    }

    pub fn remove_branch(&mut self, name: &str) -> Result<()> {
        self.heads
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DagError::InvalidBranch(name.to_string()))
    }

    /// Append a fresh local step to a branch. The timestamp is bumped past
    /// the parent's if the clock lags.
    pub fn add_step(&mut self, payload: Digest, branch: &str) -> Result<StepId> {
        let parent = self.head(branch)?;
        let floor = parent.map_or(0, |p| self.step(p).timestamp + 1);
        let record = StepRecord {
            uuid: Uuid::new_v4(),
            timestamp: now_ms().max(floor),
            payload,
            parent_uuid: None,
        };
        let id = self.link(&record, parent);
        self.heads.insert(branch.to_string(), Some(id));
        Ok(id)
    }

    /// Append an existing step (keeping its uuid and timestamp) to a branch.
    pub fn append(&mut self, record: &StepRecord, branch: &str) -> Result<StepId> {
        let parent = self.head(branch)?;
        let id = self.link(record, parent);
        self.heads.insert(branch.to_string(), Some(id));
        Ok(id)
    }

    /// Start a new branch with `record`, diverging from `source`.
    pub fn branch(&mut self, name: &str, record: &StepRecord, source: Source<'_>) -> Result<StepId> {
        if self.has_branch(name) {
            return Err(DagError::BranchExists(name.to_string()));
        }
        let parent = match source {
            Source::Genesis => None,
            Source::Branch(source) => self.head(source)?,
        };
        let id = self.link(record, parent);
        self.heads.insert(name.to_string(), Some(id));
        Ok(id)
    }

    /// Steps from genesis to the branch head.
    pub fn chain(&self, branch: &str) -> Result<Vec<StepId>> {
        let mut chain: Vec<StepId> = self.walk(self.head(branch)?).collect();
        chain.reverse();
        Ok(chain)
    }

    /// First point of divergence between two branches: the index into both
    /// chains where they differ, and the last step they share. When one chain
    /// is a prefix of the other the index is the shorter length.
    pub fn diff(&self, branch: &str, target: &str) -> Result<(usize, Option<StepId>)> {
        let ours = self.chain(branch)?;
        let theirs = self.chain(target)?;
        let shorter = ours.len().min(theirs.len());
        let idx = (0..shorter)
            .find(|&i| self.step(ours[i]).uuid != self.step(theirs[i]).uuid)
            .unwrap_or(shorter);
        let root = idx.checked_sub(1).map(|i| theirs[i]);
        Ok((idx, root))
    }

    /// Fold `branch` into `target`: the unique tails of both are ordered by
    /// timestamp (ties by uuid) and replayed from the common root.
    pub fn merge(&mut self, branch: &str, target: &str, keep: bool) -> Result<()> {
        let ours = self.chain(branch)?;
        let theirs = self.chain(target)?;
        if branch == target {
            return Ok(());
        }
        let (idx, root) = self.diff(branch, target)?;

        let mut seen = HashSet::new();
        let mut tail: Vec<StepRecord> = ours[idx..]
            .iter()
            .chain(&theirs[idx..])
            .map(|id| self.record(*id))
            .collect();
        tail.sort_by(|a, b| (a.timestamp, a.uuid).cmp(&(b.timestamp, b.uuid)));
        tail.retain(|record| seen.insert(record.uuid));

        let mut current = root;
        for record in &tail {
            current = Some(self.link(record, current));
        }
        self.heads.insert(target.to_string(), current);
        if !keep {
            self.heads.remove(branch);
        }
        debug!(branch, target, replayed = tail.len(), "merged branch");
        Ok(())
    }

    /// Replay a received head-to-root step list as a new branch off genesis.
    pub fn ingest_branch(&mut self, steps: &[StepRecord], name: Option<&str>) -> Result<String> {
        self.replay_branch(steps, name, None)
    }

    /// Like [`ingest_branch`](Self::ingest_branch), but the branch starts at
    /// the oldest step's recorded parent, which must be known locally.
    pub fn graft_branch(&mut self, steps: &[StepRecord], name: Option<&str>) -> Result<String> {
        let oldest = steps.last().ok_or(DagError::EmptyBranch)?;
        let root = match oldest.parent_uuid {
            None => None,
            Some(parent) => Some(self.locate(parent).ok_or(DagError::UnknownStep(parent))?),
        };
        self.replay_branch(steps, name, root)
    }

    /// Incorporate a foreign step list into `main`. The branch is merged only
    /// if `validator` accepts it; otherwise it is discarded. Returns the
    /// received steps beyond the common ancestor (head to root), or nothing if
    /// the branch was rejected.
    pub fn catch_up<F>(&mut self, steps: &[StepRecord], validator: F) -> Result<Vec<StepRecord>>
    where
        F: FnOnce(&StepDag, &str) -> bool,
    {
        let name = self.ingest_branch(steps, None)?;
        let (_, root) = self.diff(&name, MAIN)?;
        let diff = self.recite(&name, root)?;
        if validator(&*self, &name) {
            self.merge(&name, MAIN, false)?;
            Ok(diff)
        } else {
            warn!(branch = %name, "rejected invalid branch");
            self.remove_branch(&name)?;
            Ok(Vec::new())
        }
    }

    /// Step records from the branch head back to (not including) `root`.
    pub fn recite(&self, branch: &str, root: Option<StepId>) -> Result<Vec<StepRecord>> {
        Ok(self
            .walk(self.head(branch)?)
            .take_while(|id| Some(*id) != root)
            .map(|id| self.record(id))
            .collect())
    }

    /// A step with this uuid, preferring one on `main`.
    pub fn locate(&self, uuid: Uuid) -> Option<StepId> {
        let main = self.heads.get(MAIN).copied().flatten();
        self.walk(main)
            .find(|id| self.step(*id).uuid == uuid)
            .or_else(|| {
                self.steps
                    .iter()
                    .position(|s| s.uuid == uuid)
                    .map(StepId)
            })
    }

    fn replay_branch(
        &mut self,
        steps: &[StepRecord],
        name: Option<&str>,
        root: Option<StepId>,
    ) -> Result<String> {
        if steps.is_empty() {
            return Err(DagError::EmptyBranch);
        }
        let name = match name {
            Some(name) if self.has_branch(name) => {
                return Err(DagError::BranchExists(name.to_string()))
            }
            Some(name) => name.to_string(),
            None => self.temp_name(),
        };
        let mut current = root;
        for record in steps.iter().rev() {
            current = Some(self.link(record, current));
        }
        self.heads.insert(name.clone(), current);
        Ok(name)
    }

    fn link(&mut self, record: &StepRecord, parent: Option<StepId>) -> StepId {
        if let Some(id) = self.index.get(&(record.uuid, parent)) {
            return *id;
        }
        let id = StepId(self.steps.len());
        self.steps.push(Step {
            uuid: record.uuid,
            timestamp: record.timestamp,
            payload: record.payload,
            parent,
        });
        self.index.insert((record.uuid, parent), id);
        id
    }

    fn walk(&self, from: Option<StepId>) -> impl Iterator<Item = StepId> + '_ {
        std::iter::successors(from, move |id| self.step(*id).parent)
    }

    fn temp_name(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let name: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(|c| char::from(c).to_ascii_lowercase())
                .collect();
            if !self.has_branch(&name) {
                return name;
            }
        }
    }
}
