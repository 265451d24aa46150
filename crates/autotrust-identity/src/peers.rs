//! Known peers arranged by network hierarchy and by valuation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::identity::{bare_address, Identity};

/// Hierarchy tiers: 0 = border, 1 = mid, 2 = inner.
pub const LEVELS: usize = 3;

/// Valuation tiers: 0 = most trusted.
pub const VALUES: usize = 10;

/// Where one peer sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub level: usize,
    pub tier: usize,
}

/// Peer registry.
///
/// Every known identity sits in exactly one hierarchy level and one valuation
/// tier. Tiers are keyed by nickname; a nickname already taken by another
/// uuid gets a uuid suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peers {
    all: BTreeMap<Uuid, Identity>,
    placement: BTreeMap<Uuid, Placement>,
    names: BTreeMap<Uuid, String>,
    hierarchy: Vec<BTreeMap<String, Uuid>>,
    valuation: Vec<BTreeMap<String, Uuid>>,
    listing: BTreeMap<String, Uuid>,
}

impl Default for Peers {
    fn default() -> Self {
        Self::new()
    }
}

impl Peers {
    pub fn new() -> Self {
        Self {
            all: BTreeMap::new(),
            placement: BTreeMap::new(),
            names: BTreeMap::new(),
            hierarchy: vec![BTreeMap::new(); LEVELS],
            valuation: vec![BTreeMap::new(); VALUES],
            listing: BTreeMap::new(),
        }
    }

    /// Default hierarchy level for new peers.
    pub const fn mid_level() -> usize {
        LEVELS / 2
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.all.contains_key(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.all.values()
    }

    pub fn placement(&self, uuid: &Uuid) -> Option<Placement> {
        self.placement.get(uuid).copied()
    }

    /// Add a peer at `level` (default mid) and the lowest valuation tier.
    /// A known peer is refreshed and moved to `level` instead; returns whether
    /// the peer was new.
    pub fn add(&mut self, identity: Identity, level: Option<usize>) -> bool {
        let level = level.unwrap_or_else(Self::mid_level).min(LEVELS - 1);
        let uuid = identity.uuid();
        if self.contains(&uuid) {
            self.relist(&identity);
            self.all.insert(uuid, identity);
            self.move_to(&uuid, level);
            return false;
        }

        let name = self.free_name(&identity);
        let tier = VALUES - 1;
        self.hierarchy[level].insert(name.clone(), uuid);
        self.valuation[tier].insert(name.clone(), uuid);
        self.listing
            .insert(bare_address(identity.address()).to_string(), uuid);
        self.names.insert(uuid, name);
        self.placement.insert(uuid, Placement { level, tier });
        debug!(peer = %identity, level, "added peer");
        self.all.insert(uuid, identity);
        true
    }

    /// Forget a peer entirely.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Identity> {
        let identity = self.all.remove(uuid)?;
        if let (Some(name), Some(place)) = (self.names.remove(uuid), self.placement.remove(uuid)) {
            self.hierarchy[place.level].remove(&name);
            self.valuation[place.tier].remove(&name);
        }
        let address = bare_address(identity.address());
        if self.listing.get(address) == Some(uuid) {
            self.listing.remove(address);
        }
        debug!(peer = %identity, "removed peer");
        Some(identity)
    }

    /// Move one valuation tier toward 0. Unknown identities are added.
    pub fn promote(&mut self, identity: &Identity) {
        let uuid = identity.uuid();
        let Some(place) = self.placement(&uuid) else {
            self.add(identity.clone(), None);
            return;
        };
        if place.tier > 0 {
            self.retier(&uuid, place.tier - 1);
        }
    }

    /// Move one valuation tier away from 0; demoting from the last tier
    /// removes the peer. Returns whether the peer is still known.
    pub fn demote(&mut self, uuid: &Uuid) -> bool {
        let Some(place) = self.placement(uuid) else {
            return false;
        };
        if place.tier + 1 >= VALUES {
            self.remove(uuid);
            return false;
        }
        self.retier(uuid, place.tier + 1);
        true
    }

    /// Relocate within the hierarchy.
    pub fn move_to(&mut self, uuid: &Uuid, level: usize) {
        let level = level.min(LEVELS - 1);
        let (Some(name), Some(place)) = (self.names.get(uuid), self.placement.get_mut(uuid)) else {
            return;
        };
        if place.level == level {
            return;
        }
        self.hierarchy[place.level].remove(name);
        self.hierarchy[level].insert(name.clone(), *uuid);
        place.level = level;
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<&Identity> {
        self.all.get(uuid)
    }

    pub fn find_by_nickname(&self, nickname: &str) -> Option<&Identity> {
        self.hierarchy
            .iter()
            .find_map(|level| level.get(nickname))
            .and_then(|uuid| self.all.get(uuid))
    }

    /// Lookup by network address; any `/suffix` is ignored.
    pub fn find_by_address(&self, address: &str) -> Option<&Identity> {
        self.listing
            .get(bare_address(address))
            .and_then(|uuid| self.all.get(uuid))
    }

    /// Up to `n` peers, most trusted first.
    pub fn top_n(&self, n: usize) -> Vec<&Identity> {
        self.valuation
            .iter()
            .flat_map(|tier| tier.values())
            .filter_map(|uuid| self.all.get(uuid))
            .take(n)
            .collect()
    }

    pub fn level_peers(&self, level: usize) -> Vec<&Identity> {
        self.hierarchy
            .get(level)
            .into_iter()
            .flat_map(|tier| tier.values())
            .filter_map(|uuid| self.all.get(uuid))
            .collect()
    }

    /// Peers at the local node's own (mid) level.
    pub fn my_level_peers(&self) -> Vec<&Identity> {
        self.level_peers(Self::mid_level())
    }

    fn retier(&mut self, uuid: &Uuid, tier: usize) {
        let (Some(name), Some(place)) = (self.names.get(uuid), self.placement.get_mut(uuid)) else {
            return;
        };
        self.valuation[place.tier].remove(name);
        self.valuation[tier].insert(name.clone(), *uuid);
        place.tier = tier;
    }

    fn relist(&mut self, identity: &Identity) {
        if let Some(old) = self.all.get(&identity.uuid()) {
            let address = bare_address(old.address());
            if self.listing.get(address) == Some(&identity.uuid()) {
                self.listing.remove(address);
            }
        }
        self.listing
            .insert(bare_address(identity.address()).to_string(), identity.uuid());
    }

    fn free_name(&self, identity: &Identity) -> String {
        let nickname = identity.nickname();
        let taken = self
            .hierarchy
            .iter()
            .any(|level| level.contains_key(nickname));
        if taken {
            format!("{nickname}#{}", &identity.uuid().simple().to_string()[..8])
        } else {
            nickname.to_string()
        }
    }
}
