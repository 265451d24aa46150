//! On-disk identity records.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::group::Group;
use crate::identity::Identity;
use crate::peers::Peers;

pub const IDENTITY_FILE: &str = "identity.json";
pub const PEERS_FILE: &str = "peers.json";
pub const GROUP_FILE: &str = "group.json";

/// JSON records in a per-node directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Open (creating if needed) a record directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_identity(&self) -> Result<Option<Identity>> {
        self.load(IDENTITY_FILE)
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<()> {
        self.save(IDENTITY_FILE, identity)
    }

    pub fn load_peers(&self) -> Result<Option<Peers>> {
        self.load(PEERS_FILE)
    }

    pub fn save_peers(&self, peers: &Peers) -> Result<()> {
        self.save(PEERS_FILE, peers)
    }

    pub fn load_group(&self) -> Result<Option<Group>> {
        self.load(GROUP_FILE)
    }

    pub fn save_group(&self, group: &Group) -> Result<()> {
        self.save(GROUP_FILE, group)
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "saved record");
        Ok(())
    }
}
