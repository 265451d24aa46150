//! AutonomousTrust Node
//!
//! Boots a set of identity processes wired through a [`LocalRouter`], one
//! after another, and keeps a running view of what each one sees.

use std::sync::Arc;
use std::time::Duration;

use autotrust_identity::{
    ConfigStore, Identity, IdentityConfig, IdentityHandle, IdentityProcess, LocalRouter,
    Peers, Result, Snapshot, Subsystems, MAILBOX_CAPACITY,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Configuration for a node cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Number of identity processes to start.
    pub nodes: usize,

    /// Delay between starting consecutive processes.
    pub stagger: Duration,

    /// Stop after this long; `None` runs until interrupted.
    pub run_for: Option<Duration>,

    pub identity: IdentityConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let identity = IdentityConfig::default();
        Self {
            nodes: 3,
            stagger: identity.init_timeout * 3,
            run_for: None,
            identity,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let identity = IdentityConfig::from_env();
        let nodes = std::env::var("AUTOTRUST_NODES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let stagger = std::env::var("AUTOTRUST_STAGGER_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(identity.init_timeout * 3);
        let run_for = std::env::var("AUTOTRUST_RUN_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs);
        Self {
            nodes,
            stagger,
            run_for,
            identity,
        }
    }
}

/// What one process last reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeView {
    pub nickname: String,
    pub peers: usize,
    pub group_members: usize,
    pub history_length: usize,
}

struct Member {
    handle: IdentityHandle,
    task: JoinHandle<Result<()>>,
    watcher: JoinHandle<()>,
}

/// Identity processes sharing one in-process router.
pub struct Cluster {
    config: NodeConfig,
    router: LocalRouter,
    members: Vec<Member>,
    views: Arc<RwLock<Vec<NodeView>>>,
}

impl Cluster {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            router: LocalRouter::new(),
            members: Vec::new(),
            views: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Launch `config.nodes` processes, `config.stagger` apart.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let mut cluster = Self::new(config);
        for idx in 0..cluster.config.nodes {
            if idx > 0 {
                tokio::time::sleep(cluster.config.stagger).await;
            }
            cluster.launch(&format!("node{idx}")).await?;
        }
        Ok(cluster)
    }

    /// Boot one identity process. Returns its index.
    pub async fn launch(&mut self, nickname: &str) -> Result<usize> {
        let idx = self.members.len();
        let address = format!("10.0.0.{}", idx + 1);
        let config = match &self.config.identity.cfg_dir {
            Some(dir) => self.config.identity.clone().with_cfg_dir(dir.join(nickname)),
            None => self.config.identity.clone(),
        };
        let (identity, peers) = load_or_create(&config, nickname, &address)?;

        let (network, _forward) = self.router.outbound(&identity);
        let (observer, snapshots) = mpsc::channel(MAILBOX_CAPACITY);
        let subsystems = Subsystems {
            network: Some(network),
            observers: vec![observer],
        };
        let (process, handle) = IdentityProcess::new(identity.clone(), peers, config, subsystems)?;
        self.router.register(&identity, handle.inbox()).await;

        self.views.write().await.push(NodeView {
            nickname: nickname.to_string(),
            ..NodeView::default()
        });
        let watcher = tokio::spawn(watch(idx, snapshots, Arc::clone(&self.views)));
        let task = process.spawn();
        handle.capabilities(vec!["identity".to_string()]).await?;
        info!(node = %identity, "launched identity process");

        self.members.push(Member {
            handle,
            task,
            watcher,
        });
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub async fn view(&self, idx: usize) -> Option<NodeView> {
        self.views.read().await.get(idx).cloned()
    }

    pub async fn views(&self) -> Vec<NodeView> {
        self.views.read().await.clone()
    }

    /// Stop every process and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        for member in &self.members {
            member.handle.quit().await?;
        }
        for member in self.members {
            match member.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("identity process failed: {}", e),
                Err(e) => error!("identity process panicked: {}", e),
            }
            member.watcher.abort();
        }
        Ok(())
    }
}

/// The identity and peers persisted under the config directory, or fresh ones.
pub fn load_or_create(config: &IdentityConfig, nickname: &str, address: &str) -> Result<(Identity, Peers)> {
    let fullname = format!("{nickname} node");
    let Some(dir) = &config.cfg_dir else {
        return Ok((Identity::initialize(&fullname, nickname, address), Peers::new()));
    };
    let store = ConfigStore::open(dir)?;
    let identity = match store.load_identity()? {
        Some(identity) => {
            info!(node = %identity, "loaded identity");
            identity
        }
        None => {
            let identity = Identity::initialize(&fullname, nickname, address);
            store.save_identity(&identity)?;
            identity
        }
    };
    let peers = store.load_peers()?.unwrap_or_default();
    Ok((identity, peers))
}

async fn watch(idx: usize, mut snapshots: mpsc::Receiver<Snapshot>, views: Arc<RwLock<Vec<NodeView>>>) {
    while let Some(snapshot) = snapshots.recv().await {
        let mut views = views.write().await;
        let Some(view) = views.get_mut(idx) else {
            continue;
        };
        match snapshot {
            Snapshot::Peers(peers) => view.peers = peers.len(),
            Snapshot::Group(group) => view.group_members = group.len(),
            Snapshot::History { length, root } => {
                if length != view.history_length {
                    info!(node = %view.nickname, length, root = ?root, "history changed");
                }
                view.history_length = length;
            }
            Snapshot::Capabilities(_) => {}
        }
    }
}
