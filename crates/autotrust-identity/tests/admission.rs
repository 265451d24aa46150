//! End-to-end admission between identity processes wired through a
//! `LocalRouter`.

use std::time::Duration;

use autotrust_identity::{
    Group, Identity, IdentityConfig, IdentityHandle, IdentityProcess, LocalRouter, Peers,
    Snapshot, Subsystems,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PACKAGE: &str = "autotrust-test-package";

fn config() -> IdentityConfig {
    IdentityConfig::default()
        .with_init_timeout(Duration::from_millis(150))
        .with_vote_timeout(Duration::from_millis(500))
        .with_cadence(Duration::from_millis(10))
        .with_package_hash(PACKAGE)
}

/// Latest state reported by one node.
#[derive(Default)]
struct Seen {
    peers: Option<Peers>,
    group: Option<Group>,
    length: usize,
}

struct Node {
    me: Identity,
    handle: IdentityHandle,
    snapshots: mpsc::Receiver<Snapshot>,
    seen: Seen,
    task: JoinHandle<autotrust_identity::Result<()>>,
}

impl Node {
    async fn start(router: &LocalRouter, nickname: &str, address: &str) -> Self {
        let me = Identity::initialize(&format!("{nickname} Example"), nickname, address);
        let (network, _forward) = router.outbound(&me);
        let (observer, snapshots) = mpsc::channel(1024);
        let subsystems = Subsystems {
            network: Some(network),
            observers: vec![observer],
        };
        let (process, handle) =
            IdentityProcess::new(me.clone(), Peers::new(), config(), subsystems).unwrap();
        router.register(&me, handle.inbox()).await;
        let task = process.spawn();
        handle.capabilities(vec![format!("{nickname}-service")]).await.unwrap();
        Self {
            me,
            handle,
            snapshots,
            seen: Seen::default(),
            task,
        }
    }

    /// Drain snapshots until `done` holds or a few seconds pass.
    async fn until(&mut self, done: impl Fn(&Seen) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(&self.seen) {
            match tokio::time::timeout_at(deadline, self.snapshots.recv()).await {
                Ok(Some(Snapshot::Peers(peers))) => self.seen.peers = Some(*peers),
                Ok(Some(Snapshot::Group(group))) => self.seen.group = Some(group),
                Ok(Some(Snapshot::History { length, .. })) => self.seen.length = length,
                Ok(Some(Snapshot::Capabilities(_))) => {}
                _ => return false,
            }
        }
        true
    }

    async fn stop(self) {
        self.handle.quit().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn knows(seen: &Seen, who: &Identity) -> bool {
    seen.peers
        .as_ref()
        .is_some_and(|peers| peers.contains(&who.uuid()))
}

fn group_has(seen: &Seen, who: &Identity) -> bool {
    seen.group
        .as_ref()
        .is_some_and(|group| group.addresses().contains(&who.address()))
}

#[tokio::test]
async fn newcomer_joins_existing_member() {
    let router = LocalRouter::new();
    let mut alice = Node::start(&router, "alice", "10.0.0.1").await;
    assert!(alice.until(|seen| seen.group.is_some()).await);

    let mut newbie = Node::start(&router, "newbie", "10.0.0.2").await;
    let newbie_id = newbie.me.clone();
    assert!(
        alice
            .until(|seen| seen.length == 2 && knows(seen, &newbie_id) && group_has(seen, &newbie_id))
            .await
    );

    let alice_id = alice.me.clone();
    let alice_group = alice.seen.group.as_ref().map(Group::uuid);
    assert!(
        newbie
            .until(|seen| knows(seen, &alice_id) && seen.group.as_ref().map(Group::uuid) == alice_group)
            .await
    );

    // the newcomer's diff carries nothing alice lacks
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(snapshot) = alice.snapshots.try_recv() {
        if let Snapshot::History { length, .. } = snapshot {
            alice.seen.length = length;
        }
    }
    assert_eq!(alice.seen.length, 2);

    newbie.stop().await;
    alice.stop().await;
}

#[tokio::test]
async fn group_votes_on_second_newcomer() {
    let router = LocalRouter::new();
    let mut alice = Node::start(&router, "alice", "10.0.0.1").await;
    assert!(alice.until(|seen| seen.group.is_some()).await);

    let mut bob = Node::start(&router, "bob", "10.0.0.2").await;
    let alice_id = alice.me.clone();
    assert!(bob.until(|seen| seen.group.is_some() && knows(seen, &alice_id)).await);

    let mut carol = Node::start(&router, "carol", "10.0.0.3").await;
    let (bob_id, carol_id) = (bob.me.clone(), carol.me.clone());

    assert!(alice.until(|seen| knows(seen, &carol_id) && group_has(seen, &carol_id)).await);
    assert!(bob.until(|seen| knows(seen, &carol_id)).await);
    assert!(
        carol
            .until(|seen| knows(seen, &alice_id) && knows(seen, &bob_id) && seen.group.is_some())
            .await
    );

    let group = |node: &Node| node.seen.group.as_ref().map(Group::uuid);
    assert_eq!(group(&alice), group(&carol));

    carol.stop().await;
    bob.stop().await;
    alice.stop().await;
}

#[tokio::test]
async fn counterfeit_package_is_not_admitted() {
    let router = LocalRouter::new();
    let mut alice = Node::start(&router, "alice", "10.0.0.1").await;
    assert!(alice.until(|seen| seen.group.is_some()).await);

    let forger = Identity::initialize("Mallory Example", "mallory", "10.0.0.66");
    let (network, _forward) = router.outbound(&forger);
    let (observer, mut snapshots) = mpsc::channel(64);
    let (process, handle) = IdentityProcess::new(
        forger.clone(),
        Peers::new(),
        config().with_package_hash("forged"),
        Subsystems {
            network: Some(network),
            observers: vec![observer],
        },
    )
    .unwrap();
    router.register(&forger, handle.inbox()).await;
    let task = process.spawn();
    handle.capabilities(Vec::new()).await.unwrap();

    // mallory ends up alone in a group of its own
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let own_group = loop {
        match tokio::time::timeout_at(deadline, snapshots.recv()).await {
            Ok(Some(Snapshot::Group(group))) => break Some(group),
            Ok(Some(_)) => continue,
            _ => break None,
        }
    };
    let own_group = own_group.unwrap();
    assert_eq!(own_group.len(), 1);
    assert_ne!(Some(own_group.uuid()), alice.seen.group.as_ref().map(Group::uuid));
    assert!(!knows(&alice.seen, &forger));

    handle.quit().await.unwrap();
    task.await.unwrap().unwrap();
    alice.stop().await;
}
