//! In-process envelope delivery between identity processes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::{bare_address, Identity};
use crate::message::{Envelope, Inbound, Recipient};

/// Outbound queue depth per attached node.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Route {
    address: String,
    inbox: mpsc::Sender<Inbound>,
}

/// Stands in for the network subsystem: every attached node gets a sender for
/// its outbound envelopes, which are delivered to the other nodes' mailboxes.
///
/// Group envelopes reach every other node; only group members can use them.
/// A full mailbox drops the envelope.
#[derive(Debug, Clone, Default)]
pub struct LocalRouter {
    routes: Arc<RwLock<HashMap<Uuid, Route>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's mailbox and open its outbound queue.
    pub async fn attach(
        &self,
        identity: &Identity,
        inbox: mpsc::Sender<Inbound>,
    ) -> (mpsc::Sender<Envelope>, JoinHandle<()>) {
        self.register(identity, inbox).await;
        self.outbound(identity)
    }

    /// Deliver envelopes addressed to `identity` into `inbox`.
    pub async fn register(&self, identity: &Identity, inbox: mpsc::Sender<Inbound>) {
        self.routes.write().await.insert(
            identity.uuid(),
            Route {
                address: bare_address(identity.address()).to_string(),
                inbox,
            },
        );
    }

    /// Sender the node uses as its network, and the task forwarding from it.
    /// A node may send before its mailbox is registered.
    pub fn outbound(&self, identity: &Identity) -> (mpsc::Sender<Envelope>, JoinHandle<()>) {
        let uuid = identity.uuid();
        let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);
        let router = self.clone();
        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                router.deliver(uuid, envelope).await;
            }
            debug!(node = %uuid, "outbound closed");
        });
        (tx, task)
    }

    pub async fn detach(&self, uuid: &Uuid) {
        self.routes.write().await.remove(uuid);
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    async fn deliver(&self, sender: Uuid, envelope: Envelope) {
        let routes = self.routes.read().await;
        let targets: Vec<(&Uuid, &Route)> = match &envelope.to_whom {
            Recipient::Broadcast | Recipient::Group(_) => {
                routes.iter().filter(|(uuid, _)| **uuid != sender).collect()
            }
            Recipient::Peer { uuid, address } => routes
                .get_key_value(uuid)
                .or_else(|| {
                    routes
                        .iter()
                        .find(|(_, route)| route.address == bare_address(address))
                })
                .into_iter()
                .collect(),
        };
        if targets.is_empty() {
            debug!(function = %envelope.function, "no route for envelope");
        }
        for (uuid, route) in targets {
            let inbound = Inbound::Message(Box::new(envelope.clone()));
            if let Err(e) = route.inbox.try_send(inbound) {
                warn!(to = %uuid, function = %envelope.function, "dropped envelope: {}", e);
            }
        }
    }
}
