//! Message transport between nodes.
//!
//! [`Transport`] is the seam between the channel runtimes and the network.
//! Sends never block: a full peer inbox drops the message and consensus
//! recovers through its retransmission paths (view-change and sync).
//!
//! [`LocalNetwork`] connects nodes in one process, with controls for
//! partitioning nodes and filtering traffic in tests.

use crate::message::ConsensusMessage;
use hiera_types::PublicKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default per-node inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 8192;

/// A message with its sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node.
    pub from: PublicKey,
    /// Message.
    pub message: ConsensusMessage,
}

/// Outbound side of the network, as seen by one node.
pub trait Transport: Send + Sync {
    /// Key this transport sends as.
    fn local_key(&self) -> PublicKey;

    /// Sends to one peer.
    fn send(&self, to: &PublicKey, message: ConsensusMessage);

    /// Sends to every peer except this node.
    fn broadcast(&self, message: ConsensusMessage);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn local_key(&self) -> PublicKey {
        (**self).local_key()
    }

    fn send(&self, to: &PublicKey, message: ConsensusMessage) {
        (**self).send(to, message)
    }

    fn broadcast(&self, message: ConsensusMessage) {
        (**self).broadcast(message)
    }
}

/// Decides whether a message from `from` to `to` is delivered.
pub type DeliveryFilter =
    Arc<dyn Fn(&PublicKey, &PublicKey, &ConsensusMessage) -> bool + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<PublicKey, mpsc::Sender<Envelope>>,
    isolated: HashSet<PublicKey>,
    filter: Option<DeliveryFilter>,
}

/// In-process network.
#[derive(Clone)]
pub struct LocalNetwork {
    capacity: usize,
    state: Arc<RwLock<NetworkState>>,
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("LocalNetwork")
            .field("nodes", &state.inboxes.len())
            .field("isolated", &state.isolated.len())
            .finish()
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

impl LocalNetwork {
    /// Creates a network with bounded per-node inboxes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::default(),
        }
    }

    /// Adds a node, returning its transport and inbox.
    ///
    /// Registering a key again replaces its inbox.
    pub fn register(&self, key: PublicKey) -> (LocalTransport, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.state.write().inboxes.insert(key, sender);
        let transport = LocalTransport {
            key,
            network: self.clone(),
        };
        (transport, receiver)
    }

    /// Removes a node.
    pub fn unregister(&self, key: &PublicKey) {
        self.state.write().inboxes.remove(key);
    }

    /// Cuts a node off: nothing it sends or is sent is delivered.
    pub fn isolate(&self, key: PublicKey) {
        self.state.write().isolated.insert(key);
    }

    /// Reconnects an isolated node.
    pub fn heal(&self, key: &PublicKey) {
        self.state.write().isolated.remove(key);
    }

    /// Installs a delivery filter, replacing any previous one.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&PublicKey, &PublicKey, &ConsensusMessage) -> bool + Send + Sync + 'static,
    {
        self.state.write().filter = Some(Arc::new(filter));
    }

    /// Removes the delivery filter.
    pub fn clear_filter(&self) {
        self.state.write().filter = None;
    }

    /// Registered node keys.
    pub fn nodes(&self) -> Vec<PublicKey> {
        let mut nodes: Vec<_> = self.state.read().inboxes.keys().copied().collect();
        nodes.sort();
        nodes
    }

    fn deliver(&self, from: &PublicKey, to: &PublicKey, message: ConsensusMessage) {
        let state = self.state.read();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return;
        }
        if let Some(filter) = &state.filter {
            if !filter(from, to, &message) {
                return;
            }
        }
        let Some(inbox) = state.inboxes.get(to) else {
            return;
        };
        let kind = message.kind();
        if let Err(e) = inbox.try_send(Envelope {
            from: *from,
            message,
        }) {
            tracing::trace!(from = %from, to = %to, kind, error = %e, "dropping message");
        }
    }
}

/// A node's handle on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    key: PublicKey,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn local_key(&self) -> PublicKey {
        self.key
    }

    fn send(&self, to: &PublicKey, message: ConsensusMessage) {
        if to != &self.key {
            self.network.deliver(&self.key, to, message);
        }
    }

    fn broadcast(&self, message: ConsensusMessage) {
        for peer in self.network.nodes() {
            if peer != self.key {
                self.network.deliver(&self.key, &peer, message.clone());
            }
        }
    }
}
