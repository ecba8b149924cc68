//! An in-process cluster for tests and single-process simulations.
//!
//! [`LocalNetwork`] plays every external collaborator a mediator needs: it is the transport
//! between mediators and actors, the death watch, and the membership service. Actors are
//! stand-in [`Probe`]s that collect the payloads delivered to them.
//!
//! ```
//! # tokio_test::block_on(async {
//! use kameo_pubsub::{actor::NodeId, config::MediatorConfig, message::*, testkit::LocalNetwork};
//!
//! let network = LocalNetwork::new();
//! let node = NodeId::new("node-1");
//! let mediator = network.spawn_mediator(node, MediatorConfig::default())?;
//!
//! let mut probe = network.spawn_probe(node, "/user/listener");
//! mediator.subscribe(Subscribe::new("news", probe.actor_ref().clone())?).await?;
//! mediator.publish(Publish::new("news", Payload::encode("hello")?))?;
//!
//! let payload = probe.recv().await.unwrap();
//! assert_eq!(payload.decode::<String>()?, "hello");
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{
    actor::{ActorRef, DeathWatch, NodeId},
    cluster::{MemberEvent, Transport},
    config::MediatorConfig,
    error::{ConfigError, SendError},
    gossip::GossipMessage,
    mediator::{Mediator, MediatorRef},
    message::Payload,
};

#[derive(Default)]
struct NetworkState {
    mediators: HashMap<NodeId, MediatorRef>,
    actors: HashMap<ActorRef, mpsc::UnboundedSender<Payload>>,
    watchers: HashMap<ActorRef, HashSet<NodeId>>,
    disconnected: HashSet<NodeId>,
}

impl NetworkState {
    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        a == b || !(self.disconnected.contains(&a) || self.disconnected.contains(&b))
    }
}

/// A shared in-memory cluster.
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a mediator for `node` and joins it to every existing member.
    pub fn spawn_mediator(
        &self,
        node: NodeId,
        config: MediatorConfig,
    ) -> Result<MediatorRef, ConfigError> {
        let endpoint = Endpoint {
            network: self.clone(),
            node,
        };
        let mediator_ref =
            Mediator::new(node, config, Box::new(endpoint.clone()), Box::new(endpoint))?.spawn();

        let mut state = self.lock();
        for (member, member_ref) in &state.mediators {
            let _ = member_ref.member_event(MemberEvent::Up(node));
            let _ = mediator_ref.member_event(MemberEvent::Up(*member));
        }
        state.mediators.insert(node, mediator_ref.clone());
        info!(%node, members = state.mediators.len(), "node joined");
        Ok(mediator_ref)
    }

    /// Gets the mediator running on `node`.
    pub fn mediator(&self, node: NodeId) -> Option<MediatorRef> {
        self.lock().mediators.get(&node).cloned()
    }

    /// All mediators on the network, sorted by node.
    pub fn mediators(&self) -> Vec<MediatorRef> {
        let state = self.lock();
        let mut mediators: Vec<_> = state.mediators.values().cloned().collect();
        mediators.sort_by_key(MediatorRef::node);
        mediators
    }

    /// Creates a stand-in actor at `path` on `node`.
    pub fn spawn_probe(&self, node: NodeId, path: impl Into<String>) -> Probe {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor_ref = ActorRef::generate(node, path);
        self.lock().actors.insert(actor_ref.clone(), tx);
        Probe { actor_ref, rx }
    }

    /// Stops an actor, notifying every mediator that watches it.
    pub fn stop_actor(&self, actor_ref: &ActorRef) {
        let mut state = self.lock();
        state.actors.remove(actor_ref);
        let watchers = state.watchers.remove(actor_ref).unwrap_or_default();
        for node in watchers {
            if let Some(mediator) = state.mediators.get(&node) {
                let _ = mediator.terminated(actor_ref.clone());
            }
        }
        debug!(%actor_ref, "actor stopped");
    }

    /// Nodes currently watching an actor.
    pub fn watchers_of(&self, actor_ref: &ActorRef) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .lock()
            .watchers
            .get(actor_ref)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    /// Cuts a node off from the others and reports it unreachable on both sides.
    pub fn disconnect(&self, node: NodeId) {
        self.set_reachability(node, false);
    }

    /// Restores a disconnected node and reports it reachable on both sides.
    pub fn reconnect(&self, node: NodeId) {
        self.set_reachability(node, true);
    }

    fn set_reachability(&self, node: NodeId, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.disconnected.remove(&node);
        } else {
            state.disconnected.insert(node);
        }

        let Some(node_ref) = state.mediators.get(&node) else {
            return;
        };
        for (member, member_ref) in &state.mediators {
            if *member == node {
                continue;
            }
            let (to_member, to_node) = if reachable {
                (MemberEvent::Reachable(node), MemberEvent::Reachable(*member))
            } else {
                (MemberEvent::Unreachable(node), MemberEvent::Unreachable(*member))
            };
            let _ = member_ref.member_event(to_member);
            let _ = node_ref.member_event(to_node);
        }
        info!(%node, reachable, "reachability changed");
    }

    /// Removes a node from the cluster: its mediator is stopped and every other member prunes
    /// its bucket.
    pub async fn remove_node(&self, node: NodeId) -> Result<(), SendError> {
        let removed = {
            let mut state = self.lock();
            let removed = state.mediators.remove(&node);
            for member_ref in state.mediators.values() {
                let _ = member_ref.member_event(MemberEvent::Removed(node));
            }
            state.disconnected.remove(&node);
            removed
        };
        info!(%node, "node removed");
        match removed {
            Some(mediator) => mediator.stop().await,
            None => Ok(()),
        }
    }

    /// Runs one gossip round on each mediator in node order, waiting after each one until the
    /// messages it produced have been handled.
    ///
    /// Acknowledgements therefore reach earlier nodes within the same round, which keeps the
    /// number of rounds needed to converge reproducible.
    pub async fn gossip_round(&self) -> Result<(), SendError> {
        for mediator in self.mediators() {
            mediator.gossip_tick().await?;
            self.settle().await?;
        }
        Ok(())
    }

    /// Waits until every mediator has processed everything queued to it so far.
    pub async fn settle(&self) -> Result<(), SendError> {
        let mediators = self.mediators();
        for result in join_all(mediators.iter().map(MediatorRef::count)).await {
            result?;
        }
        Ok(())
    }
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LocalNetwork")
            .field("mediators", &state.mediators.len())
            .field("actors", &state.actors.len())
            .field("disconnected", &state.disconnected)
            .finish()
    }
}

/// One node's view of the network.
#[derive(Clone)]
struct Endpoint {
    network: LocalNetwork,
    node: NodeId,
}

impl Transport for Endpoint {
    fn tell(&self, recipient: &ActorRef, message: Payload) {
        let state = self.network.lock();
        if !state.connected(self.node, recipient.node()) {
            trace!(from = %self.node, %recipient, "dropping message to disconnected node");
            return;
        }
        match state.actors.get(recipient) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    trace!(%recipient, "dropping message to closed probe");
                }
            }
            None => trace!(%recipient, "dropping message to dead actor"),
        }
    }

    fn gossip(&self, peer: NodeId, message: GossipMessage) {
        let state = self.network.lock();
        if !state.connected(self.node, peer) {
            trace!(from = %self.node, %peer, "dropping gossip to disconnected node");
            return;
        }
        if let Some(mediator) = state.mediators.get(&peer) {
            let _ = mediator.gossip(message);
        }
    }
}

impl DeathWatch for Endpoint {
    fn watch(&self, actor_ref: &ActorRef) {
        let mut state = self.network.lock();
        if state.actors.contains_key(actor_ref) {
            state
                .watchers
                .entry(actor_ref.clone())
                .or_default()
                .insert(self.node);
        } else if let Some(mediator) = state.mediators.get(&self.node) {
            // Watching an actor that is already gone reports its termination straight away.
            let _ = mediator.terminated(actor_ref.clone());
        }
    }

    fn unwatch(&self, actor_ref: &ActorRef) {
        let mut state = self.network.lock();
        if let Some(nodes) = state.watchers.get_mut(actor_ref) {
            nodes.remove(&self.node);
            if nodes.is_empty() {
                state.watchers.remove(actor_ref);
            }
        }
    }
}

/// A stand-in actor that records what it receives.
#[derive(Debug)]
pub struct Probe {
    actor_ref: ActorRef,
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl Probe {
    /// The probe's actor ref.
    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor_ref
    }

    /// Waits for the next delivered payload. Returns `None` once the probe has been stopped and
    /// drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Takes a delivered payload if one is waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Takes every payload delivered so far.
    pub fn drain(&mut self) -> Vec<Payload> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
