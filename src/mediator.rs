//! The per-node pubsub mediator.
//!
//! A [`Mediator`] owns the local bucket, the replicated registry, the gossip engine and the
//! router. It is a plain state machine: every method runs to completion, and the spawned task in
//! [`spawn`](Mediator::spawn) feeds it commands, gossip and ticks one at a time. That sequential
//! processing is the only synchronization the registry and the round robin cursors need.
//!
//! Talk to a running mediator through its [`MediatorRef`].

mod mediator_ref;
mod spawn;

use std::{collections::HashMap, fmt};

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    actor::{ActorRef, DeathWatch, NodeId},
    cluster::{MemberEvent, Transport},
    config::MediatorConfig,
    error::{ConfigError, GossipError, RegistryError},
    gossip::{GossipEngine, GossipMessage},
    message::{
        self, Count, CountSubscribers, CurrentTopics, GetTopics, Publish, Put, Remove, SendToAll,
        Subscribe, SubscribeAck, Unsubscribe, UnsubscribeAck,
    },
    registry::{RegistrationKey, Registry},
    router::Router,
};

pub use mediator_ref::*;

/// Sequential mediator state for one node.
pub struct Mediator {
    node: NodeId,
    config: MediatorConfig,
    registry: Registry,
    gossip: GossipEngine,
    router: Router,
    transport: Box<dyn Transport>,
    death_watch: Box<dyn DeathWatch>,
    /// Live local registrations per watched actor.
    watched: HashMap<ActorRef, usize>,
}

impl Mediator {
    /// Creates a mediator for `node`.
    ///
    /// The configuration is validated first.
    pub fn new(
        node: NodeId,
        config: MediatorConfig,
        transport: Box<dyn Transport>,
        death_watch: Box<dyn DeathWatch>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Mediator {
            node,
            config,
            registry: Registry::new(node),
            gossip: GossipEngine::new(node),
            router: Router::new(node),
            transport,
            death_watch,
            watched: HashMap::new(),
        })
    }

    /// The node this mediator runs on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The mediator's configuration.
    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    /// The merged registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The gossip engine.
    pub fn gossip_engine(&self) -> &GossipEngine {
        &self.gossip
    }

    /// The number of distinct actors currently death-watched.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Registers an actor under its own path in the local bucket.
    ///
    /// The actor must live on this node.
    pub fn handle_put(&mut self, Put { actor_ref }: Put) -> Result<(), RegistryError> {
        if !actor_ref.is_local_to(self.node) {
            let err = RegistryError::NotLocal {
                actor_ref,
                local: self.node,
            };
            warn!(node = %self.node, "{err}");
            return Err(err);
        }

        let key = RegistrationKey::path(actor_ref.path());
        let (registration, previous) = self.registry.put(key, actor_ref.clone());
        self.acquire_watch(&actor_ref);
        if let Some(previous) = previous.filter(|prev| prev.is_live()) {
            self.release_watch(&previous.actor_ref);
        }
        debug!(%actor_ref, version = registration.version, "put");
        Ok(())
    }

    /// Tombstones the local registration at a path. Unknown paths are ignored.
    pub fn handle_remove(&mut self, Remove { path }: Remove) {
        match self.registry.remove(&RegistrationKey::path(path.as_str())) {
            Ok((tombstone, previous)) => {
                self.release_watch(&previous.actor_ref);
                debug!(%path, version = tombstone.version, "removed");
            }
            Err(err) => debug!(%path, "ignoring remove: {err}"),
        }
    }

    /// Registers a subscription and watches the subscriber.
    pub fn handle_subscribe(&mut self, subscribe: Subscribe) -> SubscribeAck {
        let key = subscription_key(
            subscribe.topic(),
            subscribe.group(),
            subscribe.actor_ref(),
        );
        let (registration, previous) = self.registry.put(key, subscribe.actor_ref().clone());
        self.acquire_watch(subscribe.actor_ref());
        if let Some(previous) = previous.filter(|prev| prev.is_live()) {
            self.release_watch(&previous.actor_ref);
        }
        debug!(
            topic = subscribe.topic(),
            group = ?subscribe.group(),
            actor_ref = %subscribe.actor_ref(),
            version = registration.version,
            "subscribed"
        );
        SubscribeAck { subscribe }
    }

    /// Tombstones a subscription and releases the subscriber's watch.
    ///
    /// Always acknowledged, whether or not the subscription existed.
    pub fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> UnsubscribeAck {
        let key = subscription_key(
            unsubscribe.topic(),
            unsubscribe.group(),
            unsubscribe.actor_ref(),
        );
        match self.registry.remove(&key) {
            Ok((tombstone, previous)) => {
                self.release_watch(&previous.actor_ref);
                debug!(
                    topic = unsubscribe.topic(),
                    group = ?unsubscribe.group(),
                    actor_ref = %unsubscribe.actor_ref(),
                    version = tombstone.version,
                    "unsubscribed"
                );
            }
            Err(err) => debug!("ignoring unsubscribe: {err}"),
        }
        UnsubscribeAck { unsubscribe }
    }

    /// Delivers a publish to its resolved recipients, returning how many there were.
    pub fn handle_publish(&mut self, publish: Publish) -> usize {
        let recipients = self.router.resolve_publish(
            &self.registry,
            &publish.topic,
            publish.send_one_message_to_each_group,
        );
        if recipients.is_empty() {
            trace!(topic = %publish.topic, "no subscribers, dropping publish");
        }
        for recipient in &recipients {
            trace!(topic = %publish.topic, %recipient, "delivering publish");
            self.transport.tell(recipient, publish.message.clone());
        }
        recipients.len()
    }

    /// Delivers a send to one recipient, returning it if one matched.
    pub fn handle_send(&mut self, send: message::Send) -> Option<ActorRef> {
        match self
            .router
            .resolve_send(&self.registry, &send.path, send.local_affinity)
        {
            Ok(recipient) => {
                trace!(path = %send.path, %recipient, "delivering send");
                self.transport.tell(&recipient, send.message);
                Some(recipient)
            }
            Err(err) => {
                trace!("dropping send: {err}");
                None
            }
        }
    }

    /// Delivers a send-to-all to one recipient per node, returning how many there were.
    pub fn handle_send_to_all(&mut self, send: SendToAll) -> usize {
        let recipients =
            self.router
                .resolve_send_to_all(&self.registry, &send.path, send.all_but_self);
        for recipient in &recipients {
            trace!(path = %send.path, %recipient, "delivering send to all");
            self.transport.tell(recipient, send.message.clone());
        }
        recipients.len()
    }

    /// Snapshot of topics with live subscribers.
    pub fn handle_get_topics(&self, _: GetTopics) -> CurrentTopics {
        CurrentTopics {
            topics: self.router.current_topics(&self.registry),
        }
    }

    /// The number of live registrations in the merged view.
    pub fn handle_count(&self, _: Count) -> usize {
        self.registry.live_count()
    }

    /// The number of live subscribers of a topic in the merged view.
    pub fn handle_count_subscribers(&self, CountSubscribers { topic }: CountSubscribers) -> usize {
        self.registry.lookup_by_topic(&topic).count()
    }

    /// Merges gossip from a peer. Rejected messages are logged and dropped.
    pub fn handle_gossip(&mut self, message: GossipMessage) {
        let from = message.from();
        match self.gossip.on_gossip(&mut self.registry, message) {
            Ok(outcome) => trace!(%from, applied = outcome.applied, "handled gossip"),
            Err(err @ GossipError::UnknownMember(_)) => debug!("dropping gossip: {err}"),
            Err(err) => warn!("dropping gossip: {err}"),
        }
    }

    /// Applies a membership change.
    pub fn handle_member_event(&mut self, event: MemberEvent) {
        self.gossip.on_member_event(&mut self.registry, event);
    }

    /// Tombstones every local registration of an actor that terminated.
    ///
    /// The watch is dropped without calling [`DeathWatch::unwatch`], since the runtime has
    /// already released it. Repeated notifications are no-ops.
    pub fn handle_terminated(&mut self, actor_ref: &ActorRef) {
        if self.watched.remove(actor_ref).is_none() {
            trace!(%actor_ref, "ignoring termination of unwatched actor");
            return;
        }

        let keys = self.registry.local_keys_for(actor_ref);
        for key in &keys {
            if let Err(err) = self.registry.remove(key) {
                warn!(%actor_ref, "failed to remove registration of terminated actor: {err}");
            }
        }
        debug!(%actor_ref, removed = keys.len(), "actor terminated");
    }

    /// Sends one round of gossip, returning the number of messages sent.
    pub fn gossip_tick(&mut self) -> usize {
        let round = self
            .gossip
            .tick(&self.registry, self.config.max_delta_elements);
        let sent = round.len();
        for (peer, message) in round {
            self.transport.gossip(peer, message);
        }
        trace!(node = %self.node, sent, "gossip round");
        sent
    }

    /// Purges tombstones older than the configured time to live, returning how many went.
    ///
    /// Local tombstones stay until every member, including unreachable ones, has acknowledged
    /// them.
    pub fn prune_tick(&mut self, now: Instant) -> usize {
        let local_through = self.gossip.min_acked();
        self.registry
            .purge_tombstones(now, self.config.removed_time_to_live, local_through)
    }

    fn acquire_watch(&mut self, actor_ref: &ActorRef) {
        let count = self.watched.entry(actor_ref.clone()).or_insert(0);
        if *count == 0 {
            trace!(%actor_ref, "watching");
            self.death_watch.watch(actor_ref);
        }
        *count += 1;
    }

    fn release_watch(&mut self, actor_ref: &ActorRef) {
        let Some(count) = self.watched.get_mut(actor_ref) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watched.remove(actor_ref);
            trace!(%actor_ref, "unwatching");
            self.death_watch.unwatch(actor_ref);
        }
    }
}

impl fmt::Debug for Mediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator")
            .field("node", &self.node)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("gossip", &self.gossip)
            .field("router", &self.router)
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

fn subscription_key(topic: &str, group: Option<&str>, actor_ref: &ActorRef) -> RegistrationKey {
    RegistrationKey::topic(topic, group.map(str::to_string), actor_ref.clone())
}
