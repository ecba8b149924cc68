//! The merged, eventually consistent view of every node's registrations.
//!
//! A [`Registry`] holds one [`Bucket`] per known node. The local node's bucket is written
//! directly; every other bucket is a read-only copy fed by gossip through
//! [`merge_delta`](Registry::merge_delta). Merging is a per-entry last-writer-wins on the
//! owner's version, which makes it idempotent and insensitive to the order deltas arrive in.
//!
//! Two derived indexes, by topic and by path, are kept in step with every mutation so routing
//! lookups never scan buckets.

mod bucket;

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    actor::{ActorRef, NodeId},
    error::RegistryError,
};

pub use bucket::*;

/// A live registration as seen by the router.
///
/// Candidates order by group, then actor ref, then owner, which gives every lookup a stable
/// iteration order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate {
    /// The subscription group. Always `None` for path registrations.
    pub group: Option<String>,
    /// The registered actor.
    pub actor_ref: ActorRef,
    /// The node whose bucket holds the registration.
    pub owner: NodeId,
}

/// Outcome of merging one delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries that replaced older state.
    pub applied: usize,
    /// Entries ignored because the stored version was equal or newer.
    pub stale: usize,
}

/// Every node's bucket plus lookup indexes.
#[derive(Debug)]
pub struct Registry {
    local: Bucket,
    remote: HashMap<NodeId, Bucket>,
    topic_index: HashMap<String, BTreeSet<Candidate>>,
    path_index: HashMap<String, BTreeSet<Candidate>>,
}

impl Registry {
    /// Creates a registry containing only the local node's empty bucket.
    pub fn new(local: NodeId) -> Self {
        Registry {
            local: Bucket::new(local),
            remote: HashMap::new(),
            topic_index: HashMap::new(),
            path_index: HashMap::new(),
        }
    }

    /// The local node.
    pub fn local_node(&self) -> NodeId {
        self.local.owner()
    }

    /// The local node's bucket.
    pub fn local_bucket(&self) -> &Bucket {
        &self.local
    }

    /// Gets a node's bucket.
    pub fn bucket(&self, node: &NodeId) -> Option<&Bucket> {
        if *node == self.local.owner() {
            Some(&self.local)
        } else {
            self.remote.get(node)
        }
    }

    /// The version held for a node's bucket, or zero if unknown.
    pub fn bucket_version(&self, node: &NodeId) -> u64 {
        self.bucket(node).map(Bucket::version).unwrap_or(0)
    }

    /// An iterator over the known nodes, local first, remote nodes in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.local.owner()).chain(self.remote.keys().copied())
    }

    /// Creates an empty bucket for a node that joined, if not already present.
    pub fn add_node(&mut self, node: NodeId) {
        if node != self.local.owner() {
            self.remote.entry(node).or_insert_with(|| Bucket::new(node));
        }
    }

    /// Registers `actor_ref` under `key` in the local bucket.
    ///
    /// Returns the new registration and the one it replaced, live or tombstoned.
    pub fn put(
        &mut self,
        key: RegistrationKey,
        actor_ref: ActorRef,
    ) -> (Registration, Option<Registration>) {
        let local = self.local.owner();
        let (registration, previous) = self.local.put(key, actor_ref);
        if let Some(previous) = &previous {
            self.unindex(local, previous);
        }
        self.index(local, &registration);
        trace!(key = %registration.key, version = registration.version, "put local registration");
        (registration, previous)
    }

    /// Tombstones the live registration under `key` in the local bucket.
    pub fn remove(
        &mut self,
        key: &RegistrationKey,
    ) -> Result<(Registration, Registration), RegistryError> {
        let local = self.local.owner();
        let (tombstone, previous) = self.local.remove(key)?;
        self.unindex(local, &previous);
        trace!(key = %tombstone.key, version = tombstone.version, "removed local registration");
        Ok((tombstone, previous))
    }

    /// Merges a delta authored by another node into that node's bucket.
    ///
    /// Each entry replaces the stored one only if its version is strictly greater, so replaying
    /// or reordering deltas never corrupts state. Deltas claiming to author the local bucket
    /// are refused.
    pub fn merge_delta(&mut self, delta: &BucketDelta) -> Result<MergeOutcome, RegistryError> {
        let owner = delta.owner;
        if owner == self.local.owner() {
            return Err(RegistryError::ForeignWrite { owner });
        }

        let mut outcome = MergeOutcome::default();
        let mut replaced = Vec::new();
        let bucket = self
            .remote
            .entry(owner)
            .or_insert_with(|| Bucket::new(owner));
        for incoming in &delta.entries {
            match bucket.merge(incoming.clone()) {
                Some(previous) => {
                    replaced.push((previous, incoming));
                    outcome.applied += 1;
                }
                None => outcome.stale += 1,
            }
        }
        bucket.advance_version(delta.version);

        for (previous, incoming) in replaced {
            if let Some(previous) = previous {
                self.unindex(owner, &previous);
            }
            self.index(owner, incoming);
        }

        if outcome.applied > 0 {
            debug!(
                %owner,
                applied = outcome.applied,
                stale = outcome.stale,
                version = delta.version,
                "merged delta"
            );
        }
        Ok(outcome)
    }

    /// Drops a node's whole bucket. Used only when the node has left the cluster for good.
    ///
    /// Returns `false` if the node was unknown. The local bucket is never pruned.
    pub fn prune(&mut self, node: &NodeId) -> bool {
        if *node == self.local.owner() {
            warn!(%node, "refusing to prune the local bucket");
            return false;
        }

        let Some(bucket) = self.remote.remove(node) else {
            return false;
        };
        for registration in bucket.live_registrations() {
            self.unindex(*node, registration);
        }
        debug!(%node, entries = bucket.len(), "pruned bucket");
        true
    }

    /// Physically removes tombstones older than `ttl` from every bucket.
    ///
    /// Local tombstones are only purged up to `local_through`, the lowest version every peer has
    /// acknowledged, so a peer that has not seen a removal yet still receives it.
    pub fn purge_tombstones(&mut self, now: Instant, ttl: Duration, local_through: u64) -> usize {
        let local = self.local.purge_tombstones(now, ttl, local_through).len();
        let remote: usize = self
            .remote
            .values_mut()
            .map(|bucket| bucket.purge_tombstones(now, ttl, u64::MAX).len())
            .sum();
        let purged = local + remote;
        if purged > 0 {
            debug!(local, remote, local_through, "purged tombstones");
        }
        purged
    }

    /// Live subscribers of a topic across all buckets, ordered by group then actor ref.
    pub fn lookup_by_topic(&self, topic: &str) -> impl Iterator<Item = &Candidate> {
        self.topic_index.get(topic).into_iter().flatten()
    }

    /// Live registrations of a path across all buckets, ordered by actor ref.
    pub fn lookup_by_path(&self, path: &str) -> impl Iterator<Item = &Candidate> {
        self.path_index.get(path).into_iter().flatten()
    }

    /// Topics with at least one live subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.topic_index.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// The number of live registrations across every bucket.
    pub fn live_count(&self) -> usize {
        std::iter::once(&self.local)
            .chain(self.remote.values())
            .map(|bucket| bucket.live_registrations().count())
            .sum()
    }

    /// Keys of live local registrations held by an actor.
    pub fn local_keys_for(&self, actor_ref: &ActorRef) -> Vec<RegistrationKey> {
        self.local
            .live_registrations()
            .filter(|reg| &reg.actor_ref == actor_ref)
            .map(|reg| reg.key.clone())
            .collect()
    }

    fn index(&mut self, owner: NodeId, registration: &Registration) {
        if !registration.is_live() {
            return;
        }
        match &registration.key {
            RegistrationKey::Path(path) => {
                self.path_index
                    .entry(path.clone())
                    .or_default()
                    .insert(Candidate {
                        group: None,
                        actor_ref: registration.actor_ref.clone(),
                        owner,
                    });
            }
            RegistrationKey::Topic { topic, group, .. } => {
                self.topic_index
                    .entry(topic.clone())
                    .or_default()
                    .insert(Candidate {
                        group: group.clone(),
                        actor_ref: registration.actor_ref.clone(),
                        owner,
                    });
            }
        }
    }

    fn unindex(&mut self, owner: NodeId, registration: &Registration) {
        if !registration.is_live() {
            return;
        }
        let (index, name, group) = match &registration.key {
            RegistrationKey::Path(path) => (&mut self.path_index, path, None),
            RegistrationKey::Topic { topic, group, .. } => {
                (&mut self.topic_index, topic, group.clone())
            }
        };
        if let Some(candidates) = index.get_mut(name) {
            candidates.remove(&Candidate {
                group,
                actor_ref: registration.actor_ref.clone(),
                owner,
            });
            if candidates.is_empty() {
                index.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    type Snapshot = BTreeMap<(NodeId, RegistrationKey), (ActorRef, u64, bool)>;

    fn snapshot(registry: &Registry) -> (Snapshot, BTreeMap<NodeId, u64>) {
        let mut entries = BTreeMap::new();
        let mut versions = BTreeMap::new();
        for node in registry.nodes() {
            let bucket = registry.bucket(&node).unwrap();
            versions.insert(node, bucket.version());
            for reg in bucket.registrations() {
                entries.insert(
                    (node, reg.key.clone()),
                    (reg.actor_ref.clone(), reg.version, reg.removed),
                );
            }
        }
        (entries, versions)
    }

    fn index_snapshot(registry: &Registry) -> Vec<(String, Vec<Candidate>)> {
        let mut out: Vec<_> = registry
            .topics()
            .into_iter()
            .map(|topic| {
                let candidates = registry.lookup_by_topic(&topic).cloned().collect();
                (topic, candidates)
            })
            .collect();
        let mut paths: Vec<_> = registry.path_index.keys().cloned().collect();
        paths.sort();
        for path in paths {
            let candidates = registry.lookup_by_path(&path).cloned().collect();
            out.push((format!("path:{path}"), candidates));
        }
        out
    }

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn remote_registry(owner: NodeId, ops: &[(u8, bool)]) -> Registry {
        let mut registry = Registry::new(owner);
        for (i, (slot, remove)) in ops.iter().enumerate() {
            let key = if slot % 2 == 0 {
                RegistrationKey::path(format!("/user/{slot}"))
            } else {
                RegistrationKey::topic(
                    format!("topic-{}", slot % 3),
                    (slot % 4 == 1).then(|| "g".to_string()),
                    ActorRef::new(owner, format!("/user/{slot}"), 0),
                )
            };
            if *remove {
                let _ = registry.remove(&key);
            } else {
                registry.put(key, ActorRef::new(owner, format!("/user/{slot}"), i as u64));
            }
        }
        registry
    }

    #[test]
    fn put_and_lookup() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let a = ActorRef::new(local, "/user/a", 0);

        registry.put(RegistrationKey::path("/user/a"), a.clone());
        registry.put(RegistrationKey::topic("news", None, a.clone()), a.clone());

        let by_path: Vec<_> = registry.lookup_by_path("/user/a").collect();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].actor_ref, a);
        assert_eq!(by_path[0].owner, local);

        let by_topic: Vec<_> = registry.lookup_by_topic("news").collect();
        assert_eq!(by_topic.len(), 1);
        assert_eq!(registry.topics(), vec!["news".to_string()]);
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn overwriting_a_path_replaces_the_index_entry() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let first = ActorRef::new(local, "/user/a", 0);
        let second = ActorRef::new(local, "/user/a", 1);

        registry.put(RegistrationKey::path("/user/a"), first);
        registry.put(RegistrationKey::path("/user/a"), second.clone());

        let by_path: Vec<_> = registry.lookup_by_path("/user/a").collect();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].actor_ref, second);
    }

    #[test]
    fn remove_clears_indexes() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let a = ActorRef::new(local, "/user/a", 0);
        let key = RegistrationKey::topic("news", None, a.clone());

        registry.put(key.clone(), a);
        registry.remove(&key).unwrap();

        assert_eq!(registry.lookup_by_topic("news").count(), 0);
        assert!(registry.topics().is_empty());
        assert!(matches!(
            registry.remove(&key),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn merge_refuses_local_bucket() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let delta = BucketDelta {
            owner: local,
            version: 1,
            entries: vec![],
        };
        assert_eq!(
            registry.merge_delta(&delta),
            Err(RegistryError::ForeignWrite { owner: local })
        );
    }

    #[test]
    fn merged_tombstone_hides_remote_entry() {
        let remote = node("node-2");
        let mut source = Registry::new(remote);
        let actor = ActorRef::new(remote, "/user/a", 0);
        let key = RegistrationKey::path("/user/a");
        source.put(key.clone(), actor);

        let mut registry = Registry::new(node("node-1"));
        registry
            .merge_delta(&source.local_bucket().delta_since(0, 100))
            .unwrap();
        assert_eq!(registry.lookup_by_path("/user/a").count(), 1);

        source.remove(&key).unwrap();
        let outcome = registry
            .merge_delta(&source.local_bucket().delta_since(1, 100))
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(registry.lookup_by_path("/user/a").count(), 0);

        // Replaying the original registration must not resurrect it.
        let tombstone = source.local_bucket().get(&key).cloned().unwrap();
        let replay = BucketDelta {
            owner: remote,
            version: 1,
            entries: vec![Registration {
                version: 1,
                removed: false,
                ..tombstone
            }],
        };
        let outcome = registry.merge_delta(&replay).unwrap();
        assert_eq!(outcome, MergeOutcome { applied: 0, stale: 1 });
        assert_eq!(registry.lookup_by_path("/user/a").count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_after_purge_stays_removed() {
        let remote = node("node-2");
        let mut source = Registry::new(remote);
        let key = RegistrationKey::path("/user/a");
        source.put(key.clone(), ActorRef::new(remote, "/user/a", 0));
        let first = source.local_bucket().delta_since(0, 100);

        let mut registry = Registry::new(node("node-1"));
        registry.merge_delta(&first).unwrap();
        source.remove(&key).unwrap();
        registry
            .merge_delta(&source.local_bucket().delta_since(1, 100))
            .unwrap();

        let ttl = Duration::from_secs(30);
        tokio::time::advance(ttl).await;
        assert_eq!(registry.purge_tombstones(Instant::now(), ttl, u64::MAX), 1);
        assert!(registry.bucket(&remote).unwrap().is_empty());

        let outcome = registry.merge_delta(&first).unwrap();
        assert_eq!(outcome, MergeOutcome { applied: 0, stale: 1 });
        assert_eq!(registry.lookup_by_path("/user/a").count(), 0);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.bucket_version(&remote), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_tombstones_wait_for_acknowledgement() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let key = RegistrationKey::path("/user/a");
        registry.put(key.clone(), ActorRef::new(local, "/user/a", 0));
        registry.remove(&key).unwrap();

        let ttl = Duration::from_secs(30);
        tokio::time::advance(ttl).await;
        assert_eq!(registry.purge_tombstones(Instant::now(), ttl, 1), 0);
        assert!(registry.local_bucket().get(&key).is_some());
        assert_eq!(registry.purge_tombstones(Instant::now(), ttl, 2), 1);
    }

    #[test]
    fn prune_removes_node_from_lookups() {
        let remote = node("node-2");
        let mut source = Registry::new(remote);
        let actor = ActorRef::new(remote, "/user/a", 0);
        source.put(RegistrationKey::path("/user/a"), actor.clone());
        source.put(RegistrationKey::topic("news", None, actor.clone()), actor);

        let local = node("node-1");
        let mut registry = Registry::new(local);
        registry
            .merge_delta(&source.local_bucket().delta_since(0, 100))
            .unwrap();
        assert_eq!(registry.lookup_by_topic("news").count(), 1);

        assert!(registry.prune(&remote));
        assert_eq!(registry.lookup_by_topic("news").count(), 0);
        assert_eq!(registry.lookup_by_path("/user/a").count(), 0);
        assert!(registry.bucket(&remote).is_none());
        assert!(!registry.prune(&remote));
        assert!(!registry.prune(&local));
    }

    #[tokio::test(start_paused = true)]
    async fn purged_tombstones_disappear_from_storage_only() {
        let local = node("node-1");
        let mut registry = Registry::new(local);
        let actor = ActorRef::new(local, "/user/a", 0);
        let key = RegistrationKey::path("/user/a");
        registry.put(key.clone(), actor);
        registry.remove(&key).unwrap();

        let ttl = Duration::from_secs(30);
        assert_eq!(registry.purge_tombstones(Instant::now(), ttl, u64::MAX), 0);
        tokio::time::advance(ttl).await;
        assert_eq!(registry.purge_tombstones(Instant::now(), ttl, u64::MAX), 1);
        assert_eq!(registry.lookup_by_path("/user/a").count(), 0);
        assert_eq!(registry.local_bucket().version(), 2);
    }

    fn arb_ops() -> impl Strategy<Value = Vec<(u8, bool)>> {
        prop::collection::vec((0u8..12, any::<bool>()), 0..24)
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(ops in arb_ops(), since in 0u64..10) {
            let source = remote_registry(node("node-2"), &ops);
            let delta = source.local_bucket().delta_since(since, usize::MAX);

            let mut once = Registry::new(node("node-1"));
            once.merge_delta(&delta).unwrap();

            let mut twice = Registry::new(node("node-1"));
            twice.merge_delta(&delta).unwrap();
            twice.merge_delta(&delta).unwrap();

            prop_assert_eq!(snapshot(&once), snapshot(&twice));
            prop_assert_eq!(index_snapshot(&once), index_snapshot(&twice));
        }

        #[test]
        fn prop_merge_is_commutative(ops_a in arb_ops(), ops_b in arb_ops()) {
            let delta_a = remote_registry(node("node-2"), &ops_a)
                .local_bucket()
                .delta_since(0, usize::MAX);
            let delta_b = remote_registry(node("node-3"), &ops_b)
                .local_bucket()
                .delta_since(0, usize::MAX);

            let mut ab = Registry::new(node("node-1"));
            ab.merge_delta(&delta_a).unwrap();
            ab.merge_delta(&delta_b).unwrap();

            let mut ba = Registry::new(node("node-1"));
            ba.merge_delta(&delta_b).unwrap();
            ba.merge_delta(&delta_a).unwrap();

            prop_assert_eq!(snapshot(&ab), snapshot(&ba));
            prop_assert_eq!(index_snapshot(&ab), index_snapshot(&ba));
        }

        #[test]
        fn prop_same_owner_deltas_converge_in_any_order(
            ops in arb_ops(),
            split in 0u64..30,
        ) {
            let source = remote_registry(node("node-2"), &ops);
            let early = source.local_bucket().delta_since(0, usize::MAX);
            let late = source.local_bucket().delta_since(split, usize::MAX);

            let mut in_order = Registry::new(node("node-1"));
            in_order.merge_delta(&early).unwrap();
            in_order.merge_delta(&late).unwrap();

            let mut reversed = Registry::new(node("node-1"));
            reversed.merge_delta(&late).unwrap();
            reversed.merge_delta(&early).unwrap();

            prop_assert_eq!(snapshot(&in_order), snapshot(&reversed));
            prop_assert_eq!(index_snapshot(&in_order), index_snapshot(&reversed));
        }

        #[test]
        fn prop_stale_entries_never_change_state(ops in arb_ops(), lower_by in 0u64..3) {
            let source = remote_registry(node("node-2"), &ops);
            let delta = source.local_bucket().delta_since(0, usize::MAX);

            let mut registry = Registry::new(node("node-1"));
            registry.merge_delta(&delta).unwrap();
            let before = snapshot(&registry);

            let stale = BucketDelta {
                owner: delta.owner,
                version: 0,
                entries: delta
                    .entries
                    .iter()
                    .map(|reg| Registration {
                        version: reg.version.saturating_sub(lower_by),
                        removed: !reg.removed,
                        ..reg.clone()
                    })
                    .collect(),
            };
            let outcome = registry.merge_delta(&stale).unwrap();

            prop_assert_eq!(outcome.applied, 0);
            prop_assert_eq!(snapshot(&registry), before);
        }

        #[test]
        fn prop_merge_mirrors_source_lookups(ops in arb_ops()) {
            let owner = node("node-2");
            let source = remote_registry(owner, &ops);

            let mut registry = Registry::new(node("node-1"));
            registry
                .merge_delta(&source.local_bucket().delta_since(0, usize::MAX))
                .unwrap();

            prop_assert_eq!(index_snapshot(&registry), index_snapshot(&source));
            prop_assert_eq!(registry.live_count(), source.live_count());
        }
    }
}
