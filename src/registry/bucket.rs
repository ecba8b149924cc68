use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    actor::{ActorRef, NodeId},
    error::RegistryError,
};

/// The key a registration is stored under within a bucket.
///
/// `Put` registrations use the actor's own path. Subscriptions use a synthetic key made of the
/// topic, the optional group and the subscriber itself, so that every subscriber gets its own
/// entry and subscriptions replicate through the same machinery as paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistrationKey {
    /// A raw actor path registered with `Put`.
    Path(String),
    /// A topic subscription.
    Topic {
        /// The topic.
        topic: String,
        /// The subscription group, if any.
        group: Option<String>,
        /// The subscribing actor.
        subscriber: ActorRef,
    },
}

impl RegistrationKey {
    /// Creates a path key.
    pub fn path(path: impl Into<String>) -> Self {
        RegistrationKey::Path(path.into())
    }

    /// Creates a subscription key.
    pub fn topic(topic: impl Into<String>, group: Option<String>, subscriber: ActorRef) -> Self {
        RegistrationKey::Topic {
            topic: topic.into(),
            group,
            subscriber,
        }
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationKey::Path(path) => f.write_str(path),
            RegistrationKey::Topic {
                topic,
                group: None,
                subscriber,
            } => write!(f, "topic/{topic}/{subscriber}"),
            RegistrationKey::Topic {
                topic,
                group: Some(group),
                subscriber,
            } => write!(f, "topic/{topic}/group/{group}/{subscriber}"),
        }
    }
}

/// One versioned binding in a bucket.
///
/// Removal leaves a tombstone (`removed == true`) carrying its own version, so that merging can
/// tell "removed after registration" apart from "never seen".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Where the registration is stored.
    pub key: RegistrationKey,
    /// The registered actor.
    pub actor_ref: ActorRef,
    /// Version stamped by the owning node's bucket.
    pub version: u64,
    /// Whether this is a tombstone.
    pub removed: bool,
}

impl Registration {
    /// Returns `true` unless the registration is a tombstone.
    pub fn is_live(&self) -> bool {
        !self.removed
    }
}

#[derive(Clone, Debug)]
struct Slot {
    registration: Registration,
    /// When this node first saw the tombstone. Local bookkeeping for purging, never replicated.
    tombstoned_at: Option<Instant>,
}

/// The replicated unit of gossip: a slice of one owner's bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDelta {
    /// The node that authored the entries.
    pub owner: NodeId,
    /// High-water mark covered by this delta. Every entry of the owner's bucket with a version
    /// up to this one is either included or already known to the receiver.
    pub version: u64,
    /// Registrations ordered by version.
    pub entries: Vec<Registration>,
}

impl BucketDelta {
    /// Returns `true` if the delta carries no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One node's versioned set of registrations.
///
/// Only the owning node mutates its own bucket through [`put`](Bucket::put) and
/// [`remove`](Bucket::remove). Copies of other nodes' buckets only change through
/// [`merge`](Bucket::merge).
#[derive(Clone, Debug)]
pub struct Bucket {
    owner: NodeId,
    version: u64,
    entries: HashMap<RegistrationKey, Slot>,
    /// Highest version of a tombstone purged from this bucket. An absent key at or below it was
    /// removed and purged, not missed.
    purged_through: u64,
}

impl Bucket {
    /// Creates an empty bucket at version zero.
    pub fn new(owner: NodeId) -> Self {
        Bucket {
            owner,
            version: 0,
            entries: HashMap::new(),
            purged_through: 0,
        }
    }

    /// The owning node.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// The bucket's high-water mark version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Gets a registration, live or tombstoned.
    pub fn get(&self, key: &RegistrationKey) -> Option<&Registration> {
        self.entries.get(key).map(|slot| &slot.registration)
    }

    /// An iterator over every registration, including tombstones, in arbitrary order.
    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.entries.values().map(|slot| &slot.registration)
    }

    /// An iterator over live registrations in arbitrary order.
    pub fn live_registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations().filter(|reg| reg.is_live())
    }

    /// The number of stored registrations, including tombstones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Inserts or overwrites a live registration, returning the previous one.
    pub(crate) fn put(
        &mut self,
        key: RegistrationKey,
        actor_ref: ActorRef,
    ) -> (Registration, Option<Registration>) {
        let registration = Registration {
            key: key.clone(),
            actor_ref,
            version: self.next_version(),
            removed: false,
        };
        let previous = self.entries.insert(
            key,
            Slot {
                registration: registration.clone(),
                tombstoned_at: None,
            },
        );
        (registration, previous.map(|slot| slot.registration))
    }

    /// Tombstones a live registration, returning the registration it replaced.
    pub(crate) fn remove(
        &mut self,
        key: &RegistrationKey,
    ) -> Result<(Registration, Registration), RegistryError> {
        if !self.get(key).is_some_and(Registration::is_live) {
            return Err(RegistryError::NotFound { key: key.clone() });
        }

        let version = self.next_version();
        let slot = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        let previous = slot.registration.clone();
        slot.registration.version = version;
        slot.registration.removed = true;
        slot.tombstoned_at = Some(Instant::now());
        Ok((slot.registration.clone(), previous))
    }

    /// Applies one replicated registration if it is strictly newer than the stored one.
    ///
    /// A key that is absent because its tombstone was purged still counts as newer than any
    /// entry at or below the purged version. Returns the replaced registration (`Some(None)` when
    /// there was none), or `None` when the incoming entry was stale and nothing changed.
    pub(crate) fn merge(&mut self, incoming: Registration) -> Option<Option<Registration>> {
        match self.entries.get(&incoming.key) {
            Some(existing) if incoming.version <= existing.registration.version => return None,
            None if incoming.version <= self.purged_through => return None,
            _ => {}
        }

        self.version = self.version.max(incoming.version);
        let tombstoned_at = incoming.removed.then(Instant::now);
        let previous = self.entries.insert(
            incoming.key.clone(),
            Slot {
                registration: incoming,
                tombstoned_at,
            },
        );
        Some(previous.map(|slot| slot.registration))
    }

    /// Raises the high-water mark without touching entries.
    pub(crate) fn advance_version(&mut self, version: u64) {
        self.version = self.version.max(version);
    }

    /// Collects registrations newer than `since`, lowest version first, capped at `max_entries`.
    ///
    /// When the cap cuts the delta short, its version is the last included entry's, so the
    /// receiver asks for the rest next round.
    pub fn delta_since(&self, since: u64, max_entries: usize) -> BucketDelta {
        let mut entries: Vec<_> = self
            .registrations()
            .filter(|reg| reg.version > since)
            .cloned()
            .collect();
        entries.sort_by_key(|reg| reg.version);

        let version = if entries.len() > max_entries {
            entries.truncate(max_entries);
            entries.last().map(|reg| reg.version).unwrap_or(since)
        } else {
            self.version
        };

        BucketDelta {
            owner: self.owner,
            version,
            entries,
        }
    }

    /// Drops tombstones observed more than `ttl` before `now` whose version is at most
    /// `through`.
    pub(crate) fn purge_tombstones(
        &mut self,
        now: Instant,
        ttl: Duration,
        through: u64,
    ) -> Vec<Registration> {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, slot)| {
                slot.registration.version <= through
                    && slot
                        .tombstoned_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let purged: Vec<_> = expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|slot| slot.registration)
            .collect();
        if let Some(highest) = purged.iter().map(|reg| reg.version).max() {
            self.purged_through = self.purged_through.max(highest);
        }
        purged
    }
}
