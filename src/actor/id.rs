use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use internment::Intern;
use serde::{Deserialize, Serialize};

static ACTOR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies a node in the cluster.
///
/// The name is interned, so `NodeId` is `Copy` and comparisons are cheap. Ordering follows
/// the string value, which keeps iteration over nodes deterministic.
///
/// Bucket versions restart at zero with the process, so a restarted node should join under a
/// fresh `NodeId` (for example by appending an incarnation number to its name).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Intern<String>);

impl NodeId {
    /// Creates a node id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(Intern::new(name.into()))
    }

    /// Returns the node name.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.as_str())
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        NodeId::new(name)
    }
}

/// Allocates the next process-wide actor incarnation number.
///
/// Uses an atomic counter so values are unique across threads.
pub(crate) fn next_uid() -> u64 {
    ACTOR_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}
