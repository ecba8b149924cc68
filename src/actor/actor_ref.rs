use std::fmt;

use serde::{Deserialize, Serialize};

use super::{id::next_uid, NodeId};

/// A reference to an actor somewhere in the cluster.
///
/// `ActorRef` is a plain value: the node it lives on, its path on that node, and an
/// incarnation uid that tells apart successive actors spawned at the same path. It carries no
/// channel, so it can be replicated through gossip and compared structurally. Delivering to it
/// is the job of a [`Transport`](crate::cluster::Transport).
///
/// Refs are totally ordered by `(node, path, uid)`. The router relies on this order for
/// reproducible round robin and tie-breaking.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ActorRefParts")]
pub struct ActorRef {
    node: NodeId,
    path: String,
    uid: u64,
}

/// Wire shape of an [`ActorRef`]. Decoded refs go through [`ActorRef::new`].
#[derive(Deserialize)]
#[cfg_attr(test, derive(Serialize))]
struct ActorRefParts {
    node: NodeId,
    path: String,
    uid: u64,
}

impl From<ActorRefParts> for ActorRef {
    fn from(ActorRefParts { node, path, uid }: ActorRefParts) -> Self {
        ActorRef::new(node, path, uid)
    }
}

impl ActorRef {
    /// Creates an actor ref from its parts.
    ///
    /// A leading `/` is added to the path if missing.
    pub fn new(node: NodeId, path: impl Into<String>, uid: u64) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        ActorRef { node, path, uid }
    }

    /// Creates an actor ref with a freshly allocated uid.
    pub fn generate(node: NodeId, path: impl Into<String>) -> Self {
        ActorRef::new(node, path, next_uid())
    }

    /// The node the actor lives on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The actor's path on its node, without the node part.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The actor's incarnation uid.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Returns `true` if the actor lives on `node`.
    pub fn is_local_to(&self, node: NodeId) -> bool {
        self.node == node
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}", self.node, self.path, self.uid)
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({self})")
    }
}
