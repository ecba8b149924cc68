//! The mediator's view of the surrounding cluster.
//!
//! Membership and delivery are owned by whatever cluster layer hosts the mediator. The mediator
//! only consumes [`MemberEvent`]s and hands outbound traffic to a [`Transport`].

use std::fmt;

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

use crate::{
    actor::{ActorRef, NodeId},
    gossip::GossipMessage,
    message::Payload,
};

/// A membership change reported by the cluster layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberEvent {
    /// A node joined and is ready to exchange gossip.
    Up(NodeId),
    /// A node stopped responding. Its registrations are kept.
    Unreachable(NodeId),
    /// A previously unreachable node is responding again.
    Reachable(NodeId),
    /// A node left the cluster for good. Its registrations are dropped.
    Removed(NodeId),
}

impl MemberEvent {
    /// The node the event is about.
    pub fn node(&self) -> NodeId {
        match self {
            MemberEvent::Up(node)
            | MemberEvent::Unreachable(node)
            | MemberEvent::Reachable(node)
            | MemberEvent::Removed(node) => *node,
        }
    }
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberEvent::Up(node) => write!(f, "MemberUp({node})"),
            MemberEvent::Unreachable(node) => write!(f, "UnreachableMember({node})"),
            MemberEvent::Reachable(node) => write!(f, "ReachableMember({node})"),
            MemberEvent::Removed(node) => write!(f, "MemberRemoved({node})"),
        }
    }
}

/// Outbound delivery used by the mediator.
///
/// Both methods are fire-and-forget. Delivery failures are the transport's to log; the mediator
/// never waits on them.
pub trait Transport: DynClone + Send + Sync + 'static {
    /// Delivers a user payload to an actor, local or remote.
    fn tell(&self, recipient: &ActorRef, message: Payload);

    /// Delivers a gossip message to the mediator running on `peer`.
    fn gossip(&self, peer: NodeId, message: GossipMessage);
}

dyn_clone::clone_trait_object!(Transport);
