//! Defines error handling constructs for the pubsub mediator.
//!
//! Most failures in this crate are best-effort by contract: a publish with no subscribers or a
//! remove of an unknown path is logged and absorbed rather than surfaced. The types here cover
//! the few places where a caller genuinely needs to know something went wrong, such as building
//! an invalid subscription or talking to a mediator that has stopped.

use thiserror::Error;

use crate::{
    actor::{ActorRef, NodeId},
    registry::RegistrationKey,
};

/// A contract message was constructed with invalid arguments.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidArgument {
    /// `Subscribe` or `Unsubscribe` was built without a topic.
    #[error("topic must be defined")]
    EmptyTopic,
}

/// Errors raised by local registry mutations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live registration exists for the key in the local bucket.
    #[error("no live registration for '{key}'")]
    NotFound {
        /// The key that was looked up.
        key: RegistrationKey,
    },
    /// The actor ref does not live on the local node, so it cannot be put in the local bucket.
    #[error("actor ref {actor_ref} is not local to node {local}")]
    NotLocal {
        /// The rejected actor ref.
        actor_ref: ActorRef,
        /// The local node.
        local: NodeId,
    },
    /// A delta claiming to be authored by the local node was received from a peer.
    #[error("refusing to merge a delta for the local bucket of {owner}")]
    ForeignWrite {
        /// The owner named by the delta.
        owner: NodeId,
    },
}

/// Errors from handling an inbound gossip message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GossipError {
    /// The sender is not a current cluster member.
    #[error("gossip from unknown member {0}")]
    UnknownMember(NodeId),
    /// The delta names an owner other than the node that sent it.
    #[error("gossip from {from} carries a delta owned by {owner}")]
    OwnerMismatch {
        /// The sending node.
        from: NodeId,
        /// The owner named in the delta.
        owner: NodeId,
    },
    /// Merging the delta failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from resolving a routing request.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No live registration matches the path.
    #[error("no registration matches path '{path}'")]
    NoMatch {
        /// The requested path.
        path: String,
    },
}

/// Error that can occur when sending a command to a mediator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The mediator's mailbox is closed.
    #[error("mediator not running")]
    MediatorNotRunning,
    /// The mediator stopped before a reply could be received.
    #[error("mediator stopped")]
    MediatorStopped,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SendError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SendError::MediatorNotRunning
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SendError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        SendError::MediatorStopped
    }
}

/// Errors from encoding or decoding payloads and gossip messages.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Failed to serialize.
    #[error("failed to encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// Failed to deserialize.
    #[error("failed to decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Errors from validating a [`MediatorConfig`](crate::config::MediatorConfig).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
