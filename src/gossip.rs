//! Delta gossip between mediators.
//!
//! Every round, the local node sends each reachable peer the part of its own bucket the peer
//! has not acknowledged yet, together with an acknowledgement of how much of the peer's bucket
//! it already holds. There is no other sequencing: deltas may be duplicated, lost or reordered,
//! and the version-based merge in [`Registry`] absorbs all of it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{
    actor::NodeId,
    cluster::MemberEvent,
    error::{GossipError, PayloadError},
    registry::{BucketDelta, MergeOutcome, Registry},
};

/// A message exchanged between mediators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// A slice of the sender's bucket, plus an acknowledgement of the receiver's bucket.
    Delta {
        /// The sending node, which is also the owner of `delta`.
        from: NodeId,
        /// The version of the receiver's bucket the sender holds.
        ack: u64,
        /// Registrations the receiver has not acknowledged yet.
        delta: BucketDelta,
    },
}

impl GossipMessage {
    /// The node that sent the message.
    pub fn from(&self) -> NodeId {
        match self {
            GossipMessage::Delta { from, .. } => *from,
        }
    }

    /// Encodes the message as MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a message previously encoded with [`to_bytes`](GossipMessage::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// What the local node knows about one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerState {
    /// The highest version of the local bucket the peer has acknowledged.
    pub acked: u64,
    /// Whether gossip is currently sent to the peer.
    pub reachable: bool,
}

/// Tracks cluster peers and computes gossip rounds.
#[derive(Debug)]
pub struct GossipEngine {
    local: NodeId,
    peers: HashMap<NodeId, PeerState>,
}

impl GossipEngine {
    /// Creates an engine with no known peers.
    pub fn new(local: NodeId) -> Self {
        GossipEngine {
            local,
            peers: HashMap::new(),
        }
    }

    /// Gets a peer's state.
    pub fn peer(&self, node: &NodeId) -> Option<&PeerState> {
        self.peers.get(node)
    }

    /// Returns `true` if the node is a current cluster member other than the local node.
    pub fn is_member(&self, node: &NodeId) -> bool {
        self.peers.contains_key(node)
    }

    /// Reachable peers, sorted.
    pub fn reachable_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, state)| state.reachable)
            .map(|(node, _)| *node)
            .collect();
        peers.sort();
        peers
    }

    /// The lowest local bucket version acknowledged by every member, reachable or not.
    ///
    /// Local tombstones above it may still be needed by some peer. Without peers nothing is
    /// outstanding and the result is `u64::MAX`.
    pub fn min_acked(&self) -> u64 {
        self.peers
            .values()
            .map(|state| state.acked)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Computes one round of outbound gossip, one message per reachable peer.
    ///
    /// A message is produced even when the delta is empty, so the peer keeps receiving
    /// acknowledgements of its own bucket.
    pub fn tick(
        &self,
        registry: &Registry,
        max_delta_elements: usize,
    ) -> Vec<(NodeId, GossipMessage)> {
        let local_bucket = registry.local_bucket();
        self.reachable_peers()
            .into_iter()
            .filter_map(|peer| {
                let state = self.peers.get(&peer)?;
                let delta = local_bucket.delta_since(state.acked, max_delta_elements);
                trace!(
                    %peer,
                    acked = state.acked,
                    entries = delta.entries.len(),
                    version = delta.version,
                    "computed delta"
                );
                let message = GossipMessage::Delta {
                    from: self.local,
                    ack: registry.bucket_version(&peer),
                    delta,
                };
                Some((peer, message))
            })
            .collect()
    }

    /// Handles gossip received from a peer.
    ///
    /// Messages from non-members are refused, so a delta arriving after a node was removed can
    /// never bring its bucket back.
    pub fn on_gossip(
        &mut self,
        registry: &mut Registry,
        message: GossipMessage,
    ) -> Result<MergeOutcome, GossipError> {
        match message {
            GossipMessage::Delta { from, ack, delta } => {
                let Some(state) = self.peers.get_mut(&from) else {
                    return Err(GossipError::UnknownMember(from));
                };
                if delta.owner != from {
                    return Err(GossipError::OwnerMismatch {
                        from,
                        owner: delta.owner,
                    });
                }

                // Not maxed: a peer that lost our bucket reports a lower ack and gets a full
                // resend.
                state.acked = ack;
                Ok(registry.merge_delta(&delta)?)
            }
        }
    }

    /// Applies a membership change.
    pub fn on_member_event(&mut self, registry: &mut Registry, event: MemberEvent) {
        let node = event.node();
        if node == self.local {
            return;
        }

        match event {
            MemberEvent::Up(node) => {
                self.peers
                    .entry(node)
                    .and_modify(|state| state.reachable = true)
                    .or_insert(PeerState {
                        acked: 0,
                        reachable: true,
                    });
                registry.add_node(node);
                info!(%node, "member up");
            }
            MemberEvent::Unreachable(node) => {
                if let Some(state) = self.peers.get_mut(&node) {
                    state.reachable = false;
                    info!(%node, "member unreachable, pausing gossip");
                }
            }
            MemberEvent::Reachable(node) => {
                if let Some(state) = self.peers.get_mut(&node) {
                    state.reachable = true;
                    info!(%node, "member reachable, resuming gossip");
                }
            }
            MemberEvent::Removed(node) => {
                self.peers.remove(&node);
                let pruned = registry.prune(&node);
                info!(%node, pruned, "member removed");
            }
        }
        debug!(peers = self.peers.len(), "membership updated");
    }
}
