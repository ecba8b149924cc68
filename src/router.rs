//! Resolution of routing requests into concrete recipients.
//!
//! The router reads the [`Registry`] at call time and never waits on gossip. Its only state is a
//! set of round robin cursors, one per `(topic, group)` and one per path, which spread
//! successive grouped publishes and point-to-point sends across candidates.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use tracing::trace;

use crate::{
    actor::{ActorRef, NodeId},
    error::RouteError,
    registry::Registry,
};

/// Identifies a round robin cursor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CursorKey {
    /// A subscription group within a topic.
    Group {
        /// The topic.
        topic: String,
        /// The group.
        group: String,
    },
    /// A registered path.
    Path(String),
}

/// Rotating position over an ordered candidate list.
///
/// The cursor remembers the candidates it last saw. When the list changes in any way the
/// offset restarts at the first candidate, so rotation is always reproducible from the current
/// membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundRobinCursor {
    offset: usize,
    members: Vec<ActorRef>,
}

impl RoundRobinCursor {
    /// Picks the next candidate and advances, or returns `None` if there are none.
    pub fn next(&mut self, candidates: &[ActorRef]) -> Option<ActorRef> {
        if candidates.is_empty() {
            return None;
        }
        if self.members != candidates {
            self.members = candidates.to_vec();
            self.offset = 0;
        }

        let picked = candidates[self.offset % candidates.len()].clone();
        self.offset = (self.offset + 1) % candidates.len();
        Some(picked)
    }

    /// The offset of the next pick.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Routing state for one mediator.
#[derive(Debug)]
pub struct Router {
    local: NodeId,
    /// Group cursors keyed by topic, then group.
    group_cursors: HashMap<String, HashMap<String, RoundRobinCursor>>,
    path_cursors: HashMap<String, RoundRobinCursor>,
}

impl Router {
    /// Creates a router for the mediator running on `local`.
    pub fn new(local: NodeId) -> Self {
        Router {
            local,
            group_cursors: HashMap::new(),
            path_cursors: HashMap::new(),
        }
    }

    /// Gets a cursor, if one has been created.
    pub fn cursor(&self, key: &CursorKey) -> Option<&RoundRobinCursor> {
        match key {
            CursorKey::Group { topic, group } => self.group_cursors.get(topic)?.get(group),
            CursorKey::Path(path) => self.path_cursors.get(path),
        }
    }

    /// The number of live cursors.
    pub fn cursor_count(&self) -> usize {
        self.group_cursors.values().map(HashMap::len).sum::<usize>() + self.path_cursors.len()
    }

    /// Resolves the recipients of a publish.
    ///
    /// Ungrouped subscribers always receive the message. Grouped subscribers all receive it,
    /// unless `one_per_group` is set, in which case each group receives it once through its own
    /// round robin cursor. Each recipient appears at most once.
    pub fn resolve_publish(
        &mut self,
        registry: &Registry,
        topic: &str,
        one_per_group: bool,
    ) -> Vec<ActorRef> {
        let mut recipients = Vec::new();
        let mut live_groups = Vec::new();

        let by_group = registry
            .lookup_by_topic(topic)
            .chunk_by(|candidate| candidate.group.clone());
        for (group, members) in &by_group {
            let refs: Vec<ActorRef> = members
                .map(|candidate| candidate.actor_ref.clone())
                .dedup()
                .collect();
            match group {
                Some(group) if one_per_group => {
                    let cursor = self
                        .group_cursors
                        .entry(topic.to_string())
                        .or_default()
                        .entry(group.clone())
                        .or_default();
                    if let Some(picked) = cursor.next(&refs) {
                        trace!(topic, %group, actor_ref = %picked, "picked group member");
                        recipients.push(picked);
                    }
                    live_groups.push(group);
                }
                Some(group) => {
                    recipients.extend(refs);
                    live_groups.push(group);
                }
                None => recipients.extend(refs),
            }
        }

        let emptied = self.group_cursors.get_mut(topic).is_some_and(|cursors| {
            cursors.retain(|group, _| live_groups.contains(group));
            cursors.is_empty()
        });
        if emptied {
            self.group_cursors.remove(topic);
        }

        recipients.into_iter().unique().collect()
    }

    /// Resolves the single recipient of a send.
    ///
    /// With `local_affinity`, a registration owned by the local node wins outright. Otherwise the
    /// path's round robin cursor picks among all candidates.
    pub fn resolve_send(
        &mut self,
        registry: &Registry,
        path: &str,
        local_affinity: bool,
    ) -> Result<ActorRef, RouteError> {
        let candidates: Vec<_> = registry.lookup_by_path(path).collect();
        if candidates.is_empty() {
            self.path_cursors.remove(path);
            return Err(RouteError::NoMatch {
                path: path.to_string(),
            });
        }

        if local_affinity {
            if let Some(local) = candidates.iter().find(|c| c.owner == self.local) {
                return Ok(local.actor_ref.clone());
            }
        }

        let refs: Vec<ActorRef> = candidates
            .into_iter()
            .map(|candidate| candidate.actor_ref.clone())
            .dedup()
            .collect();
        self.path_cursors
            .entry(path.to_string())
            .or_default()
            .next(&refs)
            .ok_or_else(|| RouteError::NoMatch {
                path: path.to_string(),
            })
    }

    /// Resolves one recipient per node registered at `path`.
    ///
    /// A node with several registrations is represented by its smallest actor ref. The local
    /// node is skipped when `all_but_self` is set.
    pub fn resolve_send_to_all(
        &self,
        registry: &Registry,
        path: &str,
        all_but_self: bool,
    ) -> Vec<ActorRef> {
        let mut per_owner: BTreeMap<NodeId, &ActorRef> = BTreeMap::new();
        for candidate in registry.lookup_by_path(path) {
            if all_but_self && candidate.owner == self.local {
                continue;
            }
            per_owner
                .entry(candidate.owner)
                .and_modify(|current| {
                    if candidate.actor_ref < **current {
                        *current = &candidate.actor_ref;
                    }
                })
                .or_insert(&candidate.actor_ref);
        }
        per_owner.into_values().cloned().collect()
    }

    /// Topics with at least one live subscriber, sorted.
    pub fn current_topics(&self, registry: &Registry) -> Vec<String> {
        registry.topics()
    }
}
