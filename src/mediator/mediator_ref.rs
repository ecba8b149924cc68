use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::{
    actor::{ActorRef, NodeId},
    cluster::MemberEvent,
    error::SendError,
    gossip::GossipMessage,
    message::{
        self, CountSubscribers, CurrentTopics, Publish, Put, Remove, SendToAll, Subscribe,
        SubscribeAck, Unsubscribe, UnsubscribeAck,
    },
};

/// A command queued to a running mediator.
#[derive(Debug)]
pub(crate) enum MediatorCommand {
    Put(Put),
    Remove(Remove),
    Subscribe {
        subscribe: Subscribe,
        reply: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        unsubscribe: Unsubscribe,
        reply: oneshot::Sender<UnsubscribeAck>,
    },
    Publish(Publish),
    Send(message::Send),
    SendToAll(SendToAll),
    GetTopics {
        reply: oneshot::Sender<CurrentTopics>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    CountSubscribers {
        count: CountSubscribers,
        reply: oneshot::Sender<usize>,
    },
    Gossip(GossipMessage),
    MemberEvent(MemberEvent),
    Terminated(ActorRef),
    GossipTick {
        reply: oneshot::Sender<usize>,
    },
    PruneTick {
        reply: oneshot::Sender<usize>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// A handle to a running mediator.
///
/// Fire-and-forget messages (`put`, `publish`, `send`, ...) only enqueue and return
/// immediately. Request-style messages (`subscribe`, `get_topics`, ...) wait for the mediator
/// to process them. Commands from one handle are processed in the order they were sent.
#[derive(Clone)]
pub struct MediatorRef {
    node: NodeId,
    mailbox_tx: mpsc::UnboundedSender<MediatorCommand>,
}

impl MediatorRef {
    pub(crate) fn new(node: NodeId, mailbox_tx: mpsc::UnboundedSender<MediatorCommand>) -> Self {
        MediatorRef { node, mailbox_tx }
    }

    /// The node the mediator runs on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns `true` if the mediator is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.mailbox_tx.is_closed()
    }

    /// Registers a local actor under its path.
    pub fn put(&self, put: Put) -> Result<(), SendError> {
        self.tell(MediatorCommand::Put(put))
    }

    /// Removes the local registration at a path.
    pub fn remove(&self, remove: Remove) -> Result<(), SendError> {
        self.tell(MediatorCommand::Remove(remove))
    }

    /// Subscribes an actor to a topic, waiting for the acknowledgement.
    ///
    /// The acknowledgement confirms the local registration only. Peers learn about it through
    /// gossip.
    pub async fn subscribe(&self, subscribe: Subscribe) -> Result<SubscribeAck, SendError> {
        self.ask(|reply| MediatorCommand::Subscribe { subscribe, reply })
            .await
    }

    /// Unsubscribes an actor from a topic, waiting for the acknowledgement.
    pub async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubscribeAck, SendError> {
        self.ask(|reply| MediatorCommand::Unsubscribe { unsubscribe, reply })
            .await
    }

    /// Publishes a message to a topic.
    pub fn publish(&self, publish: Publish) -> Result<(), SendError> {
        self.tell(MediatorCommand::Publish(publish))
    }

    /// Sends a message to one actor registered at a path.
    pub fn send(&self, send: message::Send) -> Result<(), SendError> {
        self.tell(MediatorCommand::Send(send))
    }

    /// Sends a message to one actor at a path on every node.
    pub fn send_to_all(&self, send_to_all: SendToAll) -> Result<(), SendError> {
        self.tell(MediatorCommand::SendToAll(send_to_all))
    }

    /// Gets the topics with live subscribers.
    pub async fn get_topics(&self) -> Result<CurrentTopics, SendError> {
        self.ask(|reply| MediatorCommand::GetTopics { reply }).await
    }

    /// Gets the number of live registrations known to the mediator.
    pub async fn count(&self) -> Result<usize, SendError> {
        self.ask(|reply| MediatorCommand::Count { reply }).await
    }

    /// Gets the number of live subscribers of a topic known to the mediator.
    pub async fn count_subscribers(&self, count: CountSubscribers) -> Result<usize, SendError> {
        self.ask(|reply| MediatorCommand::CountSubscribers { count, reply })
            .await
    }

    /// Delivers gossip received from a peer.
    pub fn gossip(&self, message: GossipMessage) -> Result<(), SendError> {
        self.tell(MediatorCommand::Gossip(message))
    }

    /// Delivers a membership change.
    pub fn member_event(&self, event: MemberEvent) -> Result<(), SendError> {
        self.tell(MediatorCommand::MemberEvent(event))
    }

    /// Notifies the mediator that a watched actor terminated.
    pub fn terminated(&self, actor_ref: ActorRef) -> Result<(), SendError> {
        self.tell(MediatorCommand::Terminated(actor_ref))
    }

    /// Runs a gossip round now, returning the number of peers gossiped to.
    pub async fn gossip_tick(&self) -> Result<usize, SendError> {
        self.ask(|reply| MediatorCommand::GossipTick { reply }).await
    }

    /// Purges expired tombstones now, returning how many were purged.
    pub async fn prune_tick(&self) -> Result<usize, SendError> {
        self.ask(|reply| MediatorCommand::PruneTick { reply }).await
    }

    /// Stops the mediator after the commands already queued, waiting for it to finish.
    pub async fn stop(&self) -> Result<(), SendError> {
        self.ask(|reply| MediatorCommand::Stop { reply }).await
    }

    fn tell(&self, command: MediatorCommand) -> Result<(), SendError> {
        self.mailbox_tx.send(command)?;
        Ok(())
    }

    async fn ask<T>(
        &self,
        command_fn: impl FnOnce(oneshot::Sender<T>) -> MediatorCommand,
    ) -> Result<T, SendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox_tx.send(command_fn(reply_tx))?;
        Ok(reply_rx.await?)
    }
}

impl fmt::Debug for MediatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediatorRef")
            .field("node", &self.node)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for MediatorRef {
    fn eq(&self, other: &Self) -> bool {
        self.mailbox_tx.same_channel(&other.mailbox_tx)
    }
}

impl Eq for MediatorRef {}
