use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{error, info, trace};

use super::{Mediator, MediatorCommand, MediatorRef};

impl Mediator {
    /// Spawns the mediator on the current tokio runtime and returns a handle to it.
    ///
    /// The spawned task processes commands sequentially and runs a gossip round every
    /// `gossip_interval` and a tombstone purge every `prune_interval`. It stops when
    /// [`MediatorRef::stop`] is called or every handle has been dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(self) -> MediatorRef {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let mediator_ref = MediatorRef::new(self.node, mailbox_tx);
        tokio::spawn(run_mediator_loop(self, mailbox_rx));
        mediator_ref
    }

    fn handle_command(&mut self, command: MediatorCommand) {
        match command {
            MediatorCommand::Put(put) => {
                let _ = self.handle_put(put);
            }
            MediatorCommand::Remove(remove) => self.handle_remove(remove),
            MediatorCommand::Subscribe { subscribe, reply } => {
                reply_to(reply, self.handle_subscribe(subscribe))
            }
            MediatorCommand::Unsubscribe { unsubscribe, reply } => {
                reply_to(reply, self.handle_unsubscribe(unsubscribe))
            }
            MediatorCommand::Publish(publish) => {
                self.handle_publish(publish);
            }
            MediatorCommand::Send(send) => {
                self.handle_send(send);
            }
            MediatorCommand::SendToAll(send_to_all) => {
                self.handle_send_to_all(send_to_all);
            }
            MediatorCommand::GetTopics { reply } => {
                reply_to(reply, self.handle_get_topics(crate::message::GetTopics))
            }
            MediatorCommand::Count { reply } => {
                reply_to(reply, self.handle_count(crate::message::Count))
            }
            MediatorCommand::CountSubscribers { count, reply } => {
                reply_to(reply, self.handle_count_subscribers(count))
            }
            MediatorCommand::Gossip(message) => self.handle_gossip(message),
            MediatorCommand::MemberEvent(event) => self.handle_member_event(event),
            MediatorCommand::Terminated(actor_ref) => self.handle_terminated(&actor_ref),
            MediatorCommand::GossipTick { reply } => reply_to(reply, self.gossip_tick()),
            MediatorCommand::PruneTick { reply } => {
                reply_to(reply, self.prune_tick(Instant::now()))
            }
            MediatorCommand::Stop { .. } => {
                error!("stop must be handled by the run loop");
            }
        }
    }
}

async fn run_mediator_loop(
    mut mediator: Mediator,
    mut mailbox_rx: mpsc::UnboundedReceiver<MediatorCommand>,
) {
    let node = mediator.node();
    let gossip_interval = mediator.config().gossip_interval;
    let prune_interval = mediator.config().prune_interval;

    let mut gossip_ticker = time::interval_at(Instant::now() + gossip_interval, gossip_interval);
    gossip_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut prune_ticker = time::interval_at(Instant::now() + prune_interval, prune_interval);
    prune_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%node, "mediator started");

    let stop_reply = loop {
        tokio::select! {
            command = mailbox_rx.recv() => match command {
                Some(MediatorCommand::Stop { reply }) => break Some(reply),
                Some(command) => mediator.handle_command(command),
                None => break None,
            },
            _ = gossip_ticker.tick() => {
                mediator.gossip_tick();
            }
            _ = prune_ticker.tick() => {
                let purged = mediator.prune_tick(Instant::now());
                trace!(%node, purged, "prune tick");
            }
        }
    };

    mailbox_rx.close();
    drop(mailbox_rx);
    info!(%node, "mediator stopped");
    if let Some(reply) = stop_reply {
        reply_to(reply, ());
    }
}

fn reply_to<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        trace!("reply receiver dropped");
    }
}
