//! The mediator's public message contract.
//!
//! These are plain values with structural equality and a stable string rendering. Clients send
//! them to a [`MediatorRef`](crate::mediator::MediatorRef); only [`Subscribe`] and
//! [`Unsubscribe`] are acknowledged, everything else is fire-and-forget.
//!
//! Message payloads are opaque [`Payload`] buffers. The mediator routes them without looking
//! inside.

use std::{fmt, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    actor::ActorRef,
    error::{InvalidArgument, PayloadError},
};

/// An opaque message body passed through the mediator unmodified.
///
/// Cloning is cheap, so one payload can be fanned out to many recipients.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// Wraps raw bytes.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Payload(bytes.into())
    }

    /// Serializes a value into a payload using MessagePack.
    pub fn encode<T>(value: &T) -> Result<Self, PayloadError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = rmp_serde::to_vec_named(value)?;
        Ok(Payload(bytes.into()))
    }

    /// Deserializes the payload into a value.
    pub fn decode<T>(&self) -> Result<T, PayloadError>
    where
        T: DeserializeOwned,
    {
        Ok(rmp_serde::from_slice(&self.0)?)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The number of bytes in the payload.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the payload has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Registers an actor under its own path in the local bucket.
///
/// The actor must live on the mediator's node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Put {
    /// The actor to register.
    pub actor_ref: ActorRef,
}

impl Put {
    /// Creates a put message.
    pub fn new(actor_ref: ActorRef) -> Self {
        Put { actor_ref }
    }
}

impl fmt::Display for Put {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Put<ref:{}>", self.actor_ref)
    }
}

/// Removes a previously put path from the local bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remove {
    /// The registered path.
    pub path: String,
}

impl Remove {
    /// Creates a remove message.
    pub fn new(path: impl Into<String>) -> Self {
        Remove { path: path.into() }
    }
}

impl fmt::Display for Remove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remove<path:{}>", self.path)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SubscriptionFields {
    topic: String,
    group: Option<String>,
    actor_ref: ActorRef,
}

fn validate_subscription(
    topic: String,
    group: Option<String>,
) -> Result<(String, Option<String>), InvalidArgument> {
    if topic.is_empty() {
        return Err(InvalidArgument::EmptyTopic);
    }
    Ok((topic, group.filter(|group| !group.is_empty())))
}

fn fmt_group(group: &Option<String>) -> &str {
    group.as_deref().unwrap_or("")
}

/// Subscribes an actor to a topic, optionally as a member of a group.
///
/// Members of the same group share messages published with
/// [`send_one_message_to_each_group`](Publish::send_one_message_to_each_group).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SubscriptionFields", into = "SubscriptionFields")]
pub struct Subscribe {
    topic: String,
    group: Option<String>,
    actor_ref: ActorRef,
}

impl Subscribe {
    /// Creates an ungrouped subscription.
    ///
    /// Fails if `topic` is empty.
    pub fn new(topic: impl Into<String>, actor_ref: ActorRef) -> Result<Self, InvalidArgument> {
        Subscribe::with_group(topic, None::<String>, actor_ref)
    }

    /// Creates a subscription in `group`. An empty group name means no group.
    ///
    /// Fails if `topic` is empty.
    pub fn with_group(
        topic: impl Into<String>,
        group: impl Into<Option<String>>,
        actor_ref: ActorRef,
    ) -> Result<Self, InvalidArgument> {
        let (topic, group) = validate_subscription(topic.into(), group.into())?;
        Ok(Subscribe {
            topic,
            group,
            actor_ref,
        })
    }

    /// The topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The group, if any.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The subscribing actor.
    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor_ref
    }
}

impl TryFrom<SubscriptionFields> for Subscribe {
    type Error = InvalidArgument;

    fn try_from(fields: SubscriptionFields) -> Result<Self, Self::Error> {
        Subscribe::with_group(fields.topic, fields.group, fields.actor_ref)
    }
}

impl From<Subscribe> for SubscriptionFields {
    fn from(msg: Subscribe) -> Self {
        SubscriptionFields {
            topic: msg.topic,
            group: msg.group,
            actor_ref: msg.actor_ref,
        }
    }
}

impl fmt::Display for Subscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subscribe<topic:{}, group:{}, ref:{}>",
            self.topic,
            fmt_group(&self.group),
            self.actor_ref
        )
    }
}

/// Removes a subscription created by a matching [`Subscribe`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SubscriptionFields", into = "SubscriptionFields")]
pub struct Unsubscribe {
    topic: String,
    group: Option<String>,
    actor_ref: ActorRef,
}

impl Unsubscribe {
    /// Creates an ungrouped unsubscription.
    ///
    /// Fails if `topic` is empty.
    pub fn new(topic: impl Into<String>, actor_ref: ActorRef) -> Result<Self, InvalidArgument> {
        Unsubscribe::with_group(topic, None::<String>, actor_ref)
    }

    /// Creates an unsubscription from `group`. An empty group name means no group.
    ///
    /// Fails if `topic` is empty.
    pub fn with_group(
        topic: impl Into<String>,
        group: impl Into<Option<String>>,
        actor_ref: ActorRef,
    ) -> Result<Self, InvalidArgument> {
        let (topic, group) = validate_subscription(topic.into(), group.into())?;
        Ok(Unsubscribe {
            topic,
            group,
            actor_ref,
        })
    }

    /// The topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The group, if any.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The unsubscribing actor.
    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor_ref
    }
}

impl TryFrom<SubscriptionFields> for Unsubscribe {
    type Error = InvalidArgument;

    fn try_from(fields: SubscriptionFields) -> Result<Self, Self::Error> {
        Unsubscribe::with_group(fields.topic, fields.group, fields.actor_ref)
    }
}

impl From<Unsubscribe> for SubscriptionFields {
    fn from(msg: Unsubscribe) -> Self {
        SubscriptionFields {
            topic: msg.topic,
            group: msg.group,
            actor_ref: msg.actor_ref,
        }
    }
}

impl fmt::Display for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unsubscribe<topic:{}, group:{}, ref:{}>",
            self.topic,
            fmt_group(&self.group),
            self.actor_ref
        )
    }
}

/// Acknowledges that a [`Subscribe`] was registered locally.
///
/// This confirms the local registration only, not propagation to the rest of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// The acknowledged subscription.
    pub subscribe: Subscribe,
}

impl fmt::Display for SubscribeAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscribeAck<{}>", self.subscribe)
    }
}

/// Acknowledges that an [`Unsubscribe`] was applied locally.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnsubscribeAck {
    /// The acknowledged unsubscription.
    pub unsubscribe: Unsubscribe,
}

impl fmt::Display for UnsubscribeAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsubscribeAck<{}>", self.unsubscribe)
    }
}

/// Publishes a message to every subscriber of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Publish {
    /// The topic.
    pub topic: String,
    /// The message delivered to subscribers.
    pub message: Payload,
    /// Deliver to a single member of each group instead of every member.
    ///
    /// Ungrouped subscribers always receive the message.
    pub send_one_message_to_each_group: bool,
}

impl Publish {
    /// Creates a publish message delivered to every subscriber.
    pub fn new(topic: impl Into<String>, message: Payload) -> Self {
        Publish {
            topic: topic.into(),
            message,
            send_one_message_to_each_group: false,
        }
    }

    /// Sets whether only one member of each group receives the message.
    pub fn send_one_message_to_each_group(mut self, enabled: bool) -> Self {
        self.send_one_message_to_each_group = enabled;
        self
    }
}

impl fmt::Display for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publish<topic:{}, sendOneToEachGroup:{}, message:{}>",
            self.topic, self.send_one_message_to_each_group, self.message
        )
    }
}

/// Sends a message to one actor registered at a path, anywhere in the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Send {
    /// The registered path.
    pub path: String,
    /// The message.
    pub message: Payload,
    /// Prefer an actor on the mediator's own node when one is registered.
    pub local_affinity: bool,
}

impl Send {
    /// Creates a send message without local affinity.
    pub fn new(path: impl Into<String>, message: Payload) -> Self {
        Send {
            path: path.into(),
            message,
            local_affinity: false,
        }
    }

    /// Sets local affinity.
    pub fn local_affinity(mut self, enabled: bool) -> Self {
        self.local_affinity = enabled;
        self
    }
}

impl fmt::Display for Send {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Send<path:{}, localAffinity:{}, message:{}>",
            self.path, self.local_affinity, self.message
        )
    }
}

/// Sends a message to one actor at a path on every node that registered it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendToAll {
    /// The registered path.
    pub path: String,
    /// The message.
    pub message: Payload,
    /// Skip the mediator's own node.
    pub all_but_self: bool,
}

impl SendToAll {
    /// Creates a send-to-all message including the local node.
    pub fn new(path: impl Into<String>, message: Payload) -> Self {
        SendToAll {
            path: path.into(),
            message,
            all_but_self: false,
        }
    }

    /// Sets whether the local node is skipped.
    pub fn all_but_self(mut self, enabled: bool) -> Self {
        self.all_but_self = enabled;
        self
    }
}

impl fmt::Display for SendToAll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SendToAll<path:{}, allButSelf:{}, message:{}>",
            self.path, self.all_but_self, self.message
        )
    }
}

/// Requests the topics with at least one live subscriber. Replied with [`CurrentTopics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetTopics;

impl fmt::Display for GetTopics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GetTopics<>")
    }
}

/// Snapshot of the topics known to a mediator, sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrentTopics {
    /// Topic names.
    pub topics: Vec<String>,
}

impl fmt::Display for CurrentTopics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CurrentTopics<{}>", self.topics.join(","))
    }
}

/// Requests the number of live registrations across the cluster view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Count;

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Count<>")
    }
}

/// Requests the number of live subscribers of a topic across the cluster view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountSubscribers {
    /// The topic.
    pub topic: String,
}

impl CountSubscribers {
    /// Creates a count request for `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        CountSubscribers {
            topic: topic.into(),
        }
    }
}

impl fmt::Display for CountSubscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountSubscribers<topic:{}>", self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::NodeId;

    fn actor(path: &str) -> ActorRef {
        ActorRef::new(NodeId::new("node-1"), path, 1)
    }

    #[test]
    fn subscribe_requires_topic() {
        assert_eq!(
            Subscribe::new("", actor("/user/a")),
            Err(InvalidArgument::EmptyTopic)
        );
        assert_eq!(
            Unsubscribe::with_group("", "group".to_string(), actor("/user/a")),
            Err(InvalidArgument::EmptyTopic)
        );
    }

    #[test]
    fn empty_group_means_no_group() {
        let msg = Subscribe::with_group("news", String::new(), actor("/user/a")).unwrap();
        assert_eq!(msg.group(), None);
        assert_eq!(msg, Subscribe::new("news", actor("/user/a")).unwrap());
    }

    #[test]
    fn messages_use_structural_equality() {
        let payload = Payload::from_bytes(vec![1, 2, 3]);
        assert_eq!(
            Publish::new("news", payload.clone()),
            Publish::new("news", Payload::from_bytes(vec![1, 2, 3]))
        );
        assert_ne!(
            Publish::new("news", payload.clone()),
            Publish::new("news", payload).send_one_message_to_each_group(true)
        );
        assert_eq!(GetTopics, GetTopics::default());
    }

    #[test]
    fn string_rendering() {
        let sub =
            Subscribe::with_group("news", "g1".to_string(), actor("/user/a")).unwrap();
        assert_eq!(
            sub.to_string(),
            "Subscribe<topic:news, group:g1, ref:node-1/user/a#1>"
        );
        assert_eq!(
            SubscribeAck { subscribe: sub }.to_string(),
            "SubscribeAck<Subscribe<topic:news, group:g1, ref:node-1/user/a#1>>"
        );

        let unsub = Unsubscribe::new("news", actor("/user/a")).unwrap();
        assert_eq!(
            UnsubscribeAck { unsubscribe: unsub }.to_string(),
            "UnsubscribeAck<Unsubscribe<topic:news, group:, ref:node-1/user/a#1>>"
        );

        assert_eq!(
            Put::new(actor("/user/a")).to_string(),
            "Put<ref:node-1/user/a#1>",
        );
        assert_eq!(Remove::new("/user/a").to_string(), "Remove<path:/user/a>");

        let payload = Payload::from_bytes(vec![0; 4]);
        assert_eq!(
            Publish::new("news", payload.clone()).to_string(),
            "Publish<topic:news, sendOneToEachGroup:false, message:Payload(4 bytes)>"
        );
        assert_eq!(
            Send::new("/user/a", payload.clone())
                .local_affinity(true)
                .to_string(),
            "Send<path:/user/a, localAffinity:true, message:Payload(4 bytes)>"
        );
        assert_eq!(
            SendToAll::new("/user/a", payload).to_string(),
            "SendToAll<path:/user/a, allButSelf:false, message:Payload(4 bytes)>"
        );
        assert_eq!(GetTopics.to_string(), "GetTopics<>");
        assert_eq!(
            CurrentTopics {
                topics: vec!["a".to_string(), "b".to_string()]
            }
            .to_string(),
            "CurrentTopics<a,b>"
        );
    }

    #[test]
    fn payload_encodes_serde_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Greeting {
            text: String,
        }

        let payload = Payload::encode(&Greeting {
            text: "hello".to_string(),
        })
        .unwrap();
        let greeting: Greeting = payload.decode().unwrap();
        assert_eq!(greeting.text, "hello");
        assert!(payload.decode::<u64>().is_err());
    }

    #[test]
    fn deserializing_rejects_empty_topic() {
        let fields = SubscriptionFields {
            topic: String::new(),
            group: None,
            actor_ref: actor("/user/a"),
        };
        let bytes = rmp_serde::to_vec_named(&fields).unwrap();
        assert!(rmp_serde::from_slice::<Subscribe>(&bytes).is_err());
    }
}
