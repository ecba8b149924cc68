//! Actor identity as seen by the mediator.
//!
//! The mediator does not run actors itself. It only needs to name them, compare them, and learn
//! when they die. [`ActorRef`] is the value-type name, [`NodeId`] identifies cluster members,
//! and [`DeathWatch`] is the seam to whatever actor runtime delivers termination notifications.
//!
//! Termination notifications flow back to the mediator through
//! [`MediatorRef::terminated`](crate::mediator::MediatorRef::terminated).

mod actor_ref;
mod id;

use dyn_clone::DynClone;

pub use actor_ref::*;
pub use id::*;

/// Registers interest in actor termination with the actor runtime.
///
/// The mediator calls [`watch`](DeathWatch::watch) when an actor gains its first live local
/// registration and [`unwatch`](DeathWatch::unwatch) when the last one is removed. Each watch
/// is released exactly once, either through `unwatch` or because the actor terminated, and
/// implementations must treat a repeated `unwatch` as a no-op.
pub trait DeathWatch: DynClone + Send + Sync + 'static {
    /// Starts watching an actor. When it terminates the runtime must call
    /// [`MediatorRef::terminated`](crate::mediator::MediatorRef::terminated).
    fn watch(&self, actor_ref: &ActorRef);

    /// Stops watching an actor.
    fn unwatch(&self, actor_ref: &ActorRef);
}

dyn_clone::clone_trait_object!(DeathWatch);
