use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::container::{Container, FromContainer, Token};
use crate::error::ContainerError;
use crate::events::EventAggregator;
use crate::lifecycle::{Lifecycle, Signal};

/// A lifecycle channel shared by the tasks of one container scope.
///
/// Tasks attached to the pipeline activate and deactivate together. The
/// pipeline also receives their disposal failures as [`Lifecycle::Error`]
/// events.
#[derive(Clone, Default)]
pub struct Pipeline {
    events: EventAggregator<Lifecycle>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pipeline of a container scope, created on first use.
    pub fn of(container: &Container) -> Result<Rc<Pipeline>, ContainerError> {
        container.get(&Token::<Pipeline>::class())
    }

    pub fn events(&self) -> &EventAggregator<Lifecycle> {
        &self.events
    }

    /// Activates every attached task. Resolves once all of them finished
    /// activating.
    pub fn activate(&self) -> LocalBoxFuture<'static, ()> {
        self.broadcast(Lifecycle::Activate(Signal::new()))
    }

    /// Deactivates every attached task. Resolves once all of them finished
    /// deactivating.
    pub fn deactivate(&self) -> LocalBoxFuture<'static, ()> {
        self.broadcast(Lifecycle::Deactivate(Signal::new()))
    }

    fn broadcast(&self, event: Lifecycle) -> LocalBoxFuture<'static, ()> {
        self.events.publish(&event);

        match event {
            Lifecycle::Activate(signal) | Lifecycle::Deactivate(signal) => signal.settled(),
            Lifecycle::Error(_) => futures::future::ready(()).boxed_local(),
        }
    }
}

impl FromContainer for Pipeline {
    fn from_container(_: &Container) -> Self {
        Pipeline::new()
    }
}
