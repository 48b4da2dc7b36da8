#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod container;
mod disposable;
pub mod engine;
mod error;
mod events;
mod lifecycle;
#[cfg(feature = "logging")]
pub mod logging;
mod pipeline;
pub mod scheduler;
mod task;
#[cfg(test)]
mod testing;
mod utils;

pub use crate::container::{Container, FromContainer, InstanceFactory, Token};
pub use crate::disposable::{AsyncDispose, CompositeDisposable, Disposable, DisposeResult, Phase};
pub use crate::error::*;
pub use crate::events::{Event, EventAggregator, Listener, Subscription};
pub use crate::lifecycle::{
    Lifecycle, LifecycleChannel, Signal, TaskFailure, TaskInfo, Transition, clear_failure_handler,
    set_failure_handler,
};
pub use crate::pipeline::Pipeline;
pub use crate::task::{
    Binding, Consumer, Dependent, Mapped, Outcome, OutputFuture, Task, TaskBuilder, TaskGraph,
    TaskId, TaskSource,
};
