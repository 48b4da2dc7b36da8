//! Lifecycle broadcast and disposal failure reporting.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::Rc;

use futures::future::{self, FutureExt, LocalBoxFuture, Shared};

use crate::error::DisposeError;
use crate::events::{Event, EventAggregator};
use crate::task::TaskId;

/// A lifecycle transition that may be awaited by any number of observers.
pub type Transition = Shared<LocalBoxFuture<'static, ()>>;

/// Name and identity of a task, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Cow<'static, str>,
}

impl Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// A dispose action of a task failed during deactivation.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TaskInfo,
    pub error: DisposeError,
}

/// Collects the transitions of every task answering a broadcast signal.
#[derive(Default)]
pub struct Signal {
    pending: RefCell<Vec<Transition>>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the signal wait for `transition`.
    pub fn wait_for(&self, transition: Transition) {
        self.pending.borrow_mut().push(transition);
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Resolves once every registered transition has finished.
    pub fn settled(&self) -> LocalBoxFuture<'static, ()> {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        future::join_all(pending).map(drop).boxed_local()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("pending", &self.len()).finish()
    }
}

/// Events broadcast to tasks attached to an [`EventAggregator<Lifecycle>`].
#[derive(Debug)]
pub enum Lifecycle {
    /// Every attached task should activate and register its transition.
    Activate(Signal),
    /// Every attached task should deactivate and register its transition.
    Deactivate(Signal),
    /// A dispose action of an attached task failed.
    Error(TaskFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleChannel {
    Activate,
    Deactivate,
    Error,
}

impl Event for Lifecycle {
    type Channel = LifecycleChannel;

    fn channel(&self) -> LifecycleChannel {
        match self {
            Lifecycle::Activate(_) => LifecycleChannel::Activate,
            Lifecycle::Deactivate(_) => LifecycleChannel::Deactivate,
            Lifecycle::Error(_) => LifecycleChannel::Error,
        }
    }
}

type FailureHandler = Rc<dyn Fn(&TaskFailure)>;

thread_local! {
    static FAILURE_HANDLER: RefCell<Option<FailureHandler>> = const { RefCell::new(None) };
}

/// Installs the handler for disposal failures nobody listens to.
///
/// Without a handler such failures are logged at `error` level.
pub fn set_failure_handler(handler: impl Fn(&TaskFailure) + 'static) {
    FAILURE_HANDLER.with(|slot| *slot.borrow_mut() = Some(Rc::new(handler)));
}

pub fn clear_failure_handler() {
    FAILURE_HANDLER.with(|slot| *slot.borrow_mut() = None);
}

/// Publishes a failure on every aggregator with an error listener, and
/// escalates it when there is none.
pub(crate) fn report(failure: TaskFailure, aggregators: &[EventAggregator<Lifecycle>]) {
    tracing::warn!(task = %failure.task, error = %failure.error, "dispose action failed");

    let observers: Vec<_> = aggregators
        .iter()
        .filter(|events| events.has_listeners(LifecycleChannel::Error))
        .collect();

    if observers.is_empty() {
        escalate(&failure);
        return;
    }

    let event = Lifecycle::Error(failure);
    for events in observers {
        events.publish(&event);
    }
}

fn escalate(failure: &TaskFailure) {
    let handler = FAILURE_HANDLER.with(|slot| slot.borrow().clone());

    match handler {
        Some(handler) => handler(failure),
        None => tracing::error!(
            task = %failure.task,
            error = %failure.error,
            "unobserved disposal failure"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::testing::{local, ticks};

    fn failure() -> TaskFailure {
        TaskFailure {
            task: TaskInfo {
                id: TaskId::next(),
                name: "foo".into(),
            },
            error: DisposeError::new(anyhow::anyhow!("bar")),
        }
    }

    #[test]
    fn test_report_to_listeners() {
        let events = EventAggregator::<Lifecycle>::new();
        let seen = Rc::new(Cell::new(0));

        let _sub = events.subscribe(
            LifecycleChannel::Error,
            Rc::new({
                let seen = seen.clone();
                move |event: &Lifecycle| {
                    if let Lifecycle::Error(failure) = event {
                        assert_eq!(failure.error.to_string(), "bar");
                        seen.set(seen.get() + 1);
                    }
                }
            }),
        );

        report(failure(), &[events.clone(), EventAggregator::new()]);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_report_escalates_unobserved() {
        let escalated = Rc::new(Cell::new(0));
        set_failure_handler({
            let escalated = escalated.clone();
            move |failure| {
                assert_eq!(failure.task.name, "foo");
                escalated.set(escalated.get() + 1);
            }
        });

        report(failure(), &[EventAggregator::new()]);
        clear_failure_handler();
        report(failure(), &[]);

        assert_eq!(escalated.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_waits_for_all() {
        local(async {
            let signal = Signal::new();
            let done = Rc::new(Cell::new(0));

            for n in 1..=3 {
                let done = done.clone();
                let transition = crate::scheduler::spawn(async move {
                    ticks(n).await;
                    done.set(done.get() + 1);
                })
                .map(drop)
                .boxed_local()
                .shared();
                signal.wait_for(transition);
            }

            assert_eq!(signal.len(), 3);
            signal.settled().await;
            assert_eq!(done.get(), 3);
            assert!(signal.is_empty());
        })
        .await;
    }
}
