use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{self, FutureExt, LocalBoxFuture};

use crate::disposable::{AsyncDispose, Disposable, DisposeResult};
use crate::lifecycle::TaskInfo;
use crate::task::{Dependent, OutputFuture};

/// Process-unique identity of a task or derived source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives every output of a source, in push order.
pub type Consumer<T> = Rc<dyn Fn(OutputFuture<T>)>;

/// Detaches a consumer from its source.
#[derive(Clone)]
pub struct Binding {
    unbind: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl Binding {
    pub(crate) fn new(unbind: impl FnOnce() + 'static) -> Self {
        Self {
            unbind: Rc::new(RefCell::new(Some(Box::new(unbind)))),
        }
    }

    /// Stops delivery. Idempotent.
    pub fn unbind(&self) {
        let unbind = self.unbind.borrow_mut().take();
        if let Some(unbind) = unbind {
            unbind();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.unbind.borrow().is_some()
    }
}

impl AsyncDispose for Binding {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        self.unbind();
        future::ready(Ok(())).boxed_local()
    }
}

/// Anything a task can depend on.
///
/// Only [`pipe`](Self::pipe) is essential. Sources with a lifecycle also
/// hand out [`Dependent`] handles that keep them running, and accept
/// teardown hooks that run once they stop for good.
pub trait TaskSource<T: Clone + 'static> {
    fn id(&self) -> TaskId;

    fn info(&self) -> TaskInfo;

    /// Attaches a consumer for the current and all future outputs.
    fn pipe(&self, consumer: Consumer<T>) -> Binding;

    /// Registers a dependent and makes sure the source is running.
    fn start(&self) -> Option<Dependent> {
        None
    }

    /// Disposes `hook` once the source is fully deactivated.
    ///
    /// Sources without a lifecycle never tear down, the default drops the
    /// hook without running it. Hooks that were disposed by their owner in
    /// the meantime may be forgotten early.
    fn on_teardown(&self, hook: Disposable) {
        drop(hook);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_binding_unbinds_once() {
        let count = Rc::new(Cell::new(0));
        let binding = Binding::new({
            let count = count.clone();
            move || count.set(count.get() + 1)
        });

        assert!(binding.is_bound());
        binding.clone().unbind();
        binding.dispose().await.unwrap();

        assert!(!binding.is_bound());
        assert_eq!(count.get(), 1);
    }
}
