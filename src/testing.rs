use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use crate::task::{Binding, Outcome, OutputFuture, TaskSource};

/// Drives `future` inside a fresh `LocalSet`.
pub(crate) async fn local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}

/// Sleeps for `n` virtual milliseconds. Tests run with a paused clock, so
/// this is a deterministic unit of time.
pub(crate) async fn ticks(n: u64) {
    tokio::time::sleep(Duration::from_millis(n)).await
}

/// Records every output delivered by a source, in delivery order.
pub(crate) struct Capture<T: Clone + 'static> {
    outputs: Rc<RefCell<Vec<OutputFuture<T>>>>,
    binding: Binding,
}

impl<T: Clone + 'static> Capture<T> {
    pub(crate) fn pipe(source: &impl TaskSource<T>) -> Self {
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let binding = source.pipe(Rc::new({
            let outputs = outputs.clone();
            move |output: OutputFuture<T>| outputs.borrow_mut().push(output)
        }));

        Self { outputs, binding }
    }

    pub(crate) fn len(&self) -> usize {
        self.outputs.borrow().len()
    }

    pub(crate) fn outputs(&self) -> Vec<OutputFuture<T>> {
        self.outputs.borrow().clone()
    }

    /// Awaits every output delivered so far.
    pub(crate) async fn settled(&self) -> Vec<Outcome<T>> {
        let outputs = self.outputs.borrow().clone();
        futures::future::join_all(outputs).await
    }

    /// Awaits the delivered outputs and keeps only the values.
    pub(crate) async fn values(&self) -> Vec<T> {
        self.settled()
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    pub(crate) fn unbind(&self) {
        self.binding.unbind();
    }
}
