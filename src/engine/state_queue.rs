use futures::future::{self, FutureExt, LocalBoxFuture, Shared};

use crate::scheduler;

/// A wrapper future handed out by [`StateQueue::append`].
pub type Ordered<O> = Shared<LocalBoxFuture<'static, O>>;

/// A queue that makes futures settle in the order they were appended.
///
/// Each appended future is wrapped. The wrapper completes with the same
/// value as the original, but never before the wrapper of the previously
/// appended future has completed. Failures are just values here: a failed
/// item does not poison the items behind it.
///
/// Every item is spawned together with the wait on its predecessor, so slow
/// items at the front don't delay the actual work of later ones, only the
/// moment they are observed. Settled items let go of their predecessor, so
/// the queue never builds a chain longer than what is still in flight.
/// Appending must happen inside a `LocalSet`.
pub struct StateQueue<O: Clone + 'static> {
    tail: Shared<LocalBoxFuture<'static, ()>>,
    latest: Option<Ordered<O>>,
}

impl<O: Clone + 'static> StateQueue<O> {
    pub fn new() -> Self {
        Self {
            tail: future::ready(()).boxed_local().shared(),
            latest: None,
        }
    }

    /// Appends a future and returns its ordered wrapper.
    pub fn append<F>(&mut self, state: F) -> Ordered<O>
    where
        F: Future<Output = O> + 'static,
    {
        let prev = self.tail.clone();
        let handle = scheduler::spawn(async move {
            let ((), out) = future::join(prev, state).await;
            out
        });

        let wrapper = async move {
            match handle.await {
                Ok(out) => out,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                // The runtime is shutting down.
                Err(_) => future::pending().await,
            }
        }
        .boxed_local()
        .shared();

        self.tail = wrapper.clone().map(drop).boxed_local().shared();
        self.latest = Some(wrapper.clone());

        wrapper
    }

    /// The most recently appended wrapper, if any.
    pub fn latest(&self) -> Option<Ordered<O>> {
        self.latest.clone()
    }

    /// Forgets the latest wrapper. Ordering of in-flight items is kept.
    pub fn clear(&mut self) {
        self.latest = None;
    }
}

impl<O: Clone + 'static> Default for StateQueue<O> {
    fn default() -> Self {
        Self::new()
    }
}
