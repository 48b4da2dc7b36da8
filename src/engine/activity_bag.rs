use std::cell::Cell;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use tokio::sync::Notify;

use crate::scheduler;

struct BagState {
    pending: Cell<usize>,
    idle: Notify,
}

/// Counts one registered activity until it settles, unwinding included.
struct Pending(Rc<BagState>);

impl Drop for Pending {
    fn drop(&mut self) {
        let pending = self.0.pending.get() - 1;
        self.0.pending.set(pending);

        if pending == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A barrier over pending work.
///
/// Work is registered with [`put`](Self::put), and [`empty`](Self::empty)
/// resolves once everything registered so far has settled, including work
/// registered while waiting. The bag only observes timing, the outputs and
/// errors of registered futures are discarded.
///
/// Registered work is spawned onto the current `LocalSet`, so it makes
/// progress whether or not anybody waits for the bag.
#[derive(Clone)]
pub struct ActivityBag {
    state: Rc<BagState>,
}

impl ActivityBag {
    pub fn new() -> Self {
        Self {
            state: Rc::new(BagState {
                pending: Cell::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Registers pending work.
    pub fn put<F>(&self, activity: F)
    where
        F: Future + 'static,
    {
        self.state.pending.set(self.state.pending.get() + 1);

        let pending = Pending(self.state.clone());
        scheduler::spawn(async move {
            let _pending = pending;
            activity.await;
        });
    }

    /// Resolves once no registered work is pending.
    pub fn empty(&self) -> LocalBoxFuture<'static, ()> {
        let state = self.state.clone();

        async move {
            loop {
                let idle = state.idle.notified();
                if state.pending.get() == 0 {
                    break;
                }
                idle.await;
            }
        }
        .boxed_local()
    }
}

impl Default for ActivityBag {
    fn default() -> Self {
        Self::new()
    }
}
