//! The single-threaded executor every task runs on.
//!
//! All coordination in this crate is expressed by sequencing futures on one
//! thread. Work that has to make progress whether or not anybody awaits it
//! (a run body, a pushed output, a disposal) is spawned onto a tokio
//! [`LocalSet`]. This means every operation that schedules work must be
//! called from inside a `LocalSet`, either one you drive yourself or the one
//! created by [`run`].

use std::future::Future;

use tokio::task::{JoinHandle, LocalSet};

/// Spawns a future onto the current `LocalSet`.
///
/// # Panics
///
/// Panics when called outside of a `LocalSet` context.
pub(crate) fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(future)
}

/// Runs `callback` on a later scheduling tick, after the current synchronous
/// turn has finished.
pub(crate) fn defer<F>(callback: F)
where
    F: FnOnce() + 'static,
{
    spawn(async move { callback() });
}

/// Yields to the executor once, letting every other ready task advance.
pub async fn tick() {
    tokio::task::yield_now().await
}

/// Executes a future on a fresh single-threaded runtime with a `LocalSet`,
/// blocking the current thread until it completes.
///
/// This is the simplest way to embed the task graph in a synchronous
/// program. Tasks that are still pending when `future` completes are
/// dropped together with the runtime.
///
/// # Example
///
/// ```rust
/// use reactask::{Task, scheduler};
///
/// let value = scheduler::run(async {
///     let task = Task::new(|_| async { Ok(21 * 2) });
///     let output = task.next_output();
///     let _dependent = task.start();
///     output.await
/// })
/// .unwrap();
///
/// assert_eq!(value.unwrap(), 42);
/// ```
pub fn run<F>(future: F) -> std::io::Result<F::Output>
where
    F: Future,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = LocalSet::new();
    Ok(local.block_on(&runtime, future))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_run_returns_output() {
        let out = run(async { 6 * 7 }).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_defer_runs_after_current_turn() {
        let log = Rc::new(RefCell::new(Vec::new()));

        run({
            let log = log.clone();
            async move {
                let inner = log.clone();
                defer(move || inner.borrow_mut().push("deferred"));
                log.borrow_mut().push("sync");
                tick().await;
                tick().await;
            }
        })
        .unwrap();

        assert_eq!(*log.borrow(), vec!["sync", "deferred"]);
    }
}
