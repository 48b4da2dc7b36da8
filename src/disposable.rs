//! Deferred, idempotent cleanup handles.

use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture, Shared};

use crate::error::{DisposeError, ResolveError};

/// Result of a disposal.
pub type DisposeResult = Result<(), DisposeError>;

/// Anything that can be disposed asynchronously.
///
/// This is the disposal contract used by [`Task::using`](crate::Task::using)
/// and by [`Container`](crate::Container) for the instances it owns.
pub trait AsyncDispose {
    /// Starts the disposal. The returned future resolves once it is complete.
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult>;
}

impl<D: AsyncDispose + ?Sized> AsyncDispose for Rc<D> {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        (**self).dispose()
    }
}

impl<D: AsyncDispose + ?Sized> AsyncDispose for Box<D> {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        (**self).dispose()
    }
}

type Action = Box<dyn FnOnce() -> LocalBoxFuture<'static, anyhow::Result<()>>>;

/// The observable state of a [`Disposable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No action has been bound yet.
    Unresolved,
    /// An action (possibly an empty one) is bound.
    Resolved,
    /// `dispose` has been called.
    Disposed,
}

struct DisposableState {
    sender: Option<oneshot::Sender<Option<Action>>>,
    receiver: Option<oneshot::Receiver<Option<Action>>>,
    resolved: bool,
    disposal: Option<Shared<LocalBoxFuture<'static, DisposeResult>>>,
}

/// A one-shot cleanup handle whose action can be decided later.
///
/// The action may be bound before or after [`dispose`](Self::dispose) is
/// called. Disposal waits for the action to become known, runs it exactly
/// once, and every further call to `dispose` returns the same completion.
/// If every handle is dropped before an action is bound, a pending disposal
/// completes without doing anything.
///
/// ```rust
/// # futures::executor::block_on(async {
/// use reactask::Disposable;
///
/// let handle = Disposable::new();
/// let done = handle.dispose();
///
/// handle.resolve_fn(|| {
///     println!("cleaning up");
///     Ok(())
/// })?;
///
/// done.await?;
/// # anyhow::Ok(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Disposable {
    state: Rc<RefCell<DisposableState>>,
}

impl Disposable {
    /// Creates an unresolved disposable.
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();

        Self {
            state: Rc::new(RefCell::new(DisposableState {
                sender: Some(sender),
                receiver: Some(receiver),
                resolved: false,
                disposal: None,
            })),
        }
    }

    /// Creates a disposable resolved with a synchronous action.
    pub fn from_fn<F>(action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        let disposable = Self::new();
        disposable.bind(Some(sync_action(action))).ok();
        disposable
    }

    /// Creates a disposable resolved with an asynchronous action.
    pub fn from_async<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let disposable = Self::new();
        disposable.bind(Some(async_action(action))).ok();
        disposable
    }

    /// Binds an asynchronous action.
    ///
    /// Fails if an action was already bound.
    pub fn resolve<F, Fut>(&self, action: F) -> Result<(), ResolveError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.bind(Some(async_action(action)))
    }

    /// Binds a synchronous action.
    ///
    /// Fails if an action was already bound.
    pub fn resolve_fn<F>(&self, action: F) -> Result<(), ResolveError>
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.bind(Some(sync_action(action)))
    }

    /// Marks the disposable as resolved with nothing to do.
    pub fn resolve_empty(&self) {
        // An empty action never conflicts.
        self.bind(None).ok();
    }

    fn bind(&self, action: Option<Action>) -> Result<(), ResolveError> {
        let mut state = self.state.borrow_mut();

        if action.is_some() && state.resolved {
            return Err(ResolveError);
        }

        state.resolved = true;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(action);
        }

        Ok(())
    }

    /// Disposes this handle. Idempotent.
    pub fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        let mut state = self.state.borrow_mut();

        if let Some(disposal) = &state.disposal {
            return disposal.clone().boxed_local();
        }

        let receiver = state.receiver.take();
        let disposal = async move {
            let action = match receiver {
                Some(receiver) => receiver.await.ok().flatten(),
                None => None,
            };

            match action {
                Some(action) => action().await.map_err(DisposeError::from),
                None => Ok(()),
            }
        }
        .boxed_local()
        .shared();

        state.disposal = Some(disposal.clone());
        disposal.boxed_local()
    }

    pub fn phase(&self) -> Phase {
        let state = self.state.borrow();

        if state.disposal.is_some() {
            Phase::Disposed
        } else if state.resolved {
            Phase::Resolved
        } else {
            Phase::Unresolved
        }
    }
}

impl Default for Disposable {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDispose for Disposable {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        Disposable::dispose(self)
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Disposable({:?})", self.phase())
    }
}

fn sync_action<F>(action: F) -> Action
where
    F: FnOnce() -> anyhow::Result<()> + 'static,
{
    Box::new(move || future::ready(action()).boxed_local())
}

fn async_action<F, Fut>(action: F) -> Action
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    Box::new(move || action().boxed_local())
}

/// Disposes a batch concurrently and reports the first failure once all of
/// them have finished.
pub(crate) fn dispose_all(
    disposals: Vec<LocalBoxFuture<'static, DisposeResult>>,
) -> LocalBoxFuture<'static, DisposeResult> {
    async move {
        future::join_all(disposals)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(drop)
    }
    .boxed_local()
}

/// A group of resources disposed together.
///
/// Every call to [`dispose`](Self::dispose) drains the resources added so
/// far, so each one is disposed exactly once no matter how often the group
/// is disposed.
#[derive(Clone, Default)]
pub struct CompositeDisposable {
    resources: Rc<RefCell<Vec<Box<dyn AsyncDispose>>>>,
}

impl CompositeDisposable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, resource: impl AsyncDispose + 'static) -> &Self {
        self.resources.borrow_mut().push(Box::new(resource));
        self
    }

    pub fn len(&self) -> usize {
        self.resources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.borrow().is_empty()
    }

    pub fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        let resources = std::mem::take(&mut *self.resources.borrow_mut());
        dispose_all(resources.iter().map(|r| r.dispose()).collect())
    }
}

impl AsyncDispose for CompositeDisposable {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        CompositeDisposable::dispose(self)
    }
}
