//! The task graph.
//!
//! A [`Task`] is a node producing a stream of outputs. While active it runs
//! its body once per activation epoch; the body may depend on other sources
//! through [`Task::use_output`], which ties the task's lifetime to theirs:
//! whenever a used source emits again the task resets and runs anew.

mod extension;
mod graph;
mod source;

use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture, Shared};

use crate::disposable::{AsyncDispose, Disposable, DisposeResult, Phase};
use crate::engine::{ActivityBag, StateQueue};
use crate::error::{DisposeError, OutputError};
use crate::events::{EventAggregator, Subscription};
use crate::lifecycle::{self, Lifecycle, LifecycleChannel, TaskFailure, TaskInfo, Transition};
use crate::pipeline::Pipeline;
use crate::scheduler;
use crate::utils::panic_message;

pub use crate::task::extension::Mapped;
pub use crate::task::graph::TaskGraph;
pub use crate::task::source::{Binding, Consumer, TaskId, TaskSource};

/// A single output of a task.
pub type Outcome<T> = Result<T, OutputError>;

/// An output as seen by consumers. Settles in push order.
pub type OutputFuture<T> = Shared<LocalBoxFuture<'static, Outcome<T>>>;

type AsyncBody<T> = Rc<dyn Fn(Task<T>) -> LocalBoxFuture<'static, anyhow::Result<T>>>;
type SyncBody<T> = Rc<dyn Fn(&Task<T>) -> anyhow::Result<()>>;

enum Body<T: Clone + 'static> {
    /// The resolved value is pushed as the output of the run.
    Async(AsyncBody<T>),
    /// Outputs are pushed by the body itself.
    Sync(SyncBody<T>),
}

struct ConsumerSlot<T> {
    consumer: Consumer<T>,
    bound: Cell<bool>,
    fed: Cell<bool>,
}

struct Attachment {
    events: EventAggregator<Lifecycle>,
    subscriptions: [Subscription; 2],
}

struct TaskState<T> {
    active: bool,
    epoch: u64,
    resetting: bool,
    started: Option<Transition>,
    settling: Option<Transition>,
    idle: Vec<oneshot::Sender<Transition>>,
    consumers: Vec<Rc<ConsumerSlot<T>>>,
    resources: Vec<Box<dyn AsyncDispose>>,
    persistent: Vec<Box<dyn AsyncDispose>>,
    /// Pipes opened by `use_output`. They outlive resets so that a run
    /// still waiting on a first output gets it; full deactivation cuts them.
    uses: Vec<Binding>,
    /// Teardown hooks of pending uses by dependents.
    hooks: Vec<Disposable>,
    /// Results of `use_output` for the current epoch.
    sources: HashMap<TaskId, Box<dyn Any>>,
    dependencies: HashMap<TaskId, Option<Dependent>>,
    /// Edges of the previous epoch, waiting to be reclaimed or released.
    stale: HashMap<TaskId, Option<Dependent>>,
    dependents: HashSet<u64>,
    next_dependent: u64,
    attachments: Vec<Attachment>,
}

impl<T> TaskState<T> {
    fn new() -> Self {
        Self {
            active: false,
            epoch: 0,
            resetting: false,
            started: None,
            settling: None,
            idle: Vec::new(),
            consumers: Vec::new(),
            resources: Vec::new(),
            persistent: Vec::new(),
            uses: Vec::new(),
            hooks: Vec::new(),
            sources: HashMap::new(),
            dependencies: HashMap::new(),
            stale: HashMap::new(),
            dependents: HashSet::new(),
            next_dependent: 0,
            attachments: Vec::new(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active && self.epoch == epoch
    }
}

struct TaskInner<T: Clone + 'static> {
    id: TaskId,
    name: Cow<'static, str>,
    body: Body<T>,
    state: RefCell<TaskState<T>>,
    output: RefCell<StateQueue<Outcome<T>>>,
    activity: ActivityBag,
}

/// A dependency-tracked, potentially repeating unit of asynchronous work.
///
/// `Task` is a cheap handle, clones refer to the same node. All operations
/// that schedule work must be called from inside a tokio `LocalSet`.
///
/// ```rust
/// use reactask::{Task, scheduler};
///
/// let outputs = scheduler::run(async {
///     let base = Task::value(6u32);
///     let answer = Task::new({
///         let base = base.clone();
///         move |task: Task<u32>| {
///             let base = base.clone();
///             async move { Ok(7 * task.use_output(&base).await?) }
///         }
///     });
///
///     let output = answer.next_output();
///     let running = answer.start();
///     let value = output.await;
///     running.release();
///     value
/// })
/// .unwrap();
///
/// assert_eq!(outputs.unwrap(), 42);
/// ```
pub struct Task<T: Clone + 'static> {
    inner: Rc<TaskInner<T>>,
    /// The epoch of the run this handle was handed to, if any.
    run: Option<u64>,
}

impl<T: Clone + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            run: self.run,
        }
    }
}

impl<T: Clone + 'static> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Options for a new [`Task`].
#[derive(Default)]
pub struct TaskBuilder {
    name: Option<Cow<'static, str>>,
    attachments: Vec<EventAggregator<Lifecycle>>,
}

impl TaskBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches the task to a pipeline.
    pub fn pipeline(self, pipeline: &Pipeline) -> Self {
        self.attach(pipeline.events())
    }

    /// Attaches the task to a lifecycle aggregator.
    pub fn attach(mut self, events: &EventAggregator<Lifecycle>) -> Self {
        self.attachments.push(events.clone());
        self
    }

    /// Builds a task whose body resolves to its output.
    pub fn run<T, F, Fut>(self, body: F) -> Task<T>
    where
        T: Clone + 'static,
        F: Fn(Task<T>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        self.build(Body::Async(Rc::new(move |task: Task<T>| body(task).boxed_local())))
    }

    /// Builds a task whose body pushes outputs by itself.
    pub fn run_sync<T, F>(self, body: F) -> Task<T>
    where
        T: Clone + 'static,
        F: Fn(&Task<T>) -> anyhow::Result<()> + 'static,
    {
        self.build(Body::Sync(Rc::new(body)))
    }

    fn build<T: Clone + 'static>(self, body: Body<T>) -> Task<T> {
        let task = Task {
            inner: Rc::new(TaskInner {
                id: TaskId::next(),
                name: self.name.unwrap_or(Cow::Borrowed("task")),
                body,
                state: RefCell::new(TaskState::new()),
                output: RefCell::new(StateQueue::new()),
                activity: ActivityBag::new(),
            }),
            run: None,
        };

        for events in &self.attachments {
            task.attach(events);
        }

        task
    }
}

impl Task<()> {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }
}

impl<T: Clone + 'static> Task<T> {
    /// Creates a task from an async body. Every run pushes the body's result.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(Task<T>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        TaskBuilder::default().run(body)
    }

    /// Creates a task from a synchronous body that pushes its own outputs.
    pub fn from_fn<F>(body: F) -> Self
    where
        F: Fn(&Task<T>) -> anyhow::Result<()> + 'static,
    {
        TaskBuilder::default().run_sync(body)
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.inner.id,
            name: self.inner.name.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().active
    }

    fn downgrade(&self) -> Weak<TaskInner<T>> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<TaskInner<T>>) -> Option<Self> {
        inner.upgrade().map(|inner| Task { inner, run: None })
    }

    /// A handle for the run of `epoch`.
    fn scoped(&self, epoch: u64) -> Self {
        Self {
            inner: self.inner.clone(),
            run: Some(epoch),
        }
    }

    /// Whether new resources and dependencies belong to the current run.
    ///
    /// A handle held by the run of a past epoch never qualifies, and neither
    /// does any handle while a reset is underway.
    fn accepts(&self, state: &TaskState<T>) -> bool {
        match self.run {
            Some(epoch) => state.is_current(epoch) && !state.resetting,
            None => state.active && !state.resetting,
        }
    }

    /// Activates the task. Idempotent.
    ///
    /// The active marker is set right away. The run itself starts once the
    /// previous deactivation and all pending activity have settled. The
    /// returned transition resolves when the run has been started.
    pub fn activate(&self) -> Transition {
        let (epoch, settling) = {
            let mut state = self.inner.state.borrow_mut();
            if state.active {
                return state.started.clone().unwrap_or_else(settled);
            }

            state.active = true;
            state.epoch += 1;
            (state.epoch, state.settling.clone())
        };

        tracing::debug!(task = %self.info(), epoch, "activate");

        let task = self.clone();
        let started = scheduler::spawn(async move { task.run(epoch, settling).await })
            .map(drop)
            .boxed_local()
            .shared();

        self.inner.state.borrow_mut().started = Some(started.clone());
        started
    }

    async fn run(self, epoch: u64, settling: Option<Transition>) {
        if let Some(settling) = settling {
            settling.await;
        }
        self.inner.activity.empty().await;

        {
            let mut state = self.inner.state.borrow_mut();
            if !state.is_current(epoch) {
                return;
            }
            state.sources.clear();
            state.resetting = false;
        }

        tracing::debug!(task = %self.info(), epoch, "run");

        let scoped = self.scoped(epoch);
        match &self.inner.body {
            Body::Async(body) => {
                let started = std::panic::catch_unwind(AssertUnwindSafe(|| body(scoped.clone())));

                let output = match started {
                    Ok(future) => self.push_pending(async move {
                        match AssertUnwindSafe(future).catch_unwind().await {
                            Ok(result) => result.map_err(OutputError::from),
                            Err(panic) => Err(OutputError::Panicked(panic_message(panic))),
                        }
                    }),
                    Err(panic) => self.push_outcome(Err(OutputError::Panicked(panic_message(panic)))),
                };

                let task = self.clone();
                self.activity(async move {
                    let _ = output.await;
                    task.release_stale(epoch);
                });
            }
            Body::Sync(body) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| body(&scoped))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = self.push_outcome(Err(OutputError::from(err)));
                    }
                    Err(panic) => {
                        let _ = self.push_outcome(Err(OutputError::Panicked(panic_message(panic))));
                    }
                }

                self.release_stale(epoch);
            }
        }
    }

    /// Deactivates the task. Idempotent.
    ///
    /// The active marker is cleared right away, then every resource
    /// registered during the run is disposed and every dependency edge is
    /// released. Disposal failures are reported as [`Lifecycle::Error`]
    /// events and never fail the transition, which resolves once all pending
    /// activity has settled.
    pub fn deactivate(&self) -> Transition {
        self.shutdown(false)
    }

    fn shutdown(&self, reset: bool) -> Transition {
        let (resources, edges, idle, uses) = {
            let mut state = self.inner.state.borrow_mut();
            if !state.active {
                return state.settling.clone().unwrap_or_else(settled);
            }

            state.active = false;
            state.started = None;

            let mut resources = std::mem::take(&mut state.resources);
            let mut edges = Vec::new();
            let mut idle = Vec::new();
            let mut uses = Vec::new();

            if reset {
                let current = std::mem::take(&mut state.dependencies);
                state.stale.extend(current);
            } else {
                resources.append(&mut state.persistent);
                resources.extend(
                    std::mem::take(&mut state.hooks)
                        .into_iter()
                        .map(|hook| Box::new(hook) as Box<dyn AsyncDispose>),
                );
                let state = &mut *state;
                edges.extend(state.dependencies.drain().filter_map(|(_, edge)| edge));
                edges.extend(state.stale.drain().filter_map(|(_, edge)| edge));
                idle = std::mem::take(&mut state.idle);
                uses = std::mem::take(&mut state.uses);
            }

            (resources, edges, idle, uses)
        };

        for binding in uses {
            binding.unbind();
        }

        tracing::debug!(task = %self.info(), reset, resources = resources.len(), "deactivate");

        let disposals: Vec<_> = resources.iter().map(|resource| resource.dispose()).collect();
        let task = self.clone();
        self.activity(async move {
            for result in future::join_all(disposals).await {
                if let Err(error) = result {
                    task.report(error);
                }
            }

            for edge in edges {
                edge.release();
            }
        });

        let task = self.clone();
        let settle = scheduler::spawn(async move {
            task.inner.activity.empty().await;
            task.inner.state.borrow_mut().sources.clear();
            task.inner.output.borrow_mut().clear();
        })
        .map(drop)
        .boxed_local()
        .shared();

        self.inner.state.borrow_mut().settling = Some(settle.clone());

        for waiter in idle {
            let _ = waiter.send(settle.clone());
        }

        settle
    }

    /// Deactivates and reactivates the task, if it is active.
    ///
    /// Resolves with `false` when nothing happened, either because the task
    /// is inactive or because a reset is already underway.
    pub fn reset(&self) -> LocalBoxFuture<'static, bool> {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.active || state.resetting {
                return future::ready(false).boxed_local();
            }
            state.resetting = true;
        }

        tracing::debug!(task = %self.info(), "reset");

        let deactivated = self.shutdown(true);
        let activated = self.activate();

        async move {
            deactivated.await;
            activated.await;
            true
        }
        .boxed_local()
    }

    /// Resolves once the task has been fully deactivated and settled.
    pub fn inactive(&self) -> LocalBoxFuture<'static, ()> {
        let mut state = self.inner.state.borrow_mut();

        if !state.active {
            return match &state.settling {
                Some(settling) => settling.clone().boxed_local(),
                None => future::ready(()).boxed_local(),
            };
        }

        let (sender, receiver) = oneshot::channel();
        state.idle.push(sender);

        async move {
            if let Ok(settle) = receiver.await {
                settle.await;
            }
        }
        .boxed_local()
    }

    /// Registers a dependent and activates the task.
    ///
    /// The task stays active until every dependent handed out has been
    /// released.
    pub fn start(&self) -> Dependent {
        let token = {
            let mut state = self.inner.state.borrow_mut();
            state.next_dependent += 1;
            let token = state.next_dependent;
            state.dependents.insert(token);
            token
        };

        let _ = self.activate();
        Dependent::new(token, Rc::new(self.clone()))
    }

    /// Pushes a value as the next output.
    pub fn push(&self, value: T) {
        let _ = self.push_outcome(Ok(value));
    }

    /// Pushes a failure as the next output.
    pub fn fail(&self, error: impl Into<anyhow::Error>) {
        let _ = self.push_outcome(Err(OutputError::new(error)));
    }

    /// Pushes a pending output. It is driven eagerly and counts as activity
    /// until it settles.
    pub fn push_future<F>(&self, output: F)
    where
        F: Future<Output = anyhow::Result<T>> + 'static,
    {
        let _ = self.push_pending(output.map(|result| result.map_err(OutputError::from)));
    }

    fn push_outcome(&self, outcome: Outcome<T>) -> OutputFuture<T> {
        let output = self.inner.output.borrow_mut().append(future::ready(outcome));
        self.deliver(output)
    }

    fn push_pending<F>(&self, output: F) -> OutputFuture<T>
    where
        F: Future<Output = Outcome<T>> + 'static,
    {
        let settled = AssertUnwindSafe(output).catch_unwind().map(|result| {
            result.unwrap_or_else(|panic| Err(OutputError::Panicked(panic_message(panic))))
        });

        let output = self.inner.output.borrow_mut().append(settled);
        self.inner.activity.put(output.clone());
        self.deliver(output)
    }

    fn deliver(&self, output: OutputFuture<T>) -> OutputFuture<T> {
        let consumers = self.inner.state.borrow().consumers.clone();

        for slot in consumers {
            if slot.bound.get() {
                slot.fed.set(true);
                (slot.consumer)(output.clone());
            }
        }

        output
    }

    /// Attaches a consumer for the current and all future outputs.
    ///
    /// If the task already has an output it is delivered on a later tick, so
    /// unbinding right away means nothing is observed.
    pub fn pipe(&self, consumer: Consumer<T>) -> Binding {
        let slot = Rc::new(ConsumerSlot {
            consumer,
            bound: Cell::new(true),
            fed: Cell::new(false),
        });
        self.inner.state.borrow_mut().consumers.push(slot.clone());

        let latest = self.inner.output.borrow().latest();
        if let Some(latest) = latest {
            let slot = slot.clone();
            scheduler::defer(move || {
                if slot.bound.get() && !slot.fed.replace(true) {
                    (slot.consumer)(latest);
                }
            });
        }

        let task = self.downgrade();
        let slot = Rc::downgrade(&slot);
        Binding::new(move || {
            let Some(slot) = slot.upgrade() else {
                return;
            };

            slot.bound.set(false);
            if let Some(task) = task.upgrade() {
                task.state
                    .borrow_mut()
                    .consumers
                    .retain(|other| !Rc::ptr_eq(other, &slot));
            }
        })
    }

    /// The current output, or the next one if there is none yet.
    pub fn next_output(&self) -> LocalBoxFuture<'static, Outcome<T>> {
        let (sender, receiver) = oneshot::channel();
        let sender = RefCell::new(Some(sender));

        let binding = self.pipe(Rc::new(move |output: OutputFuture<T>| {
            if let Some(sender) = sender.borrow_mut().take() {
                let _ = sender.send(output);
            }
        }));

        let name = self.inner.name.clone();
        async move {
            let output = receiver.await;
            binding.unbind();

            match output {
                Ok(output) => output.await,
                Err(_) => Err(OutputError::Exhausted(name)),
            }
        }
        .boxed_local()
    }

    /// Depends on the first output `source` delivers in this epoch.
    ///
    /// The source is added as a dependency. Calls for the same source within
    /// one epoch share the returned future. Any later output of the source
    /// resets this task. If the source tears down before delivering anything
    /// the future fails with [`OutputError::Exhausted`].
    pub fn use_output<U, S>(&self, source: &S) -> OutputFuture<U>
    where
        U: Clone + 'static,
        S: TaskSource<U> + ?Sized,
    {
        let id = source.id();
        let epoch = {
            let state = self.inner.state.borrow();
            if !self.accepts(&state) {
                let name = source.info().name;
                return future::ready(Err(OutputError::Exhausted(name)))
                    .boxed_local()
                    .shared();
            }

            let cached = state
                .sources
                .get(&id)
                .and_then(|cached| cached.downcast_ref::<OutputFuture<U>>());

            if let Some(cached) = cached {
                return cached.clone();
            }
            state.epoch
        };

        self.add_dependency(source);

        let (sender, receiver) = oneshot::channel::<OutputFuture<U>>();
        let sender = Rc::new(RefCell::new(Some(sender)));
        let own = Rc::new(OnceCell::<Binding>::new());
        let hook = Disposable::from_fn({
            let sender = sender.clone();
            move || {
                sender.borrow_mut().take();
                Ok(())
            }
        });

        let binding = source.pipe(Rc::new({
            let sender = sender.clone();
            let own = own.clone();
            let hook = hook.clone();
            let task = self.downgrade();
            move |output: OutputFuture<U>| {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(output);
                    // Settled, the source no longer has to notify this use.
                    let _ = hook.dispose();
                    return;
                }

                if let Some(binding) = own.get() {
                    binding.unbind();
                }

                let Some(task) = Task::upgrade(&task) else {
                    return;
                };
                if task.inner.state.borrow().is_current(epoch) {
                    tracing::debug!(task = %task.info(), "dependency changed");
                    let _ = task.reset();
                }
            }
        }));
        let usage = Binding::new({
            let sender = sender.clone();
            let hook = hook.clone();
            move || {
                binding.unbind();
                sender.borrow_mut().take();
                let _ = hook.dispose();
            }
        });
        let _ = own.set(usage.clone());

        {
            let mut state = self.inner.state.borrow_mut();
            if state.active {
                state.uses.retain(Binding::is_bound);
                state.uses.push(usage);
            } else {
                drop(state);
                usage.unbind();
            }
        }

        source.on_teardown(hook);

        let name = source.info().name;
        let output = async move {
            match receiver.await {
                Ok(output) => output.await,
                Err(_) => Err(OutputError::Exhausted(name)),
            }
        }
        .boxed_local()
        .shared();

        self.inner
            .state
            .borrow_mut()
            .sources
            .insert(id, Box::new(output.clone()));

        output
    }

    /// Keeps `source` running for as long as this task is active.
    ///
    /// Does nothing while the task is inactive. Edges of the previous epoch
    /// are reclaimed instead of starting the source again.
    pub fn add_dependency<U, S>(&self, source: &S)
    where
        U: Clone + 'static,
        S: TaskSource<U> + ?Sized,
    {
        let id = source.id();

        {
            let mut state = self.inner.state.borrow_mut();
            if !self.accepts(&state) || state.dependencies.contains_key(&id) {
                return;
            }
            if let Some(edge) = state.stale.remove(&id) {
                state.dependencies.insert(id, edge);
                return;
            }
        }

        let edge = source.start();
        self.inner.state.borrow_mut().dependencies.insert(id, edge);
    }

    /// Releases an edge added by [`add_dependency`](Self::add_dependency).
    pub fn remove_dependency<U, S>(&self, source: &S)
    where
        U: Clone + 'static,
        S: TaskSource<U> + ?Sized,
    {
        let edge = {
            let mut state = self.inner.state.borrow_mut();
            if self.run.is_some_and(|epoch| !state.is_current(epoch)) {
                return;
            }
            state.dependencies.remove(&source.id())
        };

        if let Some(Some(edge)) = edge {
            edge.release();
        }
    }

    /// Disposes `resource` on the next deactivation, or right away if the
    /// task is not active, is being reset, or this handle belongs to a past
    /// run.
    pub fn using(&self, resource: impl AsyncDispose + 'static) {
        let resource: Box<dyn AsyncDispose> = Box::new(resource);

        let rejected = {
            let mut state = self.inner.state.borrow_mut();
            if self.accepts(&state) {
                state.resources.push(resource);
                None
            } else {
                Some(resource)
            }
        };

        if let Some(resource) = rejected {
            self.dispose_now(resource);
        }
    }

    /// Like [`using`](Self::using), but the resource survives resets and is
    /// only disposed when the task is fully deactivated.
    pub fn using_persistent(&self, resource: impl AsyncDispose + 'static) {
        let resource: Box<dyn AsyncDispose> = Box::new(resource);

        let rejected = {
            let mut state = self.inner.state.borrow_mut();
            if self.accepts(&state) {
                state.persistent.push(resource);
                None
            } else {
                Some(resource)
            }
        };

        if let Some(resource) = rejected {
            self.dispose_now(resource);
        }
    }

    fn dispose_now(&self, resource: Box<dyn AsyncDispose>) {
        let disposal = resource.dispose();
        let task = self.clone();

        self.activity(async move {
            if let Err(error) = disposal.await {
                task.report(error);
            }
        });
    }

    /// Registers pending work. Activation and deactivation wait for it.
    pub fn activity<F>(&self, work: F)
    where
        F: Future + 'static,
    {
        self.inner.activity.put(work);
    }

    /// Follows the activate and deactivate signals of `events`, and reports
    /// disposal failures to it.
    pub fn attach(&self, events: &EventAggregator<Lifecycle>) {
        if self.is_attached(events) {
            return;
        }

        let on_activate = events.subscribe(
            LifecycleChannel::Activate,
            Rc::new({
                let task = self.downgrade();
                move |event: &Lifecycle| {
                    if let (Lifecycle::Activate(signal), Some(task)) = (event, Task::upgrade(&task)) {
                        signal.wait_for(task.activate());
                    }
                }
            }),
        );

        let on_deactivate = events.subscribe(
            LifecycleChannel::Deactivate,
            Rc::new({
                let task = self.downgrade();
                move |event: &Lifecycle| {
                    if let (Lifecycle::Deactivate(signal), Some(task)) = (event, Task::upgrade(&task)) {
                        signal.wait_for(task.deactivate());
                    }
                }
            }),
        );

        self.inner.state.borrow_mut().attachments.push(Attachment {
            events: events.clone(),
            subscriptions: [on_activate, on_deactivate],
        });
    }

    pub fn detach(&self, events: &EventAggregator<Lifecycle>) {
        let removed: Vec<_> = {
            let mut state = self.inner.state.borrow_mut();
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.attachments)
                .into_iter()
                .partition(|attachment| attachment.events == *events);
            state.attachments = kept;
            removed
        };

        for attachment in removed {
            attachment.subscriptions.iter().for_each(Subscription::dispose);
        }
    }

    fn detach_all(&self) {
        let attachments = std::mem::take(&mut self.inner.state.borrow_mut().attachments);

        for attachment in attachments {
            attachment.subscriptions.iter().for_each(Subscription::dispose);
        }
    }

    pub fn is_attached(&self, events: &EventAggregator<Lifecycle>) -> bool {
        self.inner
            .state
            .borrow()
            .attachments
            .iter()
            .any(|attachment| attachment.events == *events)
    }

    fn report(&self, error: DisposeError) {
        let aggregators: Vec<_> = self
            .inner
            .state
            .borrow()
            .attachments
            .iter()
            .map(|attachment| attachment.events.clone())
            .collect();

        let failure = TaskFailure {
            task: self.info(),
            error,
        };
        lifecycle::report(failure, &aggregators);
    }

    fn release_stale(&self, epoch: u64) {
        let stale: Vec<_> = {
            let mut state = self.inner.state.borrow_mut();
            if !state.is_current(epoch) {
                return;
            }
            state.stale.drain().filter_map(|(_, edge)| edge).collect()
        };

        for edge in stale {
            edge.release();
        }
    }
}

impl<T: Clone + 'static> TaskSource<T> for Task<T> {
    fn id(&self) -> TaskId {
        self.inner.id
    }

    fn info(&self) -> TaskInfo {
        Task::info(self)
    }

    fn pipe(&self, consumer: Consumer<T>) -> Binding {
        Task::pipe(self, consumer)
    }

    fn start(&self) -> Option<Dependent> {
        Some(Task::start(self))
    }

    fn on_teardown(&self, hook: Disposable) {
        let rejected = {
            let mut state = self.inner.state.borrow_mut();
            if state.active {
                state.hooks.retain(|hook| hook.phase() != Phase::Disposed);
                state.hooks.push(hook);
                None
            } else {
                Some(hook)
            }
        };

        if let Some(hook) = rejected {
            self.dispose_now(Box::new(hook));
        }
    }
}

impl<T: Clone + 'static> AsyncDispose for Task<T> {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        let deactivated = self.deactivate();
        let task = self.clone();

        async move {
            deactivated.await;
            task.detach_all();
            Ok(())
        }
        .boxed_local()
    }
}

fn settled() -> Transition {
    future::ready(()).boxed_local().shared()
}

/// A type-erased view of a task, used to walk and release edges.
pub(crate) trait Node {
    fn info(&self) -> TaskInfo;

    fn release(&self, token: u64);

    /// The nodes this one currently depends on.
    fn upstream(&self) -> Vec<Rc<dyn Node>>;
}

impl<T: Clone + 'static> Node for Task<T> {
    fn info(&self) -> TaskInfo {
        Task::info(self)
    }

    fn release(&self, token: u64) {
        let idle = {
            let mut state = self.inner.state.borrow_mut();
            state.dependents.remove(&token) && state.dependents.is_empty()
        };

        if idle {
            let _ = self.deactivate();
        }
    }

    fn upstream(&self) -> Vec<Rc<dyn Node>> {
        self.inner
            .state
            .borrow()
            .dependencies
            .values()
            .flatten()
            .map(|edge| edge.node.clone())
            .collect()
    }
}

/// Keeps a task running until released.
///
/// Dropping the handle does not release it.
pub struct Dependent {
    token: u64,
    node: Rc<dyn Node>,
    released: Cell<bool>,
}

impl Dependent {
    fn new(token: u64, node: Rc<dyn Node>) -> Self {
        Self {
            token,
            node,
            released: Cell::new(false),
        }
    }

    /// The task kept running by this handle.
    pub fn task(&self) -> TaskInfo {
        self.node.info()
    }

    /// Releases the task. Idempotent.
    pub fn release(&self) {
        if !self.released.replace(true) {
            self.node.release(self.token);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.get()
    }
}

impl AsyncDispose for Dependent {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        self.release();
        future::ready(Ok(())).boxed_local()
    }
}

impl std::fmt::Debug for Dependent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependent")
            .field("task", &self.task())
            .field("released", &self.is_released())
            .finish()
    }
}
