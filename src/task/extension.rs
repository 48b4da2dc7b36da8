use std::rc::Rc;

use futures::future::FutureExt;

use crate::disposable::Disposable;
use crate::lifecycle::TaskInfo;
use crate::task::{Binding, Consumer, Dependent, OutputFuture, Task, TaskBuilder, TaskId, TaskSource};

impl<T: Clone + 'static> Task<T> {
    /// A task that pushes `value` on every run.
    pub fn value(value: T) -> Self {
        TaskBuilder::default().name("value").run_sync(move |task: &Task<T>| {
            task.push(value.clone());
            Ok(())
        })
    }

    /// A source sharing this task's lifecycle whose outputs are the task's
    /// outputs passed through `map`. Failures pass through unchanged.
    pub fn map<U, F>(&self, map: F) -> Mapped<T, U>
    where
        U: Clone + 'static,
        F: Fn(T) -> U + 'static,
    {
        Mapped {
            task: self.clone(),
            id: TaskId::next(),
            map: Rc::new(map),
        }
    }
}

/// See [`Task::map`].
pub struct Mapped<T: Clone + 'static, U> {
    task: Task<T>,
    id: TaskId,
    map: Rc<dyn Fn(T) -> U>,
}

impl<T: Clone + 'static, U> Clone for Mapped<T, U> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            id: self.id,
            map: self.map.clone(),
        }
    }
}

impl<T: Clone + 'static, U: Clone + 'static> Mapped<T, U> {
    pub fn task(&self) -> &Task<T> {
        &self.task
    }
}

impl<T: Clone + 'static, U: Clone + 'static> TaskSource<U> for Mapped<T, U> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: format!("{}.map", self.task.name()).into(),
        }
    }

    fn pipe(&self, consumer: Consumer<U>) -> Binding {
        let map = self.map.clone();

        self.task.pipe(Rc::new(move |output: OutputFuture<T>| {
            let map = map.clone();
            let mapped = output.map(move |outcome| outcome.map(|value| map(value)));
            consumer(mapped.boxed_local().shared());
        }))
    }

    fn start(&self) -> Option<Dependent> {
        Some(self.task.start())
    }

    fn on_teardown(&self, hook: Disposable) {
        self.task.on_teardown(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Capture, local, ticks};

    #[tokio::test(start_paused = true)]
    async fn test_value_pushes_on_every_run() {
        local(async {
            let task = Task::value("foo");
            let capture = Capture::pipe(&task);

            let running = task.start();
            ticks(1).await;
            task.reset().await;
            ticks(1).await;

            assert_eq!(capture.values().await, vec!["foo", "foo"]);
            running.release();
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_outputs() {
        local(async {
            let task = Task::from_fn(|task: &Task<u32>| {
                task.push(1);
                task.fail(anyhow::anyhow!("nope"));
                task.push(3);
                Ok(())
            });
            let doubled = task.map(|n| n * 2);
            assert_ne!(doubled.id(), task.id());
            assert_eq!(doubled.info().name, "task.map");

            let capture = Capture::pipe(&doubled);
            let running = doubled.start().unwrap();
            ticks(1).await;

            let outputs = capture.settled().await;
            assert_eq!(outputs.len(), 3);
            assert_eq!(*outputs[0].as_ref().unwrap(), 2);
            assert_eq!(outputs[1].as_ref().unwrap_err().to_string(), "nope");
            assert_eq!(*outputs[2].as_ref().unwrap(), 6);

            running.release();
            assert!(!doubled.task().is_active());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_mapped_source() {
        local(async {
            let base = Task::value(20u32);
            let plus = base.map(|n| n + 1);
            let answer = Task::new(move |task: Task<u32>| {
                let plus = plus.clone();
                async move { Ok(2 * task.use_output(&plus).await?) }
            });

            let output = answer.next_output();
            let running = answer.start();
            assert_eq!(output.await.unwrap(), 42);
            assert!(base.is_active());

            running.release();
            answer.inactive().await;
            ticks(1).await;
            assert!(!base.is_active());
        })
        .await;
    }
}
