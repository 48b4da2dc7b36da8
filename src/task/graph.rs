use std::collections::HashMap;
use std::fmt::{self, Display};
use std::rc::Rc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::lifecycle::TaskInfo;
use crate::task::{Node, Task, TaskId};

/// A snapshot of the live dependency edges reachable from a task.
///
/// Edges point from a dependency to its dependent. The snapshot renders as
/// a Mermaid flowchart through its `Display` implementation.
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskInfo, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Walks the dependencies of `root`, transitively.
    pub fn capture<T: Clone + 'static>(root: &Task<T>) -> Self {
        let mut graph = TaskGraph::default();
        let mut queue: Vec<Rc<dyn Node>> = vec![Rc::new(root.clone())];

        graph.insert(root.info());

        while let Some(node) = queue.pop() {
            let dependent = graph.insert(node.info());

            for upstream in node.upstream() {
                let info = upstream.info();
                let seen = graph.index.contains_key(&info.id);
                let dependency = graph.insert(info);

                graph.graph.update_edge(dependency, dependent, ());
                if !seen {
                    queue.push(upstream);
                }
            }
        }

        graph
    }

    fn insert(&mut self, info: TaskInfo) -> NodeIndex {
        if let Some(index) = self.index.get(&info.id) {
            return *index;
        }

        let id = info.id;
        let index = self.graph.add_node(info);
        self.index.insert(id, index);
        index
    }

    /// Number of tasks in the snapshot.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// The direct dependencies of a task.
    pub fn dependencies_of(&self, id: TaskId) -> Vec<&TaskInfo> {
        let Some(index) = self.index.get(&id) else {
            return Vec::new();
        };

        self.graph
            .neighbors_directed(*index, petgraph::Direction::Incoming)
            .map(|dependency| &self.graph[dependency])
            .collect()
    }

    pub fn is_acyclic(&self) -> bool {
        toposort(&self.graph, None).is_ok()
    }

    pub fn graph(&self) -> &DiGraph<TaskInfo, ()> {
        &self.graph
    }
}

impl Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let info = &self.graph[index];
            let name = info.name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;
    use crate::testing::local;

    fn sum(name: &'static str, sources: Vec<Task<u32>>) -> Task<u32> {
        TaskBuilder::default().name(name).run(move |task: Task<u32>| {
            let sources = sources.clone();
            async move {
                let mut total = 0;
                for source in &sources {
                    total += task.use_output(source).await?;
                }
                Ok(total)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_diamond() {
        local(async {
            let base = TaskBuilder::default()
                .name("base")
                .run_sync(|task: &Task<u32>| {
                    task.push(1);
                    Ok(())
                });
            let left = sum("left", vec![base.clone()]);
            let right = sum("right", vec![base.clone()]);
            let top = sum("top", vec![left.clone(), right.clone()]);

            let output = top.next_output();
            let running = top.start();
            assert_eq!(output.await.unwrap(), 2);

            let graph = TaskGraph::capture(&top);
            assert_eq!(graph.len(), 4);
            assert!(graph.is_acyclic());
            assert!(graph.contains(base.id()));

            let mut names: Vec<_> = graph
                .dependencies_of(top.id())
                .into_iter()
                .map(|info| info.name.to_string())
                .collect();
            names.sort();
            assert_eq!(names, vec!["left", "right"]);
            assert_eq!(graph.dependencies_of(base.id()).len(), 0);

            let rendered = graph.to_string();
            assert!(rendered.starts_with("graph LR\n"));
            assert!(rendered.contains("[\"base\"]"));
            assert_eq!(rendered.matches("-->").count(), 4);

            running.release();
        })
        .await;
    }

    #[test]
    fn test_capture_idle_task() {
        let task = Task::value(1);
        let graph = TaskGraph::capture(&task);

        assert_eq!(graph.len(), 1);
        assert!(graph.dependencies_of(task.id()).is_empty());
        assert_eq!(graph.to_string().lines().count(), 2);
    }
}
