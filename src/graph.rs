//! The task graph.
//!
//! Every named step of the pipeline (`images`, `styles`, `scripts`, ...) is a
//! [`Task`] stored as a node of a directed acyclic graph, with an edge from
//! each dependency to its dependant. The graph is assembled once with a
//! [`TaskGraphBuilder`] and is never mutated afterwards; construction rejects
//! duplicate names, dangling dependencies and cycles.
//!
//! Running a task first runs all of its transitive dependencies on the
//! `rayon` pool, as soon as their own dependencies are met, and then runs the
//! task itself on the calling thread. The target may therefore block for as
//! long as it wants (the `default` task never returns) without holding one of
//! the pool's workers hostage.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, TryRecvError, channel};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};
use rayon::Yield;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{GraphError, TaskError};

/// Body of a task. Receives the context it runs in.
pub type Action = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Everything a task can see while it runs.
pub struct TaskContext<'a> {
    /// Name of the running task.
    pub name: &'a str,
    /// The graph the task belongs to, so that long running tasks can trigger
    /// other tasks.
    pub graph: &'a TaskGraph,
}

pub struct Task {
    name: Cow<'static, str>,
    action: Action,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Declaration {
    name: Cow<'static, str>,
    depends_on: Vec<Cow<'static, str>>,
    action: Action,
}

/// Collects task declarations. Dependencies are referenced by name and may be
/// declared in any order.
#[derive(Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Declaration>,
}

impl TaskGraphBuilder {
    pub fn task<F>(
        mut self,
        name: impl Into<Cow<'static, str>>,
        depends_on: impl IntoIterator<Item = &'static str>,
        action: F,
    ) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.tasks.push(Declaration {
            name: name.into(),
            depends_on: depends_on.into_iter().map(Cow::Borrowed).collect(),
            action: Arc::new(action),
        });
        self
    }

    pub fn build(self) -> Result<TaskGraph, GraphError> {
        let mut graph = Graph::new();
        let mut names = HashMap::new();
        let mut edges = Vec::new();

        for Declaration {
            name,
            depends_on,
            action,
        } in self.tasks
        {
            if names.contains_key(&name) {
                return Err(GraphError::Duplicate(name.into_owned()));
            }

            let index = graph.add_node(Task {
                name: name.clone(),
                action,
            });

            names.insert(name, index);
            edges.push((index, depends_on));
        }

        for (index, depends_on) in edges {
            for dependency in depends_on {
                let source = *names.get(&dependency).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        task: graph[index].name.to_string(),
                        dependency: dependency.to_string(),
                    }
                })?;

                graph.add_edge(source, index, ());
            }
        }

        petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].name.to_string()))?;

        Ok(TaskGraph { graph, names })
    }
}

/// A static DAG of named tasks.
pub struct TaskGraph {
    graph: Graph<Task, ()>,
    names: HashMap<Cow<'static, str>, NodeIndex>,
}

impl TaskGraph {
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::default()
    }

    /// Task names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(Task::name)
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        let index = self.index(name)?;
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|i| self.graph[i].name())
            .collect();
        deps.sort();
        Ok(deps)
    }

    fn index(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::NotFound(name.to_string()))
    }

    /// Runs `name` after all of its transitive dependencies have completed.
    /// The first failing dependency aborts the run.
    pub fn run(&self, name: &str) -> Result<(), TaskError> {
        let target = self.index(name)?;

        let mut pending = HashSet::new();
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, target);
        while let Some(index) = dfs.next(reversed) {
            if index != target {
                pending.insert(index);
            }
        }

        self.run_parallel(&pending)?;

        let s = Instant::now();
        self.execute(target)
            .map_err(|e| TaskError::Task(name.to_string(), e))?;
        tracing::info!("Finished '{name}' {}", crate::utils::as_overhead(s));

        Ok(())
    }

    /// Executes the given set of tasks on the rayon pool, releasing every task
    /// once all of its dependencies within the set have completed.
    fn run_parallel(&self, nodes: &HashSet<NodeIndex>) -> Result<(), TaskError> {
        if nodes.is_empty() {
            return Ok(());
        }

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut counts: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&i| {
                (
                    i,
                    self.graph
                        .neighbors_directed(i, Direction::Incoming)
                        .filter(|dep| nodes.contains(dep))
                        .count(),
                )
            })
            .collect();

        let total = nodes.len();
        let style = crate::utils::task_style();

        // The scheduler loop stays on the calling thread, only the tasks go to
        // the pool.
        rayon::in_place_scope(|s| -> Result<(), TaskError> {
            let (tx, rx) = channel::<Completion>();

            let spawn = |index: NodeIndex| {
                let tx = tx.clone();
                let style = style.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", name = self.graph[index].name());
                    span.pb_set_style(&style);
                    span.pb_set_message(&format!("Running {}", self.graph[index].name()));
                    let _enter = span.enter();

                    let start = Instant::now();
                    let result = self.execute(index);
                    // The receiver only goes away once the scope is unwinding.
                    let _ = tx.send((index, result, start));
                });
            };

            for &index in nodes {
                if counts.get(&index).copied().unwrap_or(0) == 0 {
                    spawn(index);
                }
            }

            let mut completed = 0;
            while completed < total {
                let (index, result, start) = next_completion(&rx)?;
                let name = self.graph[index].name();

                result.map_err(|e| TaskError::Task(name.to_string(), e))?;
                tracing::info!("Finished '{name}' {}", crate::utils::as_overhead(start));
                completed += 1;

                for &next in dependents.get(&index).into_iter().flatten() {
                    if let Some(count) = counts.get_mut(&next) {
                        *count -= 1;
                        if *count == 0 {
                            spawn(next);
                        }
                    }
                }
            }

            Ok(())
        })
    }

    fn execute(&self, index: NodeIndex) -> anyhow::Result<()> {
        let task = &self.graph[index];
        let context = TaskContext {
            name: task.name(),
            graph: self,
        };

        // A panicking task must not take the scheduler down with it.
        match catch_unwind(AssertUnwindSafe(|| (task.action)(&context))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        }
    }
}

type Completion = (NodeIndex, anyhow::Result<()>, Instant);

/// How long a pool worker waiting on other workers sleeps between looking for
/// queued tasks it could run itself.
const POLL: Duration = Duration::from_millis(5);

/// Waits for the next finished task. A scheduler running on a pool worker
/// executes queued tasks while it waits, so that a pool with a single thread
/// still makes progress.
fn next_completion(rx: &Receiver<Completion>) -> Result<Completion, TaskError> {
    loop {
        match rx.try_recv() {
            Ok(done) => return Ok(done),
            Err(TryRecvError::Disconnected) => return Err(RecvError.into()),
            Err(TryRecvError::Empty) => {}
        }

        match rayon::yield_now() {
            Some(Yield::Executed) => {}
            Some(Yield::Idle) => {
                if let Ok(done) = rx.recv_timeout(POLL) {
                    return Ok(done);
                }
            }
            None => return Ok(rx.recv()?),
        }
    }
}

/// Renders the graph as a Mermaid diagram.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(log: &Arc<Mutex<Vec<String>>>) -> impl Fn(&TaskContext<'_>) -> anyhow::Result<()> + use<> {
        let log = log.clone();
        move |ctx| {
            log.lock().unwrap().push(ctx.name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_dependencies_run_before_target() {
        let log = recorder();
        let graph = TaskGraph::builder()
            .task("images", [], record(&log))
            .task("browser-sync", [], record(&log))
            .task("styles", [], record(&log))
            .task("default", ["images", "browser-sync"], record(&log))
            .build()
            .unwrap();

        graph.run("default").unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap(), "default");
        assert!(log.contains(&"images".to_string()));
        assert!(log.contains(&"browser-sync".to_string()));
        // not a dependency
        assert!(!log.contains(&"styles".to_string()));
    }

    #[test]
    fn test_transitive_order() {
        let log = recorder();
        let graph = TaskGraph::builder()
            .task("c", ["b"], record(&log))
            .task("a", [], record(&log))
            .task("b", ["a"], record(&log))
            .build()
            .unwrap();

        graph.run("c").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_runs_shared_dependency_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let graph = TaskGraph::builder()
            .task("root", [], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .task("left", ["root"], |_| Ok(()))
            .task("right", ["root"], |_| Ok(()))
            .task("top", ["left", "right"], |_| Ok(()))
            .build()
            .unwrap();

        graph.run("top").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_dependency_stops_target() {
        let log = recorder();
        let graph = TaskGraph::builder()
            .task("images", [], |_| anyhow::bail!("corrupt file"))
            .task("default", ["images"], record(&log))
            .build()
            .unwrap();

        let err = graph.run("default").unwrap_err();
        assert!(matches!(err, TaskError::Task(ref name, _) if name == "images"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_single_thread_pool() {
        let log = recorder();
        let graph = TaskGraph::builder()
            .task("a", [], record(&log))
            .task("b", [], record(&log))
            .task("c", ["a", "b"], record(&log))
            .task("d", ["c"], record(&log))
            .build()
            .unwrap();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        pool.install(|| graph.run("d")).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(&log[2..], ["c", "d"]);
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let graph = TaskGraph::builder()
            .task("boom", [], |_| panic!("kaboom"))
            .build()
            .unwrap();

        let err = graph.run("boom").unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_build_rejects_unknown_dependency() {
        let err = TaskGraph::builder()
            .task("default", ["images"], |_| Ok(()))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let err = TaskGraph::builder()
            .task("styles", [], |_| Ok(()))
            .task("styles", [], |_| Ok(()))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, GraphError::Duplicate(name) if name == "styles"));
    }

    #[test]
    fn test_build_rejects_cycles() {
        let err = TaskGraph::builder()
            .task("a", ["b"], |_| Ok(()))
            .task("b", ["a"], |_| Ok(()))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_unknown_task() {
        let graph = TaskGraph::builder().build().unwrap();
        assert!(matches!(
            graph.run("nope"),
            Err(TaskError::Graph(GraphError::NotFound(_)))
        ));
    }

    #[test]
    fn test_task_can_run_other_tasks() {
        let log = recorder();
        let graph = TaskGraph::builder()
            .task("styles", [], record(&log))
            .task("watch", [], |ctx| {
                ctx.graph.run("styles")?;
                ctx.graph.run("styles")?;
                Ok(())
            })
            .build()
            .unwrap();

        graph.run("watch").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["styles", "styles"]);
    }

    #[test]
    fn test_mermaid_and_dependencies() {
        let graph = TaskGraph::builder()
            .task("images", [], |_| Ok(()))
            .task("browser-sync", [], |_| Ok(()))
            .task("default", ["images", "browser-sync"], |_| Ok(()))
            .build()
            .unwrap();

        assert_eq!(
            graph.dependencies("default").unwrap(),
            vec!["browser-sync", "images"]
        );
        assert_eq!(
            graph.names().collect::<Vec<_>>(),
            vec!["images", "browser-sync", "default"]
        );

        let diagram = graph.to_string();
        assert!(diagram.starts_with("graph LR"));
        assert!(diagram.contains("2[\"default\"]"));
        assert!(diagram.contains("0 --> 2"));
    }
}
