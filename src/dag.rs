//! Dependency graph analysis for task plans
//!
//! Everything in this module is a pure function over a task list. The
//! scheduler polls [`ready_tasks`] on every turn of its loop.
//! [`compute_batches`] levels tasks by dependency depth to preview the expected
//! parallelism; it assumes a task is complete as soon as it is placed, so it can
//! diverge from what actually happens at runtime and is never used to drive
//! execution.

use crate::error::{AgentFlowError, Result};
use crate::models::{Task, TaskStatus};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency graph over a task list.
///
/// Edges run from a dependency to its dependent. Dependencies naming ids that
/// are not in the list get no edge; they are kept aside in
/// [`unknown_dependencies`](Self::unknown_dependencies).
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    task_indices: HashMap<String, NodeIndex>,
    unknown: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Build the graph from a task list
    pub fn build(tasks: &[Task]) -> Self {
        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::new();

        for task in tasks {
            if task_indices.contains_key(&task.id) {
                continue;
            }
            let index = graph.add_node(task.id.clone());
            task_indices.insert(task.id.clone(), index);
        }

        let mut unknown = Vec::new();
        for task in tasks {
            let task_index = task_indices[&task.id];
            for dep in &task.depends_on {
                match task_indices.get(dep) {
                    Some(&dep_index) => {
                        graph.update_edge(dep_index, task_index, ());
                    }
                    None => unknown.push((task.id.clone(), dep.clone())),
                }
            }
        }

        Self {
            graph,
            task_indices,
            unknown,
        }
    }

    /// `(task, dependency)` pairs where the dependency is not in the plan
    pub fn unknown_dependencies(&self) -> &[(String, String)] {
        &self.unknown
    }

    /// Ids of tasks participating in at least one cycle, in discovery order.
    ///
    /// Depth-first search from every unvisited task, driven by an explicit
    /// stack so that long dependency chains cannot exhaust the thread stack.
    /// Reaching a task that is still on the stack closes a cycle; that task and
    /// every task on the path back to it are reported.
    pub fn cycle_ids(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut found: Vec<NodeIndex> = Vec::new();
        let mut reported = HashSet::new();

        for root in self.graph.node_indices() {
            if !visited.insert(root) {
                continue;
            }
            on_stack.insert(root);
            path.push(root);
            // Walk towards dependencies, the same direction as `depends_on`
            let mut stack = vec![(root, self.graph.neighbors_directed(root, Direction::Incoming))];

            while let Some((node, neighbors)) = stack.last_mut() {
                match neighbors.next() {
                    Some(next) if on_stack.contains(&next) => {
                        if let Some(start) = path.iter().position(|&n| n == next) {
                            for &member in &path[start..] {
                                if reported.insert(member) {
                                    found.push(member);
                                }
                            }
                        }
                    }
                    Some(next) => {
                        if visited.insert(next) {
                            on_stack.insert(next);
                            path.push(next);
                            stack.push((
                                next,
                                self.graph.neighbors_directed(next, Direction::Incoming),
                            ));
                        }
                    }
                    None => {
                        let done = *node;
                        stack.pop();
                        path.pop();
                        on_stack.remove(&done);
                    }
                }
            }
        }

        found
            .into_iter()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Get topologically sorted task ids
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None)
            .map_err(|_| AgentFlowError::CycleDetected(self.cycle_ids()))?;

        Ok(sorted.iter().map(|&idx| self.graph[idx].clone()).collect())
    }

    /// Direct dependencies of a task (known ids only)
    pub fn dependencies(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task
    pub fn dependents(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// Every task the given task transitively depends on
    pub fn ancestors(&self, task_id: &str) -> Vec<String> {
        let Some(&start) = self.task_indices.get(task_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut ancestors = Vec::new();

        while let Some(node) = queue.pop_front() {
            for dep in self.graph.neighbors_directed(node, Direction::Incoming) {
                if dep != start && seen.insert(dep) {
                    ancestors.push(self.graph[dep].clone());
                    queue.push_back(dep);
                }
            }
        }

        ancestors
    }

    fn neighbors(&self, task_id: &str, direction: Direction) -> Vec<String> {
        match self.task_indices.get(task_id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|idx| self.graph[idx].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Ids of tasks that take part in a dependency cycle (empty when acyclic)
pub fn detect_cycles(tasks: &[Task]) -> Vec<String> {
    DependencyGraph::build(tasks).cycle_ids()
}

/// Pending tasks whose dependencies are all `done`.
///
/// A dependency on an id that is not in the list is never satisfied.
pub fn ready_tasks(tasks: &[Task]) -> Vec<&Task> {
    let statuses: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();

    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on
                .iter()
                .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Done))
        })
        .collect()
}

/// Group task ids into batches by dependency depth.
///
/// Batch `k` holds exactly the tasks whose dependencies all sit in batches
/// `0..k`. Task status is ignored.
pub fn compute_batches(tasks: &[Task]) -> Result<Vec<Vec<String>>> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut completed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let (batch, rest): (Vec<&Task>, Vec<&Task>) = remaining.into_iter().partition(|t| {
            t.depends_on
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
        });

        if batch.is_empty() {
            let missing = rest.iter().find_map(|t| {
                t.depends_on
                    .iter()
                    .find(|dep| !known.contains(dep.as_str()))
                    .map(|dep| (t.id.clone(), dep.clone()))
            });
            if let Some((task, dependency)) = missing {
                return Err(AgentFlowError::MissingDependency { task, dependency });
            }

            let mut cycle = detect_cycles(tasks);
            if cycle.is_empty() {
                cycle = rest.iter().map(|t| t.id.clone()).collect();
            }
            return Err(AgentFlowError::CycleDetected(cycle));
        }

        completed.extend(batch.iter().map(|&t| t.id.as_str()));
        batches.push(batch.iter().map(|t| t.id.clone()).collect());
        remaining = rest;
    }

    Ok(batches)
}

/// Why a pending task cannot be dispatched right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    /// A transitive dependency ended `failed` or `interrupted`
    FailedDependency { failed: Vec<String> },
    /// A dependency (direct or transitive) names a task that does not exist
    MissingDependency { missing: Vec<String> },
    /// The task is in, or downstream of, a dependency cycle
    Cycle,
    /// Dependencies are still pending or in flight
    Waiting,
}

/// A pending task that is not ready, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedTask {
    pub id: String,
    #[serde(flatten)]
    pub reason: BlockReason,
}

/// Classify every pending task that is not ready.
///
/// At quiescence of an acyclic plan every entry carries `FailedDependency` or
/// `MissingDependency`; `Waiting` only shows up mid-run.
pub fn blocked_tasks(tasks: &[Task]) -> Vec<BlockedTask> {
    let graph = DependencyGraph::build(tasks);
    let statuses: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let ready: HashSet<&str> = ready_tasks(tasks).iter().map(|t| t.id.as_str()).collect();
    let cyclic: HashSet<String> = graph.cycle_ids().into_iter().collect();

    let mut unknown_by_task: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, dep) in graph.unknown_dependencies() {
        unknown_by_task
            .entry(task.as_str())
            .or_default()
            .push(dep.as_str());
    }

    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && !ready.contains(t.id.as_str()))
        .map(|task| {
            let ancestors = graph.ancestors(&task.id);

            let failed: Vec<String> = ancestors
                .iter()
                .filter(|id| {
                    matches!(
                        statuses.get(id.as_str()),
                        Some(TaskStatus::Failed | TaskStatus::Interrupted)
                    )
                })
                .cloned()
                .collect();

            let mut missing: Vec<String> = std::iter::once(task.id.as_str())
                .chain(ancestors.iter().map(String::as_str))
                .flat_map(|id| unknown_by_task.get(id).into_iter().flatten())
                .map(|dep| dep.to_string())
                .collect();
            missing.sort();
            missing.dedup();

            let reason = if !failed.is_empty() {
                BlockReason::FailedDependency { failed }
            } else if !missing.is_empty() {
                BlockReason::MissingDependency { missing }
            } else if cyclic.contains(&task.id) || ancestors.iter().any(|a| cyclic.contains(a)) {
                BlockReason::Cycle
            } else {
                BlockReason::Waiting
            };

            BlockedTask {
                id: task.id.clone(),
                reason,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id.to_uppercase(), deps)
    }

    fn diamond() -> Vec<Task> {
        vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]
    }

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_acyclic_has_no_cycles() {
        assert!(detect_cycles(&diamond()).is_empty());
    }

    #[test]
    fn test_two_task_cycle() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let mut cycle = detect_cycles(&tasks);
        cycle.sort();
        assert_eq!(cycle, vec!["a", "b"]);
    }

    #[test]
    fn test_self_cycle() {
        let tasks = vec![task("a", &["a"]), task("b", &[])];
        assert_eq!(detect_cycles(&tasks), vec!["a"]);
    }

    #[test]
    fn test_cycle_excludes_downstream_and_upstream() {
        // root -> x <-> y -> tail
        let tasks = vec![
            task("root", &[]),
            task("x", &["root", "y"]),
            task("y", &["x"]),
            task("tail", &["y"]),
        ];
        let mut cycle = detect_cycles(&tasks);
        cycle.sort();
        assert_eq!(cycle, vec!["x", "y"]);
    }

    #[test]
    fn test_cycle_detection_on_long_chain() {
        // Listed leaf first, so the search descends the whole chain from one root
        let n = 100_000;
        let mut tasks: Vec<Task> = (0..n)
            .rev()
            .map(|i| {
                let dep = format!("t{}", i.max(1) - 1);
                let deps: Vec<&str> = if i == 0 { vec![] } else { vec![dep.as_str()] };
                task(&format!("t{}", i), &deps)
            })
            .collect();
        assert!(detect_cycles(&tasks).is_empty());

        // Closing the chain puts every task on one cycle
        let first = tasks.last_mut().unwrap();
        first.depends_on = vec![format!("t{}", n - 1)];
        assert_eq!(detect_cycles(&tasks).len(), n);
    }

    #[test]
    fn test_unknown_dependency_is_not_a_cycle() {
        let tasks = vec![task("a", &["ghost"]), task("b", &["a"])];
        assert!(detect_cycles(&tasks).is_empty());

        let graph = DependencyGraph::build(&tasks);
        assert_eq!(
            graph.unknown_dependencies(),
            &[("a".to_string(), "ghost".to_string())]
        );
    }

    #[test]
    fn test_ready_tasks_initial() {
        let tasks = diamond();
        assert_eq!(ids(&ready_tasks(&tasks)), vec!["a"]);
    }

    #[test]
    fn test_ready_tasks_after_progress() {
        let mut tasks = diamond();
        tasks[0].status = TaskStatus::Done;
        tasks[1].status = TaskStatus::InProgress;

        // b is in flight, so only c is ready; d still waits on b
        assert_eq!(ids(&ready_tasks(&tasks)), vec!["c"]);

        tasks[1].status = TaskStatus::Done;
        tasks[2].status = TaskStatus::Done;
        assert_eq!(ids(&ready_tasks(&tasks)), vec!["d"]);
    }

    #[test]
    fn test_ready_tasks_never_returns_non_pending() {
        let tasks = vec![
            task("a", &[]).with_status(TaskStatus::Failed),
            task("b", &[]).with_status(TaskStatus::Interrupted),
            task("c", &[]).with_status(TaskStatus::Done),
            task("d", &[]).with_status(TaskStatus::InProgress),
        ];
        assert!(ready_tasks(&tasks).is_empty());
    }

    #[test]
    fn test_ready_tasks_failed_dependency() {
        let mut tasks = diamond();
        tasks[0].status = TaskStatus::Failed;
        assert!(ready_tasks(&tasks).is_empty());
    }

    #[test]
    fn test_ready_tasks_unknown_dependency_never_ready() {
        let tasks = vec![task("a", &["ghost"])];
        assert!(ready_tasks(&tasks).is_empty());
    }

    #[test]
    fn test_batches_diamond() {
        let batches = compute_batches(&diamond()).unwrap();
        assert_eq!(batches, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_batches_ignore_status() {
        let mut tasks = diamond();
        tasks[0].status = TaskStatus::Failed;
        let batches = compute_batches(&tasks).unwrap();
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn test_batches_partition_and_order() {
        let tasks = vec![
            task("lint", &[]),
            task("schema", &[]),
            task("api", &["schema"]),
            task("ui", &["api", "lint"]),
            task("docs", &["schema"]),
            task("release", &["ui", "docs"]),
        ];
        let batches = compute_batches(&tasks).unwrap();

        let mut position = HashMap::new();
        for (level, batch) in batches.iter().enumerate() {
            for id in batch {
                assert!(position.insert(id.clone(), level).is_none(), "{id} placed twice");
            }
        }
        assert_eq!(position.len(), tasks.len());

        for t in &tasks {
            for dep in &t.depends_on {
                assert!(position[dep] < position[&t.id]);
            }
        }
    }

    #[test]
    fn test_batches_report_cycle() {
        let tasks = vec![task("a", &[]), task("b", &["c"]), task("c", &["b"])];
        match compute_batches(&tasks) {
            Err(AgentFlowError::CycleDetected(mut cycle)) => {
                cycle.sort();
                assert_eq!(cycle, vec!["b", "c"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_batches_report_missing_dependency() {
        let tasks = vec![task("a", &[]), task("b", &["ghost"])];
        assert!(matches!(
            compute_batches(&tasks),
            Err(AgentFlowError::MissingDependency { ref task, ref dependency })
                if task == "b" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_topological_order() {
        let graph = DependencyGraph::build(&diamond());
        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_topological_order_cycle() {
        let graph = DependencyGraph::build(&[task("a", &["b"]), task("b", &["a"])]);
        assert!(matches!(
            graph.topological_order(),
            Err(AgentFlowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let graph = DependencyGraph::build(&diamond());

        let mut deps = graph.dependencies("d");
        deps.sort();
        assert_eq!(deps, vec!["b", "c"]);

        let mut dependents = graph.dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);

        let mut ancestors = graph.ancestors("d");
        ancestors.sort();
        assert_eq!(ancestors, vec!["a", "b", "c"]);

        assert!(graph.dependencies("missing").is_empty());
    }

    #[test]
    fn test_blocked_by_failed_dependency() {
        let mut tasks = diamond();
        tasks[0].status = TaskStatus::Done;
        tasks[1].status = TaskStatus::Failed;
        tasks[2].status = TaskStatus::Done;

        let blocked = blocked_tasks(&tasks);
        assert_eq!(
            blocked,
            vec![BlockedTask {
                id: "d".to_string(),
                reason: BlockReason::FailedDependency {
                    failed: vec!["b".to_string()]
                },
            }]
        );
    }

    #[test]
    fn test_blocked_reasons() {
        let tasks = vec![
            task("orphan", &["ghost"]),
            task("after_orphan", &["orphan"]),
            task("x", &["y"]),
            task("y", &["x"]),
            task("root", &[]),
            task("leaf", &["root"]),
        ];
        let blocked: HashMap<String, BlockReason> = blocked_tasks(&tasks)
            .into_iter()
            .map(|b| (b.id, b.reason))
            .collect();

        assert_eq!(
            blocked["orphan"],
            BlockReason::MissingDependency {
                missing: vec!["ghost".to_string()]
            }
        );
        assert_eq!(
            blocked["after_orphan"],
            BlockReason::MissingDependency {
                missing: vec!["ghost".to_string()]
            }
        );
        assert_eq!(blocked["x"], BlockReason::Cycle);
        assert_eq!(blocked["y"], BlockReason::Cycle);
        assert_eq!(blocked["leaf"], BlockReason::Waiting);
        // root is ready, so not blocked
        assert!(!blocked.contains_key("root"));
    }

    #[test]
    fn test_blocked_missing_lists_each_unknown_once() {
        let tasks = vec![
            task("a", &["ghost"]),
            task("b", &["other"]),
            task("c", &["ghost"]),
            task("d", &["a", "b", "c"]),
        ];
        let blocked = blocked_tasks(&tasks);
        let d = blocked.iter().find(|b| b.id == "d").unwrap();
        assert_eq!(
            d.reason,
            BlockReason::MissingDependency {
                missing: vec!["ghost".to_string(), "other".to_string()]
            }
        );
    }
}
