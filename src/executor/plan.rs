use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{ComputeError, CyclicGraphError};
use crate::graph::{Task, TaskGraph, TaskKey};

/// A single reachable task, with its edges resolved to node indices.
#[derive(Debug)]
pub(crate) struct Node {
    pub key: TaskKey,
    pub task: Task,
    /// Direct dependencies in argument order.
    pub dependencies: Vec<NodeIndex>,
    pub dependents: Vec<NodeIndex>,
    /// Lower runs first among ready tasks.
    pub priority: usize,
}

/// The part of a task graph needed to compute one target, validated and
/// indexed for the scheduler.
#[derive(Debug)]
pub(crate) struct Plan {
    nodes: Vec<Node>,
    index: HashMap<TaskKey, NodeIndex>,
    target: NodeIndex,
}

impl Plan {
    /// Validate that `target` and everything it depends on exist and form an
    /// acyclic graph.
    pub fn new(graph: &TaskGraph, target: &TaskKey) -> Result<Self, ComputeError> {
        if !graph.contains(target) {
            return Err(ComputeError::MissingTarget(target.clone()));
        }

        let reachable = graph.reachable(target)?;

        // Edges point from a dependency to its dependent.
        let mut dag = DiGraph::<&TaskKey, ()>::with_capacity(reachable.len(), reachable.len());
        let index: HashMap<&TaskKey, NodeIndex> = reachable
            .iter()
            .map(|&key| (key, dag.add_node(key)))
            .collect();

        let mut tasks = Vec::with_capacity(reachable.len());
        let mut dependencies = Vec::with_capacity(reachable.len());

        for &key in &reachable {
            let task = graph
                .get(key)
                .ok_or_else(|| ComputeError::MissingTarget(key.clone()))?;

            let node = index[key];
            let mut edges = Vec::new();
            for dependency in task.dependencies() {
                let source = index[&dependency];
                dag.add_edge(source, node, ());
                edges.push(source);
            }

            tasks.push(task.clone());
            dependencies.push(edges);
        }

        toposort(&dag, None).map_err(|cycle| CyclicGraphError {
            key: dag[cycle.node_id()].clone(),
        })?;

        let target = index[target];
        let priority = post_order(target, &dependencies);

        let nodes = tasks
            .into_iter()
            .zip(dependencies)
            .enumerate()
            .map(|(i, (task, dependencies))| {
                let node = NodeIndex::new(i);
                Node {
                    key: dag[node].clone(),
                    task,
                    dependencies,
                    dependents: dag.neighbors_directed(node, Direction::Outgoing).collect(),
                    priority: priority[i],
                }
            })
            .collect();

        let index = index
            .into_iter()
            .map(|(key, node)| (key.clone(), node))
            .collect();

        Ok(Self {
            nodes,
            index,
            target,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn target(&self) -> NodeIndex {
        self.target
    }

    pub fn node(&self, node: NodeIndex) -> &Node {
        &self.nodes[node.index()]
    }

    pub fn find(&self, key: &TaskKey) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeIndex::new(i), node))
    }
}

/// Position of every node in a depth-first post-order walk from `target`,
/// visiting dependencies in argument order. Running tasks in this order
/// finishes one branch before starting the next.
fn post_order(target: NodeIndex, dependencies: &[Vec<NodeIndex>]) -> Vec<usize> {
    let mut priority = vec![usize::MAX; dependencies.len()];
    let mut visited = vec![false; dependencies.len()];
    let mut stack = vec![(target, false)];
    let mut next = 0;

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            priority[node.index()] = next;
            next += 1;
            continue;
        }

        if visited[node.index()] {
            continue;
        }
        visited[node.index()] = true;

        stack.push((node, true));
        for &dependency in dependencies[node.index()].iter().rev() {
            if !visited[dependency.index()] {
                stack.push((dependency, false));
            }
        }
    }

    priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Arg;

    fn sum(args: &[&str]) -> Task {
        Task::call(
            "sum",
            |inputs| {
                inputs
                    .iter()
                    .map(|input| input.downcast::<i64>())
                    .sum::<anyhow::Result<i64>>()
            },
            args.iter().map(|&key| Arg::Ref(key.into())).collect(),
        )
    }

    fn priority(plan: &Plan, key: &str) -> usize {
        let node = plan.find(&key.into()).unwrap();
        plan.node(node).priority
    }

    #[test]
    fn test_missing_target() {
        let graph = TaskGraph::new();
        let err = Plan::new(&graph, &"nope".into()).unwrap_err();
        assert!(matches!(err, ComputeError::MissingTarget(key) if key.as_str() == "nope"));
    }

    #[test]
    fn test_only_reachable_tasks_are_planned() {
        let mut graph = TaskGraph::new();
        graph.insert("a", Task::data(1i64));
        graph.insert("b", Task::data(2i64));
        graph.insert("c", sum(&["a"]));

        let plan = Plan::new(&graph, &"c".into()).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.find(&"b".into()).is_none());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.insert("a", sum(&["b"]));
        graph.insert("b", sum(&["a"]));

        let err = Plan::new(&graph, &"a".into()).unwrap_err();
        assert!(matches!(err, ComputeError::CyclicGraph(_)));
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.insert("a", sum(&["a"]));

        let err = Plan::new(&graph, &"a".into()).unwrap_err();
        assert!(matches!(err, ComputeError::CyclicGraph(CyclicGraphError { key }) if key.as_str() == "a"));
    }

    #[test]
    fn test_dangling_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.insert("a", sum(&["ghost"]));

        let err = Plan::new(&graph, &"a".into()).unwrap_err();
        assert!(matches!(err, ComputeError::DanglingDependency(_)));
    }

    #[test]
    fn test_edges_are_resolved() {
        let mut graph = TaskGraph::new();
        graph.insert("a", Task::data(1i64));
        graph.insert("b", sum(&["a"]));
        graph.insert("c", sum(&["a", "b"]));

        let plan = Plan::new(&graph, &"c".into()).unwrap();
        let a = plan.find(&"a".into()).unwrap();
        let c = plan.find(&"c".into()).unwrap();

        assert_eq!(plan.target(), c);
        assert_eq!(plan.node(c).dependencies.len(), 2);
        assert_eq!(plan.node(a).dependents.len(), 2);
        assert!(plan.node(a).dependencies.is_empty());
    }

    #[test]
    fn test_priority_finishes_branches_first() {
        //      root
        //     /    \
        //   left   right
        //    |       |
        //   l0      r0
        let mut graph = TaskGraph::new();
        graph.insert("l0", Task::data(1i64));
        graph.insert("r0", Task::data(2i64));
        graph.insert("left", sum(&["l0"]));
        graph.insert("right", sum(&["r0"]));
        graph.insert("root", sum(&["left", "right"]));

        let plan = Plan::new(&graph, &"root".into()).unwrap();
        assert_eq!(priority(&plan, "l0"), 0);
        assert_eq!(priority(&plan, "left"), 1);
        assert_eq!(priority(&plan, "r0"), 2);
        assert_eq!(priority(&plan, "right"), 3);
        assert_eq!(priority(&plan, "root"), 4);
    }
}
