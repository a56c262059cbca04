//! Running a task graph on a local worker pool.
//!
//! A single scheduler loop on the calling thread owns every piece of mutable
//! state: task states, dependency counters and the result store. Workers
//! only ever see a task and its resolved inputs, and report back over a
//! channel.

mod diagnostics;
mod plan;
mod store;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::{ComputeConfig, FailurePolicy};
use crate::core::Dynamic;
use crate::error::{ComputeError, TaskExecutionError};
use crate::graph::{Arg, Input, Task, TaskGraph, TaskKey};

pub use diagnostics::{Diagnostics, TaskExecution, TaskState};

use plan::Plan;
use store::ResultStore;

/// Compute the value of `target` in a hand-built graph.
///
/// Only the tasks reachable from `target` are run, each at most once. The
/// graph is validated first, so structural errors are reported before any
/// task runs.
pub fn compute(
    graph: &TaskGraph,
    target: &TaskKey,
    config: &ComputeConfig,
) -> Result<Dynamic, ComputeError> {
    run(graph, target, config).0
}

/// Like [`compute`], but the [`Diagnostics`] of the run are returned whether
/// or not it succeeded.
///
/// A graph rejected before running yields empty diagnostics.
pub fn compute_with_diagnostics(
    graph: &TaskGraph,
    target: &TaskKey,
    config: &ComputeConfig,
) -> (Result<Dynamic, ComputeError>, Diagnostics) {
    run(graph, target, config)
}

pub(crate) fn run(
    graph: &TaskGraph,
    target: &TaskKey,
    config: &ComputeConfig,
) -> (Result<Dynamic, ComputeError>, Diagnostics) {
    let workers = config.effective_workers();
    let rejected = |err: ComputeError| {
        let diagnostics = Diagnostics {
            workers,
            ..Diagnostics::default()
        };
        (Err(err), diagnostics)
    };

    let plan = match Plan::new(graph, target) {
        Ok(plan) => plan,
        Err(err) => return rejected(err),
    };

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("lazygraph-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(err) => return rejected(err.into()),
    };

    let root_span = tracing::span!(Level::INFO, "compute", target = %target, tasks = plan.len());
    root_span.pb_set_style(&crate::utils::get_style_compute());
    root_span.pb_set_length(plan.len() as u64);
    root_span.pb_set_message(&format!("Computing {}", target.name()));
    let _enter = root_span.enter();

    let started = Instant::now();
    let mut scheduler = Scheduler::new(&plan, config.on_failure, workers, root_span.clone());
    pool.in_place_scope(|scope| scheduler.drive(scope));

    let (result, diagnostics) = scheduler.finish();
    match &result {
        Ok(_) => tracing::debug!(elapsed = ?started.elapsed(), "compute finished"),
        Err(err) => tracing::debug!(elapsed = ?started.elapsed(), "compute failed: {err}"),
    }

    (result, diagnostics)
}

/// Message sent by a worker once a task has run.
struct Completion {
    node: NodeIndex,
    outcome: anyhow::Result<Dynamic>,
    start: Instant,
    duration: Duration,
}

struct Scheduler<'p> {
    plan: &'p Plan,
    policy: FailurePolicy,
    workers: usize,
    states: Vec<TaskState>,
    /// Dependencies of each task that aren't done yet.
    waiting_on: Vec<usize>,
    /// Dependents of each task that haven't run yet. At zero the value is
    /// dropped from the store.
    consumers: Vec<usize>,
    /// Ready tasks, lowest priority first.
    ready: BinaryHeap<Reverse<(usize, usize)>>,
    in_flight: usize,
    aborted: bool,
    store: ResultStore,
    failures: Vec<TaskExecutionError>,
    execution_times: HashMap<TaskKey, TaskExecution>,
    dispatch_order: Vec<TaskKey>,
    span: Span,
    task_style: ProgressStyle,
}

impl<'p> Scheduler<'p> {
    fn new(plan: &'p Plan, policy: FailurePolicy, workers: usize, span: Span) -> Self {
        let mut states = Vec::with_capacity(plan.len());
        let mut waiting_on = Vec::with_capacity(plan.len());
        let mut consumers = Vec::with_capacity(plan.len());
        let mut ready = BinaryHeap::new();

        for (index, node) in plan.nodes() {
            waiting_on.push(node.dependencies.len());
            consumers.push(node.dependents.len());

            if node.dependencies.is_empty() {
                states.push(TaskState::Ready);
                ready.push(Reverse((node.priority, index.index())));
            } else {
                states.push(TaskState::Pending);
            }
        }

        Self {
            plan,
            policy,
            workers,
            states,
            waiting_on,
            consumers,
            ready,
            in_flight: 0,
            aborted: false,
            store: ResultStore::default(),
            failures: Vec::new(),
            execution_times: HashMap::new(),
            dispatch_order: Vec::new(),
            span,
            task_style: crate::utils::get_style_task(),
        }
    }

    /// The scheduler loop. Returns once nothing is running and nothing more
    /// can be dispatched.
    fn drive<'s>(&mut self, scope: &rayon::Scope<'s>) {
        let (sender, receiver) = channel::<Completion>();

        loop {
            self.dispatch(scope, &sender);

            if self.in_flight == 0 {
                break;
            }

            let Ok(completion) = receiver.recv() else {
                break;
            };

            self.in_flight -= 1;
            self.settle(completion);
        }
    }

    /// Hand ready tasks to workers, keeping at most `workers` in flight.
    fn dispatch<'s>(&mut self, scope: &rayon::Scope<'s>, sender: &Sender<Completion>) {
        let plan = self.plan;

        while !self.aborted && self.in_flight < self.workers {
            let Some(Reverse((_, index))) = self.ready.pop() else {
                break;
            };

            let node = NodeIndex::new(index);
            let entry = plan.node(node);

            let inputs = match self.resolve_inputs(node) {
                Ok(inputs) => inputs,
                Err(error) => {
                    self.settle(Completion {
                        node,
                        outcome: Err(error),
                        start: Instant::now(),
                        duration: Duration::ZERO,
                    });
                    continue;
                }
            };

            tracing::debug!(task = %entry.key, "dispatch");
            self.states[index] = TaskState::Running;
            self.dispatch_order.push(entry.key.clone());
            self.in_flight += 1;

            let task = entry.task.clone();
            let key = entry.key.clone();
            let sender = sender.clone();
            let style = self.task_style.clone();
            let parent = self.span.clone();

            scope.spawn(move |_| {
                let span = tracing::span!(parent: &parent, Level::INFO, "task", key = %key);
                span.pb_set_style(&style);
                span.pb_set_message(&format!("Running {}", key.name()));
                let _enter = span.enter();

                let start = Instant::now();

                // The callable only sees its own inputs, so a panic can't
                // leave shared state half-updated.
                let outcome = match catch_unwind(AssertUnwindSafe(|| task.run(&inputs))) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };

                        Err(anyhow!(msg))
                    }
                };

                let duration = start.elapsed();

                // The receiver outlives every worker.
                let _ = sender.send(Completion {
                    node,
                    outcome,
                    start,
                    duration,
                });
            });
        }
    }

    fn resolve_inputs(&self, node: NodeIndex) -> anyhow::Result<Vec<Input>> {
        match &self.plan.node(node).task {
            Task::Data(_) => Ok(Vec::new()),
            Task::Call(call) => {
                call.args().iter().map(|arg| self.resolve(arg)).collect()
            }
        }
    }

    fn resolve(&self, arg: &Arg) -> anyhow::Result<Input> {
        match arg {
            Arg::Literal(literal) => Ok(Input::Value(literal.value().clone())),
            Arg::Ref(key) => self
                .plan
                .find(key)
                .and_then(|node| self.store.get(node))
                .map(|value| Input::Value(value.clone()))
                .ok_or_else(|| anyhow!("Value of dependency '{key}' is not available")),
            Arg::List(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<anyhow::Result<_>>()
                .map(Input::List),
            Arg::Map(items) => items
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.resolve(item)?)))
                .collect::<anyhow::Result<_>>()
                .map(Input::Map),
        }
    }

    /// Record the outcome of a task and unlock whatever it unblocks.
    fn settle(&mut self, completion: Completion) {
        let Completion {
            node,
            outcome,
            start,
            duration,
        } = completion;

        let plan = self.plan;
        let index = node.index();
        let key = &plan.node(node).key;

        self.execution_times
            .insert(key.clone(), TaskExecution { start, duration });
        self.span.pb_inc(1);

        match outcome {
            Ok(value) => {
                self.states[index] = TaskState::Done;

                // After a fail-fast abort the results of draining tasks are
                // discarded.
                if !self.aborted {
                    self.store_value(node, value);
                    self.unlock_dependents(node);
                }
            }
            Err(error) => {
                let failure = TaskExecutionError::new(key.clone(), error);
                tracing::warn!(task = %key, "{failure}");

                self.states[index] = TaskState::Failed;
                self.failures.push(failure);
                self.skip_dependents(node);

                if self.policy == FailurePolicy::FailFast {
                    self.aborted = true;
                }
            }
        }

        self.release_dependencies(node);
    }

    fn store_value(&mut self, node: NodeIndex, value: Dynamic) {
        if self.consumers[node.index()] > 0 || node == self.plan.target() {
            self.store.insert(node, value);
        }
    }

    fn unlock_dependents(&mut self, node: NodeIndex) {
        let plan = self.plan;

        for &dependent in &plan.node(node).dependents {
            let index = dependent.index();
            self.waiting_on[index] -= 1;

            if self.waiting_on[index] == 0 && self.states[index] == TaskState::Pending {
                self.states[index] = TaskState::Ready;
                self.ready
                    .push(Reverse((plan.node(dependent).priority, index)));
            }
        }
    }

    /// Mark every transitive dependent of a failed task as skipped.
    fn skip_dependents(&mut self, failed: NodeIndex) {
        let mut stack = self.plan.node(failed).dependents.clone();

        while let Some(node) = stack.pop() {
            let index = node.index();
            if self.states[index] != TaskState::Pending {
                continue;
            }

            tracing::debug!(task = %self.plan.node(node).key, "skipped");
            self.states[index] = TaskState::Skipped;
            self.span.pb_inc(1);

            // A skipped task will never consume its dependencies.
            self.release_dependencies(node);
            stack.extend(self.plan.node(node).dependents.iter().copied());
        }
    }

    /// `node` is finished with its dependencies; drop the values nothing else
    /// is waiting for.
    fn release_dependencies(&mut self, node: NodeIndex) {
        let plan = self.plan;

        for &dependency in &plan.node(node).dependencies {
            let index = dependency.index();
            self.consumers[index] -= 1;

            if self.consumers[index] == 0
                && dependency != plan.target()
                && self.store.expunge(dependency)
            {
                tracing::debug!(
                    task = %plan.node(dependency).key,
                    resident = self.store.len(),
                    "expunged"
                );
            }
        }
    }

    fn finish(mut self) -> (Result<Dynamic, ComputeError>, Diagnostics) {
        // Whatever is still waiting was cut off by a fail-fast abort.
        for state in &mut self.states {
            if matches!(state, TaskState::Pending | TaskState::Ready) {
                *state = TaskState::Cancelled;
            }
        }

        let plan = self.plan;
        let target = plan.target();

        let result = if self.failures.is_empty() {
            self.store.take(target).ok_or_else(|| {
                let key = plan.node(target).key.clone();
                ComputeError::from(TaskExecutionError::new(
                    key,
                    anyhow!("Task finished without a value"),
                ))
            })
        } else {
            Err(match self.policy {
                FailurePolicy::FailFast => ComputeError::Task(self.failures.swap_remove(0)),
                FailurePolicy::BestEffort => ComputeError::Tasks(self.failures),
            })
        };

        let states = plan
            .nodes()
            .map(|(node, entry)| (entry.key.clone(), self.states[node.index()]))
            .collect();

        let diagnostics = Diagnostics {
            execution_times: self.execution_times,
            states,
            dispatch_order: self.dispatch_order,
            peak_resident: self.store.peak(),
            workers: self.workers,
        };

        (result, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::graph::Literal;

    fn config(workers: usize) -> ComputeConfig {
        ComputeConfig::default().with_workers(workers)
    }

    fn add(a: &str, b: &str) -> Task {
        Task::call(
            "add",
            |inputs| Ok(inputs[0].downcast::<i64>()? + inputs[1].downcast::<i64>()?),
            vec![Arg::Ref(a.into()), Arg::Ref(b.into())],
        )
    }

    fn fail() -> Task {
        Task::call(
            "fail",
            |_| -> anyhow::Result<i64> { Err(anyhow!("boom")) },
            vec![],
        )
    }

    fn value(dynamic: Dynamic) -> i64 {
        *dynamic.downcast_ref::<i64>().unwrap()
    }

    #[test]
    fn test_hand_built_graph() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("y", Task::data(2i64));
        graph.insert("z", add("x", "y"));
        graph.insert("w", add("z", "y"));

        for workers in [1, 4] {
            let result = compute(&graph, &"w".into(), &config(workers)).unwrap();
            assert_eq!(value(result), 5);
        }
    }

    #[test]
    fn test_data_target() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(7i64));

        let result = compute(&graph, &"x".into(), &config(1)).unwrap();
        assert_eq!(value(result), 7);
    }

    #[test]
    fn test_nested_arguments_are_resolved() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("y", Task::data(2i64));
        graph.insert(
            "total",
            Task::call(
                "total",
                |inputs| {
                    let Input::List(items) = &inputs[0] else {
                        anyhow::bail!("expected a list");
                    };
                    let Input::Map(extra) = &inputs[1] else {
                        anyhow::bail!("expected a map");
                    };

                    let mut sum = 0;
                    for item in items {
                        sum += item.downcast::<i64>()?;
                    }
                    Ok(sum + extra["k"].downcast::<i64>()?)
                },
                vec![
                    Arg::List(vec![
                        Arg::Ref("x".into()),
                        Arg::Ref("y".into()),
                        Arg::Literal(Literal::new(10i64)),
                    ]),
                    Arg::Map([("k".to_string(), Arg::Ref("x".into()))].into()),
                ],
            ),
        );

        let result = compute(&graph, &"total".into(), &config(2)).unwrap();
        assert_eq!(value(result), 14);
    }

    #[test]
    fn test_unreachable_tasks_do_not_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();

        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert(
            "other",
            Task::call(
                "other",
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(0i64)
                },
                vec![],
            ),
        );

        compute(&graph, &"x".into(), &config(2)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fail_fast_reports_first_failure() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("bad", fail());
        graph.insert("z", add("x", "bad"));

        let err = compute(&graph, &"z".into(), &config(1)).unwrap_err();
        match err {
            ComputeError::Task(failure) => {
                assert_eq!(failure.key.as_str(), "bad");
                assert_eq!(failure.error().to_string(), "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_panics_become_failures() {
        let mut graph = TaskGraph::new();
        graph.insert(
            "p",
            Task::call(
                "p",
                |_| -> anyhow::Result<i64> { panic!("kaboom") },
                vec![],
            ),
        );

        let err = compute(&graph, &"p".into(), &config(2)).unwrap_err();
        let failure = &err.failures()[0];
        assert!(failure.error().to_string().contains("Task panicked: kaboom"));
    }

    #[test]
    fn test_best_effort_skips_dependents() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("bad", fail());
        graph.insert("mid", add("x", "bad"));
        graph.insert("ok", add("x", "x"));
        graph.insert("top", add("mid", "ok"));

        let config = config(2).with_failure_policy(FailurePolicy::BestEffort);
        let plan = Plan::new(&graph, &"top".into()).unwrap();
        let mut scheduler = Scheduler::new(&plan, config.on_failure, 2, Span::none());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap();
        pool.in_place_scope(|scope| scheduler.drive(scope));

        let state = |key: &str| scheduler.states[plan.find(&key.into()).unwrap().index()];
        assert_eq!(state("bad"), TaskState::Failed);
        assert_eq!(state("mid"), TaskState::Skipped);
        assert_eq!(state("top"), TaskState::Skipped);
        assert_eq!(state("ok"), TaskState::Done);

        let (result, diagnostics) = scheduler.finish();
        assert!(matches!(result, Err(ComputeError::Tasks(ref failures)) if failures.len() == 1));
        assert_eq!(diagnostics.states[&TaskKey::from("top")], TaskState::Skipped);
    }

    #[test]
    fn test_fail_fast_skips_dependents() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        graph.insert("bad", fail());
        graph.insert("mid", add("x", "bad"));
        graph.insert("other", add("x", "x"));
        graph.insert("top", add("mid", "other"));

        let (result, diagnostics) = run(&graph, &"top".into(), &config(1));
        match result {
            Err(ComputeError::Task(failure)) => assert_eq!(failure.key.as_str(), "bad"),
            other => panic!("unexpected {other:?}"),
        }

        let state = |key: &str| diagnostics.states[&TaskKey::from(key)];
        assert_eq!(state("x"), TaskState::Done);
        assert_eq!(state("bad"), TaskState::Failed);
        assert_eq!(state("mid"), TaskState::Skipped);
        assert_eq!(state("top"), TaskState::Skipped);
        assert_eq!(state("other"), TaskState::Cancelled);
    }

    #[test]
    fn test_rejected_graph_has_empty_diagnostics() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));

        let (result, diagnostics) = compute_with_diagnostics(&graph, &"y".into(), &config(3));
        assert!(matches!(result, Err(ComputeError::MissingTarget(_))));
        assert!(diagnostics.states.is_empty());
        assert_eq!(diagnostics.workers, 3);
    }

    #[test]
    fn test_values_are_expunged() {
        let mut graph = TaskGraph::new();
        graph.insert("x", Task::data(1i64));
        let mut previous = String::from("x");
        for i in 0..20 {
            let key = format!("step{i}");
            graph.insert(key.as_str(), add(&previous, &previous));
            previous = key;
        }

        let (result, diagnostics) = run(&graph, &previous.as_str().into(), &config(3));
        let result = result.unwrap();
        assert_eq!(value(result), 1 << 20);
        assert!(diagnostics.peak_resident <= 2);
        assert_eq!(diagnostics.executed().len(), 21);
        assert!(diagnostics.states.values().all(|s| *s == TaskState::Done));
    }

    #[test]
    fn test_dispatch_follows_priority() {
        let mut graph = TaskGraph::new();
        graph.insert("a", Task::data(1i64));
        graph.insert("b", Task::data(2i64));
        graph.insert("left", add("a", "a"));
        graph.insert("right", add("b", "b"));
        graph.insert("root", add("left", "right"));

        let (result, diagnostics) = run(&graph, &"root".into(), &config(1));
        assert_eq!(value(result.unwrap()), 6);
        let order: Vec<_> = diagnostics
            .dispatch_order
            .iter()
            .map(TaskKey::as_str)
            .collect();
        assert_eq!(order, ["a", "left", "b", "right", "root"]);
    }
}
