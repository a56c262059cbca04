use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::graph::TaskKey;

/// Timing of a single task execution.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

impl TaskExecution {
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

/// Lifecycle of a task within one `compute()` call.
///
/// `Pending` → `Ready` → `Running` → `Done` | `Failed`. Tasks without
/// dependencies start out `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies done, waiting for a free worker.
    Ready,
    Running,
    Done,
    Failed,
    /// A dependency failed, so this task was never run.
    Skipped,
    /// Independent of any failure, but the run was aborted before this task
    /// was dispatched.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Skipped | TaskState::Cancelled
        )
    }
}

/// Record of a single `compute()` call.
///
/// Returned by [`Lazy::compute_with_diagnostics`](crate::Lazy::compute_with_diagnostics),
/// and alongside the error of a failed run by
/// [`Lazy::compute_report`](crate::Lazy::compute_report).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Execution metrics of every task that ran.
    pub execution_times: HashMap<TaskKey, TaskExecution>,
    /// Final state of every task reachable from the target.
    pub states: HashMap<TaskKey, TaskState>,
    /// Keys in the order they were handed to workers.
    pub dispatch_order: Vec<TaskKey>,
    /// Largest number of values held at once.
    pub peak_resident: usize,
    /// Size of the worker pool.
    pub workers: usize,
}

impl Diagnostics {
    /// Keys of every task that was executed.
    pub fn executed(&self) -> BTreeSet<TaskKey> {
        self.execution_times.keys().cloned().collect()
    }

    /// Whether `a` finished before `b` started. `None` if either didn't run.
    pub fn finished_before(&self, a: &TaskKey, b: &TaskKey) -> Option<bool> {
        let a = self.execution_times.get(a)?;
        let b = self.execution_times.get(b)?;
        Some(a.end() <= b.start)
    }

    pub fn total_duration(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }
}
