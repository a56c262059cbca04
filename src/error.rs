use std::sync::Arc;

use thiserror::Error;

use crate::graph::TaskKey;

/// Operations that would need the concrete value behind a [`Lazy`](crate::Lazy)
/// handle and therefore can't be deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedOperation {
    /// Iterating over the handle.
    Iterate,
    /// Treating the handle as a boolean.
    BoolCoercion,
    /// Mutating the handle in place.
    Mutate,
}

impl std::fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsupportedOperation::Iterate => write!(f, "iteration"),
            UnsupportedOperation::BoolCoercion => write!(f, "boolean coercion"),
            UnsupportedOperation::Mutate => write!(f, "in-place mutation"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation} is not supported on lazy value '{key}', call compute() first")]
pub struct UnsupportedOperationError {
    pub operation: UnsupportedOperation,
    pub key: TaskKey,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task graph contains a cycle through '{key}'")]
pub struct CyclicGraphError {
    pub key: TaskKey,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task '{task}' depends on '{missing}', which is not in the task graph")]
pub struct DanglingDependencyError {
    pub task: TaskKey,
    pub missing: TaskKey,
}

/// A user callable failed (returned an error or panicked) while computing
/// `key`. The original error is kept intact and shared, so this error can be
/// cloned freely.
#[derive(Debug, Error, Clone)]
#[error("Task '{key}' failed:\n{error:#}")]
pub struct TaskExecutionError {
    pub key: TaskKey,
    error: Arc<anyhow::Error>,
}

impl TaskExecutionError {
    pub fn new(key: TaskKey, error: impl Into<anyhow::Error>) -> Self {
        Self {
            key,
            error: Arc::new(error.into()),
        }
    }

    /// The error returned by the user callable.
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Compute target '{0}' is not in the task graph")]
    MissingTarget(TaskKey),

    #[error(transparent)]
    CyclicGraph(#[from] CyclicGraphError),

    #[error(transparent)]
    DanglingDependency(#[from] DanglingDependencyError),

    #[error(transparent)]
    Task(#[from] TaskExecutionError),

    #[error("{} tasks failed:\n{}", .0.len(), format_failures(.0))]
    Tasks(Vec<TaskExecutionError>),

    #[error("Task '{key}' did not produce a value of type {expected}")]
    TargetType { key: TaskKey, expected: &'static str },

    #[error("Couldn't build the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ComputeError {
    /// Every task failure carried by this error, in the order they were seen.
    pub fn failures(&self) -> &[TaskExecutionError] {
        match self {
            ComputeError::Task(failure) => std::slice::from_ref(failure),
            ComputeError::Tasks(failures) => failures,
            _ => &[],
        }
    }
}

fn format_failures(failures: &[TaskExecutionError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid worker count '{0}'.\n{1}")]
    Workers(String, std::num::ParseIntError),

    #[error("Worker count must be at least 1")]
    ZeroWorkers,

    #[error("Unknown failure policy '{0}', expected 'fail-fast' or 'best-effort'")]
    FailurePolicy(String),
}
