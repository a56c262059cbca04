use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding [`ComputeConfig::workers`].
pub const ENV_WORKERS: &str = "LAZYGRAPH_WORKERS";
/// Environment variable overriding [`ComputeConfig::on_failure`].
pub const ENV_ON_FAILURE: &str = "LAZYGRAPH_ON_FAILURE";

/// What happens to the rest of the graph when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop dispatching new tasks as soon as one fails. Tasks that are already
    /// running are allowed to finish; their results are discarded.
    #[default]
    FailFast,
    /// Keep running every task that doesn't depend on a failed one, then
    /// report all failures together.
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fail-fast" => Ok(FailurePolicy::FailFast),
            "best-effort" => Ok(FailurePolicy::BestEffort),
            other => Err(ConfigError::FailurePolicy(other.to_string())),
        }
    }
}

/// Options for a single `compute()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Degree of parallelism. `1` runs the graph sequentially, with the same
    /// results as any other value.
    pub workers: usize,
    /// Failure handling policy.
    pub on_failure: FailurePolicy,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            on_failure: FailurePolicy::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

impl ComputeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Defaults, overridden by `LAZYGRAPH_WORKERS` and `LAZYGRAPH_ON_FAILURE`
    /// when they are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = lookup(ENV_WORKERS) {
            config.workers = workers
                .trim()
                .parse()
                .map_err(|err| ConfigError::Workers(workers.clone(), err))?;

            if config.workers == 0 {
                return Err(ConfigError::ZeroWorkers);
            }
        }

        if let Some(policy) = lookup(ENV_ON_FAILURE) {
            config.on_failure = policy.parse()?;
        }

        Ok(config)
    }

    /// Worker count actually used; zero is treated as one.
    pub(crate) fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }
}
