use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration, constructed once at startup and passed to components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerPoolConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers pulling from the shared queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How many finished work items keep a queryable status
    #[serde(default = "default_status_retention")]
    pub status_retention: usize,
}

fn default_concurrency() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_status_retention() -> usize {
    1024
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            status_retention: default_status_retention(),
        }
    }
}

/// Fixed-backoff retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Per-attempt time limit; exceeding it counts as a transient failure
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_task_timeout_secs() -> u64 {
    600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff_secs,
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Decide the fate of a failed attempt. `attempt` is 1-based and counts
    /// the execution that just failed.
    pub fn decide(&self, attempt: u32, error: &TaskError, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::GiveUp;
        }

        match error {
            TaskError::Permanent(_) => RetryDecision::GiveUp,
            TaskError::Retry {
                after, max_retries, ..
            } => {
                let ceiling = max_retries
                    .map(|retries| retries.saturating_add(1))
                    .unwrap_or(self.max_attempts);
                if attempt < ceiling {
                    RetryDecision::RetryAfter(after.unwrap_or_else(|| self.backoff()))
                } else {
                    RetryDecision::GiveUp
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on sibling nodes running at the same time within one run
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
}

fn default_max_parallel_nodes() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
        }
    }
}
