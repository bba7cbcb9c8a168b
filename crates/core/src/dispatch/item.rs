use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, RunReport};
use crate::workflow::WorkflowState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identifier of a queued work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a work item executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    /// One node against a state snapshot
    NodeExecution {
        state: WorkflowState,
        node_id: NodeId,
    },
    /// A whole run, orchestrated inside the worker
    WorkflowRun { state: WorkflowState },
    /// Auxiliary job outside any graph
    Job { task_type: String, args: Value },
}

/// Unit of execution with retry bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,
    pub kind: WorkKind,
    /// 1-based; the execution about to happen or in progress
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl WorkItem {
    pub fn new(kind: WorkKind, policy: &RetryPolicy) -> Self {
        Self {
            id: WorkId::new(),
            kind,
            attempt: 1,
            max_attempts: policy.max_attempts,
            backoff_secs: policy.backoff_secs,
        }
    }

    pub fn node(state: WorkflowState, node_id: NodeId, policy: &RetryPolicy) -> Self {
        Self::new(WorkKind::NodeExecution { state, node_id }, policy)
    }

    pub fn workflow(state: WorkflowState, policy: &RetryPolicy) -> Self {
        Self::new(WorkKind::WorkflowRun { state }, policy)
    }

    pub fn job(task_type: impl Into<String>, args: Value, policy: &RetryPolicy) -> Self {
        Self::new(
            WorkKind::Job {
                task_type: task_type.into(),
                args,
            },
            policy,
        )
    }

    /// Retry policy carried by this item
    pub fn policy(&self, task_timeout_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_secs: self.backoff_secs,
            task_timeout_secs,
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            WorkKind::NodeExecution { state, node_id } => {
                format!("node {} of run {}", node_id, state.run_id)
            }
            WorkKind::WorkflowRun { state } => format!("run {}", state.run_id),
            WorkKind::Job { task_type, .. } => format!("job {}", task_type),
        }
    }
}

/// Lifecycle of a work item.
///
/// `Queued -> Running -> Succeeded | FailedRetrying -> Retried -> Running ...`
/// ending in `Succeeded` or `FailedPermanently`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Queued,
    Running,
    Succeeded,
    FailedRetrying,
    Retried,
    FailedPermanently,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Succeeded | WorkState::FailedPermanently)
    }
}

/// Result delivered to the submitter
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Node { state: WorkflowState, attempts: u32 },
    Run(RunReport),
    /// `None` when the job failed permanently
    Job(Option<Value>),
}

/// Awaitable completion of a submitted item
pub struct WorkHandle {
    id: WorkId,
    rx: oneshot::Receiver<EngineResult<WorkOutcome>>,
}

impl WorkHandle {
    pub(crate) fn new(id: WorkId, rx: oneshot::Receiver<EngineResult<WorkOutcome>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Wait for the item to reach a terminal state
    pub async fn wait(self) -> EngineResult<WorkOutcome> {
        let id = self.id;
        self.rx.await.map_err(|_| {
            EngineError::Dispatcher(format!("work item {} dropped before completion", id))
        })?
    }
}
