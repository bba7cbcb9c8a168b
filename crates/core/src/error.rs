//! Error types for the workflow engine.

use crate::types::{NodeId, RunId};
use std::time::Duration;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type returned by node and job handlers.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by the engine itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// No handler registered for the node type.
    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    /// A referenced node has not produced output yet. Never surfaced to users.
    #[error("Node {node_id} depends on {dependency}, which has no output yet")]
    DependencyNotReady { node_id: NodeId, dependency: NodeId },

    /// No pending node can ever become ready and no failure explains it.
    #[error("Graph cycle or unresolvable dependency among nodes: {}", join_ids(.pending))]
    GraphCycleOrUnresolvableDependency { pending: Vec<NodeId> },

    /// Handler failed with a retryable error.
    #[error("Task {task} failed transiently on attempt {attempt}: {message}")]
    HandlerTransientFailure {
        task: String,
        attempt: u32,
        message: String,
    },

    /// Handler failed for good, either explicitly or after retries ran out.
    #[error("Task {task} failed permanently after {attempts} attempt(s): {message}")]
    HandlerPermanentFailure {
        task: String,
        attempts: u32,
        message: String,
    },

    /// A field reference points at a node that does not exist.
    #[error("Field {field} of node {node_id} references missing node {target}")]
    DanglingReference {
        node_id: NodeId,
        field: String,
        target: NodeId,
    },

    #[error("Node {0} not found")]
    UnknownNode(NodeId),

    /// Task type string is not of the form `category.name`.
    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),

    #[error("Task {0} registered twice")]
    DuplicateTask(String),

    #[error("Task registry already installed")]
    RegistryAlreadyInstalled,

    /// Optimistic lock failure when persisting a workflow state.
    #[error("Stale workflow state for {workflow_id}: stored version {stored}, attempted {attempted}")]
    StaleVersion {
        workflow_id: String,
        stored: u64,
        attempted: u64,
    },

    /// A definition cannot be turned into a runnable state.
    #[error("Invalid workflow {workflow_id}: {reason}")]
    InvalidDefinition { workflow_id: String, reason: String },

    #[error("Run {0} was aborted")]
    Aborted(RunId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Dispatcher error: {0}")]
    Dispatcher(String),
}

impl EngineError {
    /// Whether this error ends the whole run rather than a single node
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::GraphCycleOrUnresolvableDependency { .. }
                | EngineError::DanglingReference { .. }
                | EngineError::StaleVersion { .. }
                | EngineError::Storage(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Storage(format!("{:#}", e))
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error returned by a handler. The handler decides whether retrying can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Transient failure; the dispatch layer may run the handler again.
    #[error("{message}")]
    Retry {
        message: String,
        /// Overrides the configured backoff for the next attempt.
        after: Option<Duration>,
        /// Overrides the configured retry ceiling (retries beyond the first attempt).
        max_retries: Option<u32>,
    },

    /// Retrying is pointless, e.g. invalid user input.
    #[error("{0}")]
    Permanent(String),
}

impl TaskError {
    pub fn retry(message: impl Into<String>) -> Self {
        TaskError::Retry {
            message: message.into(),
            after: None,
            max_retries: None,
        }
    }

    /// Request a retry with an explicit countdown and ceiling.
    pub fn retry_after(message: impl Into<String>, after_secs: u64, max_retries: u32) -> Self {
        TaskError::Retry {
            message: message.into(),
            after: Some(Duration::from_secs(after_secs)),
            max_retries: Some(max_retries),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Retry { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Retry { message, .. } => message,
            TaskError::Permanent(message) => message,
        }
    }
}

// Errors that were not classified by the handler are treated as transient.
impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::retry(format!("{:#}", e))
    }
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        TaskError::permanent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_lists_pending_nodes() {
        let err = EngineError::GraphCycleOrUnresolvableDependency {
            pending: vec![NodeId::new("a"), NodeId::new("b")],
        };
        assert_eq!(
            err.to_string(),
            "Graph cycle or unresolvable dependency among nodes: a, b"
        );
        assert!(err.is_run_fatal());
    }

    #[test]
    fn test_unclassified_errors_are_transient() {
        let err: TaskError = anyhow::anyhow!("connection reset").into();
        assert!(err.is_transient());
        assert_eq!(err.message(), "connection reset");

        let err = TaskError::retry_after("rate limited", 30, 5);
        match err {
            TaskError::Retry {
                after, max_retries, ..
            } => {
                assert_eq!(after, Some(Duration::from_secs(30)));
                assert_eq!(max_retries, Some(5));
            }
            TaskError::Permanent(_) => panic!("expected retry"),
        }
    }
}
