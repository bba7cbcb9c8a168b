use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: WorkflowId,
        node_count: usize,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunPartiallyFailed {
        failed: Vec<NodeId>,
        unreachable: Vec<NodeId>,
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },
    RunAborted {
        reason: String,
    },

    // Node lifecycle events
    NodeStarted {
        node_id: NodeId,
        task_type: String,
        attempt: u32,
    },
    NodeCompleted {
        node_id: NodeId,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: NodeId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    NodeUnreachable {
        node_id: NodeId,
        blocked_by: Vec<NodeId>,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}
