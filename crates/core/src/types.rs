use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a node, unique within one workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a stored workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartiallyFailed,
    Aborted,
}

/// Status of a node during one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

/// Execution record of a single node within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Last error, set when the node failed
    pub error: Option<String>,
    /// Failed nodes that keep this node from ever becoming ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<NodeId>,
}

impl NodeExecution {
    pub fn pending(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            blocked_by: Vec::new(),
        }
    }

    /// Pending node whose dependencies can no longer complete
    pub fn is_unreachable(&self) -> bool {
        self.status == NodeStatus::Pending && !self.blocked_by.is_empty()
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeId, NodeExecution>,
    pub state: crate::workflow::WorkflowState,
}

impl RunReport {
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(&NodeId::new(node_id)).map(|n| n.status)
    }

    pub fn failed_nodes(&self) -> Vec<&NodeExecution> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Failed)
            .collect()
    }

    pub fn unreachable_nodes(&self) -> Vec<&NodeExecution> {
        self.nodes.values().filter(|n| n.is_unreachable()).collect()
    }
}

/// Stable identifier for an external side effect (e.g. a vector point).
///
/// Derived from the run/node identity so that re-running a handler with the
/// same input addresses the same external record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn derive(parts: &[&str]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Self(hex::encode(hasher.finalize())[..32].to_string())
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
