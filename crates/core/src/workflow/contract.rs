//! The node task contract: `(workflow_state, node_id) -> workflow_state'`.
//!
//! Handlers never see the whole graph. They receive a [`NodeInput`] holding
//! their own fields with references already resolved, and return a
//! [`NodeOutput`] that is written to their own node only.

use crate::error::{EngineError, TaskError, TaskResult};
use crate::types::{ExternalId, NodeId, RunId, WorkflowId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;

use super::batch::Batch;
use super::state::WorkflowState;

/// Node-scoped view handed to a handler
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub node_type: String,
    pub fields: BTreeMap<String, Value>,
}

impl NodeInput {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value; a missing or null field is invalid user input
    pub fn require(&self, field: &str) -> TaskResult<&Value> {
        match self.fields.get(field) {
            Some(Value::Null) | None => Err(TaskError::permanent(format!(
                "Node {} is missing required field '{}'",
                self.node_id, field
            ))),
            Some(value) => Ok(value),
        }
    }

    /// Field rendered as text. Numbers and booleans are stringified.
    pub fn text(&self, field: &str) -> TaskResult<String> {
        Ok(value_to_text(self.require(field)?))
    }

    pub fn text_or(&self, field: &str, default: &str) -> String {
        match self.fields.get(field) {
            Some(Value::Null) | None => default.to_string(),
            Some(value) => value_to_text(value),
        }
    }

    pub fn u64_or(&self, field: &str, default: u64) -> TaskResult<u64> {
        match self.fields.get(field) {
            Some(Value::Null) | None => Ok(default),
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                TaskError::permanent(format!("Field '{}' must be a non-negative integer", field))
            }),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                TaskError::permanent(format!("Field '{}' must be a non-negative integer", field))
            }),
            Some(_) => Err(TaskError::permanent(format!(
                "Field '{}' must be a non-negative integer",
                field
            ))),
        }
    }

    /// Field coerced to a batch (scalar becomes a one-element sequence)
    pub fn batch(&self, field: &str) -> TaskResult<Batch> {
        Ok(Batch::from_value(self.require(field)?))
    }

    /// Stable identifier for the `index`-th external record this node writes
    pub fn external_id(&self, index: usize) -> ExternalId {
        ExternalId::derive(&[
            &self.run_id.to_string(),
            self.node_id.as_str(),
            &index.to_string(),
        ])
    }
}

pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Output fields written by a handler to its own node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    fields: BTreeMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output with a single `output` field
    pub fn single(value: Value) -> Self {
        Self::new().with("output", value)
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }
}

/// A node-type handler
#[async_trait::async_trait]
pub trait NodeTask: Send + Sync {
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput>;
}

/// Auxiliary, non-graph job (e.g. title summarization, point upload)
#[async_trait::async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self, args: Value) -> TaskResult<Value>;
}

/// Adapter turning an async closure into a [`NodeTask`]
pub struct FnTask<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> NodeTask for FnTask<F>
where
    F: Fn(NodeInput) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<NodeOutput>> + Send,
{
    async fn run(&self, input: NodeInput) -> TaskResult<NodeOutput> {
        (self.0)(input).await
    }
}

/// Failure of one contract invocation
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeTaskError {
    /// The engine could not build the handler's input; the handler did not run
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Run `task` for `node_id` against a snapshot and return the updated copy.
pub async fn execute_node_task(
    task: &dyn NodeTask,
    state: &WorkflowState,
    node_id: &NodeId,
) -> Result<WorkflowState, NodeTaskError> {
    let input = state.resolve_inputs(node_id)?;
    let output = task.run(input).await?;
    Ok(state.with_output(node_id, output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{FieldValue, NodeState};
    use serde_json::json;

    fn state() -> WorkflowState {
        WorkflowState::new(WorkflowId::new("wf"), RunId::new())
            .with_node(
                NodeState::new("src", "control_flows.empty")
                    .with_field("n", FieldValue::literal(3)),
            )
            .with_node(
                NodeState::new("dst", "control_flows.empty")
                    .with_field("n", FieldValue::reference("src", "output")),
            )
    }

    fn doubler() -> FnTask<impl Fn(NodeInput) -> std::future::Ready<TaskResult<NodeOutput>>> {
        FnTask(|input: NodeInput| {
            let n = input.u64_or("n", 0);
            std::future::ready(n.map(|n| NodeOutput::single(json!(n * 2))))
        })
    }

    #[tokio::test]
    async fn test_execute_writes_own_output_and_bumps_version() {
        let task = doubler();
        let before = state();
        let after = execute_node_task(&task, &before, &NodeId::new("src"))
            .await
            .unwrap();

        assert_eq!(after.output(&NodeId::new("src"), "output"), Some(&json!(6)));
        assert_eq!(after.version, before.version + 1);
        assert_eq!(before.output(&NodeId::new("src"), "output"), None);
    }

    #[tokio::test]
    async fn test_execute_refuses_unready_dependency() {
        let task = doubler();
        let err = execute_node_task(&task, &state(), &NodeId::new("dst"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeTaskError::Engine(EngineError::DependencyNotReady { .. })
        ));
    }

    #[test]
    fn test_require_rejects_null() {
        let input = NodeInput {
            run_id: RunId::new(),
            workflow_id: WorkflowId::new("wf"),
            node_id: NodeId::new("n"),
            node_type: "x.y".to_string(),
            fields: BTreeMap::from([("text".to_string(), Value::Null)]),
        };
        let err = input.require("text").unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(input.text_or("text", "fallback"), "fallback");
    }
}
