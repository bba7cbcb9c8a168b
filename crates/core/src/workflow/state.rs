use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, RunId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::contract::{NodeInput, NodeOutput};
use super::invoke::expand_invocations;

/// Value of a node field: a literal, or a reference to another node's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Value(Value),
    Ref(FieldRef),
}

impl FieldValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        FieldValue::Value(value.into())
    }

    pub fn reference(node: impl Into<String>, field: impl Into<String>) -> Self {
        FieldValue::Ref(FieldRef {
            node: NodeId::new(node),
            field: field.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub node: NodeId,
    pub field: String,
}

/// One node of a stored workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Disabled in the editor; dropped before execution
    #[serde(default)]
    pub ignored: bool,
}

/// Stored workflow definition, as authored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub nodes: Vec<NodeDefinition>,
    /// Workflows invoked by this one, shipped alongside it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related_workflows: BTreeMap<WorkflowId, WorkflowDefinition>,
}

/// Per-run state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Absent until the node's own handler has run
    #[serde(default)]
    pub output: Option<BTreeMap<String, Value>>,
}

impl NodeState {
    pub fn new(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            node_type: node_type.into(),
            fields: BTreeMap::new(),
            output: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

}

/// The graph-plus-values object handed between handler invocations.
///
/// Every handoff is a full snapshot; workers never share a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub version: u64,
    pub nodes: BTreeMap<NodeId, NodeState>,
}

impl WorkflowState {
    pub fn new(workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self {
            workflow_id,
            run_id,
            version: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// Build a fresh run state from a definition.
    ///
    /// Ignored nodes are dropped and invoked workflows are inlined, looked up
    /// in the definition's `related_workflows`.
    pub fn from_definition(definition: &WorkflowDefinition, run_id: RunId) -> EngineResult<Self> {
        Self::from_definition_with(definition, run_id, &|id| {
            Ok(definition.related_workflows.get(id).cloned())
        })
    }

    /// Like [`WorkflowState::from_definition`], resolving invoked workflows through `resolve`
    pub fn from_definition_with(
        definition: &WorkflowDefinition,
        run_id: RunId,
        resolve: &dyn Fn(&WorkflowId) -> EngineResult<Option<WorkflowDefinition>>,
    ) -> EngineResult<Self> {
        let mut state = Self::new(definition.id.clone(), run_id);

        for node in expand_invocations(definition, resolve)? {
            if state.nodes.contains_key(&node.id) {
                return Err(EngineError::InvalidDefinition {
                    workflow_id: definition.id.to_string(),
                    reason: format!("duplicate node id {}", node.id),
                });
            }
            state.nodes.insert(
                node.id.clone(),
                NodeState {
                    node_id: node.id,
                    node_type: node.node_type,
                    fields: node.fields,
                    output: None,
                },
            );
        }

        state.validate()?;
        Ok(state)
    }

    pub fn with_node(mut self, node: NodeState) -> Self {
        self.nodes.insert(node.node_id.clone(), node);
        self
    }

    pub fn node(&self, node_id: &NodeId) -> EngineResult<&NodeState> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))
    }

    /// Check that every field reference points at an existing node
    pub fn validate(&self) -> EngineResult<()> {
        for node in self.nodes.values() {
            for (field, value) in &node.fields {
                if let FieldValue::Ref(r) = value {
                    if !self.nodes.contains_key(&r.node) {
                        return Err(EngineError::DanglingReference {
                            node_id: node.node_id.clone(),
                            field: field.clone(),
                            target: r.node.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Current output value of a node field, if the node has produced it
    pub fn output(&self, node_id: &NodeId, field: &str) -> Option<&Value> {
        self.nodes
            .get(node_id)
            .and_then(|n| n.output.as_ref())
            .and_then(|o| o.get(field))
    }

    /// Build the node-scoped view a handler receives
    pub fn resolve_inputs(&self, node_id: &NodeId) -> EngineResult<NodeInput> {
        let node = self.node(node_id)?;
        let mut fields = BTreeMap::new();

        for (name, value) in &node.fields {
            let resolved = match value {
                FieldValue::Value(v) => v.clone(),
                FieldValue::Ref(r) => {
                    let source = self.nodes.get(&r.node).ok_or_else(|| {
                        EngineError::DanglingReference {
                            node_id: node_id.clone(),
                            field: name.clone(),
                            target: r.node.clone(),
                        }
                    })?;
                    let output = source.output.as_ref().ok_or_else(|| {
                        EngineError::DependencyNotReady {
                            node_id: node_id.clone(),
                            dependency: r.node.clone(),
                        }
                    })?;
                    // A finished source that never wrote the field resolves to null
                    output.get(&r.field).cloned().unwrap_or(Value::Null)
                }
            };
            fields.insert(name.clone(), resolved);
        }

        Ok(NodeInput {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            node_id: node_id.clone(),
            node_type: node.node_type.clone(),
            fields,
        })
    }

    /// Copy of this state with the node's output written and the version bumped
    pub fn with_output(&self, node_id: &NodeId, output: NodeOutput) -> EngineResult<Self> {
        let mut next = self.clone();
        let node = next
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))?;
        node.output = Some(output.into_fields());
        next.version += 1;
        Ok(next)
    }

    /// Take the output of `node_id` from a snapshot returned by a worker.
    ///
    /// Only that node's output is copied; anything else in the snapshot is ignored.
    pub fn merge_node(&mut self, snapshot: &WorkflowState, node_id: &NodeId) -> EngineResult<()> {
        let output = snapshot.node(node_id)?.output.clone();
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))?;
        node.output = output;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_state() -> WorkflowState {
        WorkflowState::new(WorkflowId::new("wf"), RunId::new())
            .with_node(
                NodeState::new("a", "text_processing.text_in_out")
                    .with_field("text", FieldValue::literal("hello")),
            )
            .with_node(
                NodeState::new("b", "text_processing.text_in_out")
                    .with_field("text", FieldValue::reference("a", "output")),
            )
    }

    #[test]
    fn test_reference_not_ready_until_source_has_output() {
        let state = two_node_state();
        let err = state.resolve_inputs(&NodeId::new("b")).unwrap_err();
        assert!(matches!(err, EngineError::DependencyNotReady { .. }));

        let state = state
            .with_output(&NodeId::new("a"), NodeOutput::single(json!("hello")))
            .unwrap();
        let input = state.resolve_inputs(&NodeId::new("b")).unwrap();
        assert_eq!(input.get("text"), Some(&json!("hello")));
        assert_eq!(state.version, 1);
    }

    #[test]
    fn test_missing_output_field_resolves_to_null() {
        let state = two_node_state()
            .with_output(&NodeId::new("a"), NodeOutput::new().with("other", json!(1)))
            .unwrap();
        let input = state.resolve_inputs(&NodeId::new("b")).unwrap();
        assert_eq!(input.get("text"), Some(&Value::Null));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "control_flows.empty",
                 "fields": {"x": {"ref": {"node": "ghost", "field": "output"}}}}
            ]
        }))
        .unwrap();

        let err = WorkflowState::from_definition(&definition, RunId::new()).unwrap_err();
        assert!(matches!(err, EngineError::DanglingReference { .. }));
    }

    #[test]
    fn test_ignored_nodes_are_dropped() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "control_flows.empty"},
                {"id": "b", "type": "control_flows.empty", "ignored": true}
            ]
        }))
        .unwrap();

        let state = WorkflowState::from_definition(&definition, RunId::new()).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert!(state.nodes.contains_key(&NodeId::new("a")));
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "control_flows.empty"},
                {"id": "a", "type": "control_flows.empty"}
            ]
        }))
        .unwrap();

        let err = WorkflowState::from_definition(&definition, RunId::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_related_workflows_are_inlined() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "main",
            "nodes": [
                {"id": "call", "type": "workflows.invoke",
                 "fields": {"workflow_id": {"value": "greet"},
                            "hello.text": {"value": "hi there"}}},
                {"id": "shout", "type": "text_processing.text_in_out",
                 "fields": {"text": {"ref": {"node": "call", "field": "hello.output"}}}}
            ],
            "related_workflows": {
                "greet": {
                    "id": "greet",
                    "nodes": [{"id": "hello", "type": "text_processing.text_in_out"}]
                }
            }
        }))
        .unwrap();

        let state = WorkflowState::from_definition(&definition, RunId::new()).unwrap();
        let ids: Vec<&str> = state.nodes.keys().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["call/hello", "shout"]);
        assert_eq!(
            state.nodes[&NodeId::new("call/hello")].fields["text"],
            FieldValue::literal("hi there")
        );
        assert_eq!(
            state.nodes[&NodeId::new("shout")].fields["text"],
            FieldValue::reference("call/hello", "output")
        );
    }

    #[test]
    fn test_merge_copies_only_the_named_node() {
        let mut master = two_node_state();
        let mut snapshot = master
            .with_output(&NodeId::new("a"), NodeOutput::single(json!("x")))
            .unwrap();
        snapshot
            .nodes
            .get_mut(&NodeId::new("b"))
            .unwrap()
            .output = Some(BTreeMap::from([("output".to_string(), json!("forged"))]));

        master.merge_node(&snapshot, &NodeId::new("a")).unwrap();

        assert_eq!(master.output(&NodeId::new("a"), "output"), Some(&json!("x")));
        assert_eq!(master.output(&NodeId::new("b"), "output"), None);
        assert_eq!(master.version, 1);
    }
}
