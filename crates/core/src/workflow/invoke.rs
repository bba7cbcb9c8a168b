//! Inlining of sub-workflow invocations.
//!
//! An invoke node (`workflows.invoke`) names another workflow in its
//! `workflow_id` field. When a definition is loaded, the invoked workflow's
//! nodes are copied into the caller under ids prefixed with `{invoke_id}/`,
//! so the same workflow can be invoked more than once without id clashes.
//!
//! The remaining fields of an invoke node are named `node.field` and replace
//! that field of the inlined node. Callers read inlined outputs through a
//! reference to the invoke node whose field is `node.field`; the reference is
//! rewired to the inlined node.

use super::state::{FieldRef, FieldValue, NodeDefinition, WorkflowDefinition};
use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, WorkflowId};
use serde_json::Value;
use std::collections::BTreeSet;

pub const INVOKE_TYPE: &str = "workflows.invoke";

const WORKFLOW_ID_FIELD: &str = "workflow_id";

/// Id of an inlined node inside the invoke node that pulled it in
pub fn scoped_id(invoke: &NodeId, inner: &str) -> NodeId {
    NodeId::new(format!("{}/{}", invoke, inner))
}

/// Flatten `definition` into plain nodes, inlining every invoked workflow.
///
/// `resolve` looks up invoked workflows by id. Ignored nodes are dropped at
/// every level.
pub fn expand_invocations(
    definition: &WorkflowDefinition,
    resolve: &dyn Fn(&WorkflowId) -> EngineResult<Option<WorkflowDefinition>>,
) -> EngineResult<Vec<NodeDefinition>> {
    let mut stack = vec![definition.id.clone()];
    expand_nodes(definition, resolve, &mut stack)
}

fn invalid(workflow_id: &WorkflowId, reason: String) -> EngineError {
    EngineError::InvalidDefinition {
        workflow_id: workflow_id.to_string(),
        reason,
    }
}

// Node ids may contain dots; field names do not
fn split_binding(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once('.')
}

fn expand_nodes(
    definition: &WorkflowDefinition,
    resolve: &dyn Fn(&WorkflowId) -> EngineResult<Option<WorkflowDefinition>>,
    stack: &mut Vec<WorkflowId>,
) -> EngineResult<Vec<NodeDefinition>> {
    let mut expanded = Vec::new();
    let mut invocations = BTreeSet::new();

    for node in definition.nodes.iter().filter(|n| !n.ignored) {
        if node.node_type != INVOKE_TYPE {
            expanded.push(node.clone());
            continue;
        }
        expanded.extend(inline(definition, node, resolve, stack)?);
        invocations.insert(node.id.clone());
    }

    if invocations.is_empty() {
        return Ok(expanded);
    }

    for node in &mut expanded {
        for (field, value) in node.fields.iter_mut() {
            let FieldValue::Ref(r) = value else {
                continue;
            };
            if !invocations.contains(&r.node) {
                continue;
            }
            let Some((inner, inner_field)) = split_binding(&r.field) else {
                return Err(invalid(
                    &definition.id,
                    format!(
                        "field {} of node {} must read invoke node {} as `node.field`",
                        field, node.id, r.node
                    ),
                ));
            };
            *r = FieldRef {
                node: scoped_id(&r.node, inner),
                field: inner_field.to_string(),
            };
        }
    }

    Ok(expanded)
}

fn inline(
    caller: &WorkflowDefinition,
    invoke: &NodeDefinition,
    resolve: &dyn Fn(&WorkflowId) -> EngineResult<Option<WorkflowDefinition>>,
    stack: &mut Vec<WorkflowId>,
) -> EngineResult<Vec<NodeDefinition>> {
    let sub_id = match invoke.fields.get(WORKFLOW_ID_FIELD) {
        Some(FieldValue::Value(Value::String(id))) => WorkflowId::new(id.clone()),
        _ => {
            return Err(invalid(
                &caller.id,
                format!(
                    "invoke node {} needs a literal `{}`",
                    invoke.id, WORKFLOW_ID_FIELD
                ),
            ))
        }
    };
    if stack.contains(&sub_id) {
        return Err(invalid(
            &caller.id,
            format!("node {} invokes {} recursively", invoke.id, sub_id),
        ));
    }
    let sub = resolve(&sub_id)?.ok_or_else(|| {
        invalid(
            &caller.id,
            format!("node {} invokes unknown workflow {}", invoke.id, sub_id),
        )
    })?;

    stack.push(sub_id);
    let nodes = expand_nodes(&sub, resolve, stack);
    stack.pop();
    let mut nodes = nodes?;

    for node in &mut nodes {
        node.id = scoped_id(&invoke.id, node.id.as_str());
        for value in node.fields.values_mut() {
            if let FieldValue::Ref(r) = value {
                r.node = scoped_id(&invoke.id, r.node.as_str());
            }
        }
    }

    for (name, value) in &invoke.fields {
        if name == WORKFLOW_ID_FIELD {
            continue;
        }
        let Some((inner, field)) = split_binding(name) else {
            return Err(invalid(
                &caller.id,
                format!("field {} of invoke node {} is not `node.field`", name, invoke.id),
            ));
        };
        let target_id = scoped_id(&invoke.id, inner);
        let Some(target) = nodes.iter_mut().find(|n| n.id == target_id) else {
            return Err(invalid(
                &caller.id,
                format!(
                    "invoke node {} binds {} but {} has no node {}",
                    invoke.id, name, sub.id, inner
                ),
            ));
        };
        target.fields.insert(field.to_string(), value.clone());
    }

    tracing::debug!(
        "Inlined workflow {} at node {} ({} nodes)",
        sub.id,
        invoke.id,
        nodes.len()
    );
    Ok(nodes)
}
