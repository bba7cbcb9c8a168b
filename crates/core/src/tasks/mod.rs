//! Built-in node handlers, one module per category.
//!
//! Pure handlers are registered as local tasks; handlers calling external
//! collaborators are registered as retryable.

pub mod control_flows;
pub mod file_processing;
pub mod llms;
pub mod media_processing;
pub mod text_processing;
pub mod vector_db;

use crate::collaborators::Collaborators;
use crate::error::EngineResult;
use crate::registry::{RegistryBuilder, TaskRegistry};
use std::time::Duration;

/// Register every built-in node handler
pub fn register_builtin(builder: &mut RegistryBuilder, collaborators: &Collaborators) {
    text_processing::register(builder);
    file_processing::register(builder);
    control_flows::register(builder);
    llms::register(builder, collaborators);
    vector_db::register(builder, collaborators);
    media_processing::register(builder, collaborators);
}

/// Registry holding the built-in handlers and the background jobs
pub fn builtin_registry(
    collaborators: &Collaborators,
    cache_ttl: Duration,
) -> EngineResult<TaskRegistry> {
    let mut builder = TaskRegistry::builder();
    register_builtin(&mut builder, collaborators);
    crate::jobs::register(&mut builder, collaborators, cache_ttl);
    builder.build()
}

/// Handler input with the given fields, for handler unit tests
#[cfg(test)]
pub(crate) fn test_input(fields: serde_json::Value) -> crate::workflow::NodeInput {
    use crate::types::{NodeId, RunId, WorkflowId};

    let fields = match fields {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Default::default(),
    };
    crate::workflow::NodeInput {
        run_id: RunId::new(),
        workflow_id: WorkflowId::new("wf-test"),
        node_id: NodeId::new("node"),
        node_type: "test.node".to_string(),
        fields,
    }
}
