pub mod batch;
pub mod contract;
pub mod control;
pub mod dag;
pub mod invoke;
pub mod orchestrator;
pub mod runner;
pub mod state;

pub use batch::Batch;
pub use contract::{execute_node_task, FnTask, JobTask, NodeInput, NodeOutput, NodeTask, NodeTaskError};
pub use control::RunControl;
pub use dag::WorkflowDag;
pub use orchestrator::Orchestrator;
pub use runner::{LocalRunner, NodeRun, NodeRunner};
pub use state::{FieldRef, FieldValue, NodeDefinition, NodeState, WorkflowDefinition, WorkflowState};
