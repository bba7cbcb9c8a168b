pub mod event_log;
pub mod result_cache;
pub mod workflow_store;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use result_cache::RedbResultCache;
pub use workflow_store::{RedbWorkflowStore, WorkflowRepository};
