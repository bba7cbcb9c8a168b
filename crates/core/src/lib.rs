// Core of the veinflow workflow execution engine

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod registry;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod workflow;

pub use error::{EngineError, EngineResult, TaskError, TaskResult};
pub use types::*;
