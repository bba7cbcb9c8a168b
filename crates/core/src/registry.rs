//! Catalog of node-type handlers and auxiliary jobs.
//!
//! Each handler module exposes a `register` function that adds its tasks
//! under the module's category name. The registry is built once at process
//! start and is read-only afterwards; adding a node type never touches the
//! dispatcher.

use crate::error::{EngineError, EngineResult};
use crate::workflow::contract::{JobTask, NodeTask};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

static GLOBAL_REGISTRY: OnceLock<Arc<TaskRegistry>> = OnceLock::new();

/// Callable behind a registration entry
#[derive(Clone)]
pub enum Handler {
    Node(Arc<dyn NodeTask>),
    Job(Arc<dyn JobTask>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Node(_) => f.write_str("Handler::Node"),
            Handler::Job(_) => f.write_str("Handler::Job"),
        }
    }
}

/// One registered task
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub category: String,
    pub name: String,
    pub handler: Handler,
    /// Whether the dispatch layer applies the retry policy (external I/O)
    pub retryable: bool,
}

impl TaskEntry {
    pub fn task_type(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }
}

/// Split `category.name`
pub fn parse_task_type(task_type: &str) -> EngineResult<(&str, &str)> {
    match task_type.split_once('.') {
        Some((category, name)) if !category.is_empty() && !name.is_empty() => Ok((category, name)),
        _ => Err(EngineError::InvalidTaskType(task_type.to_string())),
    }
}

/// Collects registrations before the registry is frozen
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<(String, String), TaskEntry>,
    duplicates: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start registering tasks for one handler module
    pub fn category(&mut self, category: impl Into<String>) -> CategoryRegistrar<'_> {
        CategoryRegistrar {
            builder: self,
            category: category.into(),
        }
    }

    fn insert(&mut self, entry: TaskEntry) {
        let key = (entry.category.clone(), entry.name.clone());
        if self.entries.contains_key(&key) {
            self.duplicates.push(entry.task_type());
            return;
        }
        self.entries.insert(key, entry);
    }

    /// Freeze the registry. Duplicate registrations are a configuration error.
    pub fn build(self) -> EngineResult<TaskRegistry> {
        if let Some(duplicate) = self.duplicates.into_iter().next() {
            return Err(EngineError::DuplicateTask(duplicate));
        }
        tracing::debug!("Task registry built with {} entries", self.entries.len());
        Ok(TaskRegistry {
            entries: self.entries,
        })
    }
}

/// Registration scope for a single category
pub struct CategoryRegistrar<'a> {
    builder: &'a mut RegistryBuilder,
    category: String,
}

impl CategoryRegistrar<'_> {
    /// Pure/local node task; never retried
    pub fn local(&mut self, name: &str, task: impl NodeTask + 'static) -> &mut Self {
        self.add(name, Handler::Node(Arc::new(task)), false)
    }

    /// Node task doing external I/O; subject to the retry policy
    pub fn retryable(&mut self, name: &str, task: impl NodeTask + 'static) -> &mut Self {
        self.add(name, Handler::Node(Arc::new(task)), true)
    }

    /// Auxiliary job; subject to the retry policy
    pub fn job(&mut self, name: &str, task: impl JobTask + 'static) -> &mut Self {
        self.add(name, Handler::Job(Arc::new(task)), true)
    }

    fn add(&mut self, name: &str, handler: Handler, retryable: bool) -> &mut Self {
        self.builder.insert(TaskEntry {
            category: self.category.clone(),
            name: name.to_string(),
            handler,
            retryable,
        });
        self
    }
}

/// Immutable task catalog
#[derive(Debug)]
pub struct TaskRegistry {
    entries: BTreeMap<(String, String), TaskEntry>,
}

impl TaskRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn resolve(&self, category: &str, name: &str) -> EngineResult<&TaskEntry> {
        self.entries
            .get(&(category.to_string(), name.to_string()))
            .ok_or_else(|| EngineError::UnknownTaskType {
                task_type: format!("{}.{}", category, name),
            })
    }

    /// Resolve a `category.name` type string
    pub fn resolve_type(&self, task_type: &str) -> EngineResult<&TaskEntry> {
        let (category, name) = parse_task_type(task_type).map_err(|_| {
            EngineError::UnknownTaskType {
                task_type: task_type.to_string(),
            }
        })?;
        self.resolve(category, name)
    }

    /// Registered type strings in ascending order
    pub fn task_types(&self) -> Vec<String> {
        self.entries.values().map(|e| e.task_type()).collect()
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.entries.keys().map(|(c, _)| c.as_str()).collect();
        categories.dedup();
        categories
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish the process-wide registry. May only happen once per process.
    pub fn install(registry: Arc<TaskRegistry>) -> EngineResult<Arc<TaskRegistry>> {
        GLOBAL_REGISTRY
            .set(registry.clone())
            .map_err(|_| EngineError::RegistryAlreadyInstalled)?;
        tracing::info!("Installed task registry ({} tasks)", registry.len());
        Ok(registry)
    }

    pub fn global() -> Option<Arc<TaskRegistry>> {
        GLOBAL_REGISTRY.get().cloned()
    }
}
