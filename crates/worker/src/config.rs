use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use veinflow_core::cache::{ResultCache, RunProgress};
use veinflow_core::collaborators::Collaborators;
use veinflow_core::config::EngineConfig;
use veinflow_core::dispatch::Dispatcher;
use veinflow_core::registry::TaskRegistry;
use veinflow_core::storage::{JsonlEventLog, RedbResultCache, RedbWorkflowStore};
use veinflow_core::tasks;
use veinflow_core::workflow::{LocalRunner, Orchestrator, RunControl};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_store_file")]
    pub store_file: String,

    #[serde(default = "default_cache_file")]
    pub cache_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_store_file() -> String {
    "workflows.redb".to_string()
}

fn default_cache_file() -> String {
    "cache.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            store_file: default_store_file(),
            cache_file: default_cache_file(),
        }
    }
}

impl WorkerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.store_file)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.cache_file)
    }
}

/// Components shared by every command
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub event_log: Arc<JsonlEventLog>,
    pub store: Arc<RedbWorkflowStore>,
    pub cache: Arc<RedbResultCache>,
    pub registry: Arc<TaskRegistry>,
    pub control: Arc<RunControl>,
}

impl AppState {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let store = Arc::new(
            RedbWorkflowStore::new(config.store_path())
                .context("Failed to create workflow store")?,
        );

        let cache = Arc::new(
            RedbResultCache::new(config.cache_path()).context("Failed to create result cache")?,
        );

        let collaborators = Collaborators {
            cache: Some(cache.clone() as Arc<dyn ResultCache>),
            ..Default::default()
        };
        let registry = tasks::builtin_registry(
            &collaborators,
            Duration::from_secs(config.engine.cache.default_ttl_secs),
        )
        .context("Failed to build task registry")?;

        Ok(Self {
            config: config.engine.clone(),
            event_log,
            store,
            cache,
            registry: Arc::new(registry),
            control: Arc::new(RunControl::new()),
        })
    }

    /// Publishes run status and finished nodes to the shared result cache
    pub fn progress(&self) -> RunProgress {
        RunProgress::new(
            self.cache.clone(),
            Duration::from_secs(self.config.cache.default_ttl_secs),
        )
    }

    /// Orchestrator executing nodes in this process
    pub fn local_orchestrator(&self) -> Orchestrator {
        let runner = LocalRunner::new(
            self.registry.clone(),
            self.config.retry.clone(),
            self.event_log.clone(),
        );
        Orchestrator::new(
            Arc::new(runner),
            self.event_log.clone(),
            self.control.clone(),
            self.config.orchestrator.clone(),
        )
        .with_repository(self.store.clone())
        .with_progress(self.progress())
    }

    /// Start a worker pool; nodes of an orchestrator built with
    /// [`AppState::queued_orchestrator`] run on it
    pub fn start_dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::start(
            self.config.clone(),
            self.registry.clone(),
            self.control.clone(),
            self.event_log.clone(),
        ))
    }

    pub fn queued_orchestrator(&self, dispatcher: Arc<Dispatcher>) -> Orchestrator {
        Orchestrator::new(
            dispatcher,
            self.event_log.clone(),
            self.control.clone(),
            self.config.orchestrator.clone(),
        )
        .with_repository(self.store.clone())
        .with_progress(self.progress())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use veinflow_core::cache;
    use veinflow_core::storage::WorkflowRepository;
    use veinflow_core::types::{NodeId, NodeStatus, RunId, RunStatus, WorkflowId};
    use veinflow_core::workflow::{WorkflowDefinition, WorkflowState};

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            WorkerConfig::load(&dir.path().join("missing.toml"), dir.path().join("data")).unwrap();

        assert!(dir.path().join("data").exists());
        assert_eq!(config.store_path(), dir.path().join("data/workflows.redb"));
        assert_eq!(config.engine.retry.max_attempts, 4);
        assert_eq!(config.engine.worker.concurrency, 2);
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veinflow.toml");
        std::fs::write(
            &path,
            r#"
[storage]
cache_file = "results.redb"

[engine.retry]
max_attempts = 2
backoff_secs = 5

[engine.worker]
concurrency = 6
"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.cache_path(), dir.path().join("results.redb"));
        assert_eq!(config.storage.event_log_dir, "events");
        assert_eq!(config.engine.retry.max_attempts, 2);
        assert_eq!(config.engine.retry.backoff_secs, 5);
        assert_eq!(config.engine.worker.concurrency, 6);
        assert_eq!(config.engine.orchestrator.max_parallel_nodes, 8);
    }

    #[tokio::test]
    async fn test_local_run_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            WorkerConfig::load(&dir.path().join("none.toml"), dir.path().to_path_buf()).unwrap();
        let app = AppState::new(&config).unwrap();

        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "greeting",
            "nodes": [
                {
                    "id": "compose",
                    "type": "text_processing.template_compose",
                    "fields": {
                        "template": {"value": "Hello {{name}}"},
                        "name": {"value": "Ada"}
                    }
                },
                {
                    "id": "echo",
                    "type": "text_processing.text_in_out",
                    "fields": {
                        "text": {"ref": {"node": "compose", "field": "output"}}
                    }
                }
            ]
        }))
        .unwrap();

        let state = WorkflowState::from_definition(&definition, RunId::new()).unwrap();
        let report = app.local_orchestrator().run(state).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.node_status("echo"), Some(NodeStatus::Done));

        assert_eq!(
            cache::run_status(app.cache.as_ref(), &report.run_id).unwrap(),
            cache::RUN_STATUS_FINISHED
        );
        assert_eq!(
            cache::finished_nodes(app.cache.as_ref(), &report.run_id).unwrap(),
            vec![NodeId::new("compose"), NodeId::new("echo")]
        );

        let stored = app.store.get_run(&report.run_id).unwrap().unwrap();
        assert_eq!(stored.workflow_id, WorkflowId::new("greeting"));
        assert_eq!(
            stored.state.output(&"echo".into(), "output"),
            Some(&json!("Hello Ada"))
        );
    }

    #[test]
    fn test_cache_is_shared_with_another_opener() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            WorkerConfig::load(&dir.path().join("none.toml"), dir.path().to_path_buf()).unwrap();
        let worker = AppState::new(&config).unwrap();
        let reader = RedbResultCache::new(config.cache_path()).unwrap();

        let run_id = RunId::new();
        worker.progress().started(&run_id);
        assert_eq!(
            cache::run_status(&reader, &run_id).unwrap(),
            cache::RUN_STATUS_RUNNING
        );
    }
}
