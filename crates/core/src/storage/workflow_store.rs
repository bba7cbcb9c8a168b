use crate::error::{EngineError, EngineResult};
use crate::types::{RunId, RunReport, WorkflowId};
use crate::workflow::{WorkflowDefinition, WorkflowState};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const DEFINITIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("definitions");
const STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("states");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Persistence collaborator consumed by the engine.
///
/// The engine never issues storage queries of its own; everything goes
/// through this interface.
pub trait WorkflowRepository: Send + Sync {
    /// Store (or replace) a workflow definition
    fn store_definition(&self, definition: &WorkflowDefinition) -> EngineResult<()>;

    /// Build a fresh run state from the stored definition
    fn load_workflow(&self, workflow_id: &WorkflowId, run_id: RunId) -> EngineResult<WorkflowState>;

    /// Persist a run's state. Rejects states that are not newer than the stored one.
    fn save_workflow(&self, state: &WorkflowState) -> EngineResult<()>;

    fn get_state(&self, run_id: &RunId) -> EngineResult<Option<WorkflowState>>;

    /// Record the final report of a run
    fn record_run(&self, report: &RunReport) -> EngineResult<()>;

    fn get_run(&self, run_id: &RunId) -> EngineResult<Option<RunReport>>;

    fn list_runs(&self) -> EngineResult<Vec<RunReport>>;
}

/// Workflow store backed by redb
#[derive(Clone)]
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _definitions_table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open definitions table")?;
            let _states_table = write_txn
                .open_table(STATES_TABLE)
                .context("Failed to open states table")?;
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table.insert(key, value).context("Failed to insert")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn fetch(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;
        let value = table.get(key).context("Failed to get value")?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }
}

impl WorkflowRepository for RedbWorkflowStore {
    fn store_definition(&self, definition: &WorkflowDefinition) -> EngineResult<()> {
        let value = serde_json::to_vec(definition)?;
        self.put(DEFINITIONS_TABLE, &definition.id.0, &value)?;
        Ok(())
    }

    fn load_workflow(&self, workflow_id: &WorkflowId, run_id: RunId) -> EngineResult<WorkflowState> {
        let bytes = self
            .fetch(DEFINITIONS_TABLE, &workflow_id.0)?
            .ok_or_else(|| EngineError::Storage(format!("Workflow {} not found", workflow_id)))?;
        let definition: WorkflowDefinition = serde_json::from_slice(&bytes)?;

        // Invoked workflows shipped with the definition win over stored ones
        WorkflowState::from_definition_with(&definition, run_id, &|id| {
            if let Some(related) = definition.related_workflows.get(id) {
                return Ok(Some(related.clone()));
            }
            match self.fetch(DEFINITIONS_TABLE, &id.0)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn save_workflow(&self, state: &WorkflowState) -> EngineResult<()> {
        let key = state.run_id.to_string();
        let value = serde_json::to_vec(state)?;

        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(STATES_TABLE)
                .context("Failed to open states table")?;

            let stored_version = {
                let existing = table.get(key.as_str()).context("Failed to get state")?;
                match existing {
                    Some(guard) => {
                        let stored: WorkflowState = serde_json::from_slice(guard.value())?;
                        Some(stored.version)
                    }
                    None => None,
                }
            };

            if let Some(stored) = stored_version {
                if stored >= state.version {
                    return Err(EngineError::StaleVersion {
                        workflow_id: state.workflow_id.0.clone(),
                        stored,
                        attempted: state.version,
                    });
                }
            }

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert state")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_state(&self, run_id: &RunId) -> EngineResult<Option<WorkflowState>> {
        match self.fetch(STATES_TABLE, &run_id.to_string())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record_run(&self, report: &RunReport) -> EngineResult<()> {
        let value = serde_json::to_vec(report)?;
        self.put(RUNS_TABLE, &report.run_id.to_string(), &value)?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> EngineResult<Option<RunReport>> {
        match self.fetch(RUNS_TABLE, &run_id.to_string())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_runs(&self) -> EngineResult<Vec<RunReport>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(RUNS_TABLE)
            .context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: RunReport = serde_json::from_slice(value.value())?;
            runs.push(run);
        }

        // Most recent first
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
