use super::control::RunControl;
use super::dag::WorkflowDag;
use super::runner::{NodeRun, NodeRunner};
use super::state::WorkflowState;
use crate::cache::RunProgress;
use crate::config::OrchestratorConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventLog, EventType};
use crate::storage::WorkflowRepository;
use crate::types::{NodeExecution, NodeId, NodeStatus, RunReport, RunStatus};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;

/// Drives one run from its initial state to a terminal outcome.
///
/// The orchestrator owns the authoritative [`WorkflowState`] of the run.
/// Runners work on snapshots; only the executed node's output is merged back.
pub struct Orchestrator {
    runner: Arc<dyn NodeRunner>,
    event_log: Arc<dyn EventLog>,
    control: Arc<RunControl>,
    repository: Option<Arc<dyn WorkflowRepository>>,
    progress: Option<RunProgress>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn NodeRunner>,
        event_log: Arc<dyn EventLog>,
        control: Arc<RunControl>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runner,
            event_log,
            control,
            repository: None,
            progress: None,
            config,
        }
    }

    /// Persist intermediate states and the final report through `repository`
    pub fn with_repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Publish run status and finished nodes to a result cache
    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Execute a run and return its report.
    ///
    /// Node failures are reported in the returned report. An `Err` means the
    /// run itself could not finish, e.g. a cycle or a storage failure.
    pub async fn run(&self, state: WorkflowState) -> EngineResult<RunReport> {
        let run_id = state.run_id;
        self.control.register(run_id).await;
        if let Some(progress) = &self.progress {
            progress.started(&run_id);
        }

        let result = self.drive(state).await;

        self.control.finish(run_id).await;
        if let Some(progress) = &self.progress {
            progress.finished(&run_id, result.as_ref().ok().map(|report| report.status));
        }
        result
    }

    async fn drive(&self, mut state: WorkflowState) -> EngineResult<RunReport> {
        let run_id = state.run_id;
        let started_at = Utc::now();
        let clock = Instant::now();

        state.validate()?;
        let dag = WorkflowDag::from_state(&state)?;

        tracing::info!(
            "Starting run {} of workflow {} ({} nodes)",
            run_id,
            state.workflow_id,
            dag.node_count()
        );

        self.event_log
            .append(Event::new(
                run_id,
                EventType::RunStarted {
                    workflow_id: state.workflow_id.clone(),
                    node_count: dag.node_count(),
                },
            ))
            .await?;

        let mut executions: BTreeMap<NodeId, NodeExecution> = state
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeExecution::pending(id.clone())))
            .collect();
        let mut done: HashSet<NodeId> = HashSet::new();
        // Completion order, as published to the progress cache
        let mut finished: Vec<NodeId> = Vec::new();
        let mut failed: HashSet<NodeId> = HashSet::new();
        let mut started: HashMap<NodeId, Instant> = HashMap::new();
        let mut in_flight: JoinSet<EngineResult<NodeRun>> = JoinSet::new();
        let mut tasks: HashMap<task::Id, NodeId> = HashMap::new();
        let mut aborted = false;
        let max_parallel = self.config.max_parallel_nodes.max(1);

        loop {
            if !aborted && self.control.is_aborted(run_id).await {
                tracing::warn!("Run {} aborted; no further nodes will be dispatched", run_id);
                aborted = true;
            }

            if !aborted {
                // BTreeMap order gives ascending node ids
                let mut ready = Vec::new();
                for (node_id, execution) in executions.iter() {
                    if matches!(execution.status, NodeStatus::Pending | NodeStatus::Ready)
                        && dag.can_execute(node_id, &done)?
                    {
                        ready.push(node_id.clone());
                    }
                }

                for node_id in ready {
                    let Some(execution) = executions.get_mut(&node_id) else {
                        continue;
                    };
                    if in_flight.len() >= max_parallel {
                        execution.status = NodeStatus::Ready;
                        continue;
                    }

                    // Marked before dispatch so a node never runs twice within a run
                    execution.status = NodeStatus::Running;
                    execution.started_at = Some(Utc::now());
                    started.insert(node_id.clone(), Instant::now());

                    let runner = self.runner.clone();
                    let snapshot = state.clone();
                    let id = node_id.clone();
                    let handle = in_flight.spawn(async move { runner.run_node(snapshot, id).await });
                    tasks.insert(handle.id(), node_id);
                }
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let (task_id, joined) = match joined {
                Ok((task_id, result)) => (task_id, Ok(result)),
                Err(e) => (e.id(), Err(e)),
            };
            let Some(node_id) = tasks.remove(&task_id) else {
                let e = EngineError::Dispatcher(format!("unknown node task {}", task_id));
                in_flight.abort_all();
                return Err(self.fail_run(&state, e, clock).await);
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(EngineError::HandlerPermanentFailure {
                    task: state
                        .nodes
                        .get(&node_id)
                        .map(|n| n.node_type.clone())
                        .unwrap_or_default(),
                    attempts: 1,
                    message: "handler panicked".to_string(),
                }),
                Err(e) => {
                    let e = EngineError::Dispatcher(format!("node {} task lost: {}", node_id, e));
                    in_flight.abort_all();
                    return Err(self.fail_run(&state, e, clock).await);
                }
            };

            let duration_ms = started
                .remove(&node_id)
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or_default();
            let Some(execution) = executions.get_mut(&node_id) else {
                return Err(EngineError::UnknownNode(node_id));
            };
            execution.completed_at = Some(Utc::now());
            execution.duration_ms = Some(duration_ms);

            match result {
                Ok(run) => {
                    state.merge_node(&run.state, &node_id)?;
                    execution.status = NodeStatus::Done;
                    execution.attempts = run.attempts;
                    done.insert(node_id.clone());
                    finished.push(node_id.clone());
                    if let Some(progress) = &self.progress {
                        progress.nodes_finished(&run_id, &finished);
                    }

                    tracing::info!("Node {} completed in {}ms", node_id, duration_ms);
                    self.event_log
                        .append(Event::new(
                            run_id,
                            EventType::NodeCompleted {
                                node_id: node_id.clone(),
                                duration_ms,
                            },
                        ))
                        .await?;

                    if let Some(repository) = &self.repository {
                        repository.save_workflow(&state)?;
                    }
                }
                Err(EngineError::Aborted(_)) => {
                    // Dropped by a worker before the handler started
                    execution.status = NodeStatus::Pending;
                    execution.started_at = None;
                    execution.completed_at = None;
                    execution.duration_ms = None;
                    aborted = true;
                }
                Err(e) if e.is_run_fatal() => {
                    in_flight.abort_all();
                    return Err(self.fail_run(&state, e, clock).await);
                }
                Err(e) => {
                    tracing::error!("Node {} failed: {}", node_id, e);
                    execution.status = NodeStatus::Failed;
                    execution.error = Some(e.to_string());
                    match &e {
                        EngineError::HandlerPermanentFailure { attempts, .. } => {
                            execution.attempts = *attempts;
                        }
                        // The handler never ran, so no attempt was logged for it
                        _ => {
                            self.event_log
                                .append(Event::new(
                                    run_id,
                                    EventType::NodeFailed {
                                        node_id: node_id.clone(),
                                        error: e.to_string(),
                                        attempt: 0,
                                        will_retry: false,
                                    },
                                ))
                                .await?;
                        }
                    }
                    failed.insert(node_id);
                }
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        let status = if aborted {
            self.event_log
                .append(Event::new(
                    run_id,
                    EventType::RunAborted {
                        reason: "Abort requested".to_string(),
                    },
                ))
                .await?;
            for execution in executions.values_mut() {
                if execution.status == NodeStatus::Ready {
                    execution.status = NodeStatus::Pending;
                }
            }
            RunStatus::Aborted
        } else {
            let mut unresolved = Vec::new();
            for (node_id, execution) in executions.iter_mut() {
                if execution.status != NodeStatus::Pending {
                    continue;
                }
                let blocked_by = dag.failed_ancestors(node_id, &failed)?;
                if blocked_by.is_empty() {
                    unresolved.push(node_id.clone());
                    continue;
                }

                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::NodeUnreachable {
                            node_id: node_id.clone(),
                            blocked_by: blocked_by.clone(),
                        },
                    ))
                    .await?;
                execution.blocked_by = blocked_by;
            }

            if !unresolved.is_empty() {
                let e = EngineError::GraphCycleOrUnresolvableDependency {
                    pending: unresolved,
                };
                return Err(self.fail_run(&state, e, clock).await);
            }

            let unreachable: Vec<NodeId> = executions
                .values()
                .filter(|e| e.is_unreachable())
                .map(|e| e.node_id.clone())
                .collect();

            if failed.is_empty() && unreachable.is_empty() {
                self.event_log
                    .append(Event::new(run_id, EventType::RunCompleted { duration_ms }))
                    .await?;
                RunStatus::Completed
            } else {
                let mut failed: Vec<NodeId> = failed.into_iter().collect();
                failed.sort();
                tracing::warn!(
                    "Run {} partially failed: failed={:?}, unreachable={:?}",
                    run_id,
                    failed,
                    unreachable
                );
                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::RunPartiallyFailed {
                            failed,
                            unreachable,
                            duration_ms,
                        },
                    ))
                    .await?;
                RunStatus::PartiallyFailed
            }
        };

        tracing::info!("Run {} finished: {:?} in {}ms", run_id, status, duration_ms);

        let report = RunReport {
            run_id,
            workflow_id: state.workflow_id.clone(),
            status,
            started_at,
            completed_at: Some(Utc::now()),
            nodes: executions,
            state,
        };

        if let Some(repository) = &self.repository {
            repository.record_run(&report)?;
        }

        Ok(report)
    }

    async fn fail_run(&self, state: &WorkflowState, error: EngineError, clock: Instant) -> EngineError {
        tracing::error!("Run {} failed: {}", state.run_id, error);
        let event = Event::new(
            state.run_id,
            EventType::RunFailed {
                error: error.to_string(),
                duration_ms: clock.elapsed().as_millis() as u64,
            },
        );
        if let Err(e) = self.event_log.append(event).await {
            tracing::warn!("Failed to record failure of run {}: {:#}", state.run_id, e);
        }
        error
    }
}
