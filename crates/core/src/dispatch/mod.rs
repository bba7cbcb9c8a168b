//! Queue-based dispatch with bounded retries.
//!
//! A pool of workers pulls [`WorkItem`]s from one shared queue. Transient
//! handler failures are re-enqueued after the item's backoff until its
//! attempt budget is spent; the final outcome is delivered to the
//! submitter's [`WorkHandle`].

mod item;

pub use item::{WorkHandle, WorkId, WorkItem, WorkKind, WorkOutcome, WorkState};

use crate::config::{EngineConfig, RetryDecision};
use crate::error::{EngineError, EngineResult, TaskError};
use crate::events::{Event, EventLog, EventType};
use crate::registry::{Handler, TaskRegistry};
use crate::types::RunId;
use crate::workflow::runner::{attempt_node, AttemptError, LocalRunner, NodeRun, NodeRunner};
use crate::workflow::{Orchestrator, RunControl, WorkflowState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Status of live work items plus a bounded record of finished ones
#[derive(Default)]
struct StatusBook {
    live: HashMap<WorkId, WorkState>,
    finished: HashMap<WorkId, WorkState>,
    // Oldest first
    finished_order: VecDeque<WorkId>,
    retention: usize,
}

impl StatusBook {
    fn new(retention: usize) -> Self {
        Self {
            retention,
            ..Default::default()
        }
    }

    fn get(&self, id: &WorkId) -> Option<WorkState> {
        self.live
            .get(id)
            .or_else(|| self.finished.get(id))
            .copied()
    }

    fn set(&mut self, id: WorkId, next: WorkState) {
        if let Some(current) = self.finished.get(&id) {
            tracing::warn!("Work item {} is already {:?}; ignoring {:?}", id, current, next);
            return;
        }
        if !next.is_terminal() {
            self.live.insert(id, next);
            return;
        }

        self.live.remove(&id);
        self.finished.insert(id, next);
        self.finished_order.push_back(id);
        while self.finished_order.len() > self.retention {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

struct Envelope {
    item: WorkItem,
    reply: oneshot::Sender<EngineResult<WorkOutcome>>,
}

/// State shared by the dispatcher front-end and its workers
struct Shared {
    queue: mpsc::Sender<Envelope>,
    registry: Arc<TaskRegistry>,
    config: EngineConfig,
    control: Arc<RunControl>,
    event_log: Arc<dyn EventLog>,
    statuses: RwLock<StatusBook>,
}

/// Worker pool over a shared in-process queue
pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `config.worker.concurrency` workers. Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        registry: Arc<TaskRegistry>,
        control: Arc<RunControl>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let concurrency = config.worker.concurrency.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(config.worker.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (shutdown_tx, _) = watch::channel(false);
        let statuses = StatusBook::new(config.worker.status_retention.max(1));

        let shared = Arc::new(Shared {
            queue: queue_tx,
            registry,
            config,
            control,
            event_log,
            statuses: RwLock::new(statuses),
        });

        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    shared.clone(),
                    queue_rx.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        tracing::info!("Dispatcher started with {} workers", concurrency);

        Self {
            shared,
            shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn control(&self) -> Arc<RunControl> {
        self.shared.control.clone()
    }

    /// Enqueue an item and return a handle to its eventual outcome
    pub async fn submit(&self, item: WorkItem) -> EngineResult<WorkHandle> {
        let id = item.id;
        let (reply, rx) = oneshot::channel();

        tracing::debug!("Submitting {} as work item {}", item.label(), id);
        self.shared.set_state(id, WorkState::Queued).await;
        self.shared
            .queue
            .send(Envelope { item, reply })
            .await
            .map_err(|_| EngineError::Dispatcher("work queue is closed".to_string()))?;

        Ok(WorkHandle::new(id, rx))
    }

    /// Enqueue an item and wait until it succeeds or fails for good
    pub async fn submit_and_wait(&self, item: WorkItem) -> EngineResult<WorkOutcome> {
        self.submit(item).await?.wait().await
    }

    /// Submit a whole run; the worker orchestrates it with inline retries
    pub async fn submit_workflow(&self, state: WorkflowState) -> EngineResult<WorkHandle> {
        let item = WorkItem::workflow(state, &self.shared.config.retry);
        self.submit(item).await
    }

    /// Submit an auxiliary job by `category.name`
    pub async fn submit_job(
        &self,
        task_type: &str,
        args: serde_json::Value,
    ) -> EngineResult<WorkHandle> {
        let item = WorkItem::job(task_type, args, &self.shared.config.retry);
        self.submit(item).await
    }

    /// Current state of a work item. Finished items are forgotten once
    /// `status_retention` newer items have finished.
    pub async fn status(&self, id: WorkId) -> Option<WorkState> {
        self.shared.statuses.read().await.get(&id)
    }

    /// Number of submitted items that have not finished yet
    pub async fn pending_items(&self) -> usize {
        self.shared.statuses.read().await.live.len()
    }

    /// Stop the workers after their current item
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}

#[async_trait::async_trait]
impl NodeRunner for Dispatcher {
    async fn run_node(
        &self,
        state: WorkflowState,
        node_id: crate::types::NodeId,
    ) -> EngineResult<NodeRun> {
        let item = WorkItem::node(state, node_id, &self.shared.config.retry);
        match self.submit_and_wait(item).await? {
            WorkOutcome::Node { state, attempts } => Ok(NodeRun { state, attempts }),
            _ => Err(EngineError::Dispatcher(
                "node item produced a non-node outcome".to_string(),
            )),
        }
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Worker {} started", worker);
    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => break,
            envelope = async { queue.lock().await.recv().await } => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        shared.process(worker, envelope).await;
    }
    tracing::debug!("Worker {} stopped", worker);
}

impl Shared {
    async fn set_state(&self, id: WorkId, next: WorkState) {
        self.statuses.write().await.set(id, next);
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to append event for run {}: {:#}", run_id, e);
        }
    }

    async fn process(self: &Arc<Self>, worker: usize, envelope: Envelope) {
        let Envelope { item, reply } = envelope;
        self.set_state(item.id, WorkState::Running).await;
        tracing::debug!(
            "Worker {} executing {} (attempt {}/{})",
            worker,
            item.label(),
            item.attempt,
            item.max_attempts
        );

        let (error, retryable) = match self.execute(&item).await {
            Ok(outcome) => {
                self.set_state(item.id, WorkState::Succeeded).await;
                let _ = reply.send(Ok(outcome));
                return;
            }
            Err(AttemptError::Engine(e)) => {
                tracing::error!("{} failed: {}", item.label(), e);
                self.set_state(item.id, WorkState::FailedPermanently).await;
                let _ = reply.send(Err(e));
                return;
            }
            Err(AttemptError::Task { error, retryable }) => (error, retryable),
        };

        let policy = item.policy(self.config.retry.task_timeout_secs);
        let decision = policy.decide(item.attempt, &error, retryable);
        let will_retry = matches!(decision, RetryDecision::RetryAfter(_));

        if let WorkKind::NodeExecution { state, node_id } = &item.kind {
            self.emit(
                state.run_id,
                EventType::NodeFailed {
                    node_id: node_id.clone(),
                    error: error.message().to_string(),
                    attempt: item.attempt,
                    will_retry,
                },
            )
            .await;
        }

        match decision {
            RetryDecision::RetryAfter(delay) => {
                let failure = EngineError::HandlerTransientFailure {
                    task: self.task_type(&item),
                    attempt: item.attempt,
                    message: error.message().to_string(),
                };
                tracing::warn!("{}; re-enqueueing in {:?}", failure, delay);
                self.set_state(item.id, WorkState::FailedRetrying).await;
                self.schedule_retry(item, reply, delay);
            }
            RetryDecision::GiveUp => {
                self.set_state(item.id, WorkState::FailedPermanently).await;
                let _ = reply.send(self.give_up(&item, error));
            }
        }
    }

    fn task_type(&self, item: &WorkItem) -> String {
        match &item.kind {
            WorkKind::NodeExecution { state, node_id } => state
                .nodes
                .get(node_id)
                .map(|n| n.node_type.clone())
                .unwrap_or_default(),
            WorkKind::WorkflowRun { state } => format!("workflow {}", state.workflow_id),
            WorkKind::Job { task_type, .. } => task_type.clone(),
        }
    }

    fn give_up(&self, item: &WorkItem, error: TaskError) -> EngineResult<WorkOutcome> {
        let failure = EngineError::HandlerPermanentFailure {
            task: self.task_type(item),
            attempts: item.attempt,
            message: error.message().to_string(),
        };
        tracing::error!("{}", failure);

        match item.kind {
            // Jobs report permanent failure as an absent result
            WorkKind::Job { .. } => Ok(WorkOutcome::Job(None)),
            _ => Err(failure),
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        mut item: WorkItem,
        reply: oneshot::Sender<EngineResult<WorkOutcome>>,
        delay: Duration,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            item.attempt += 1;
            let id = item.id;
            shared.set_state(id, WorkState::Retried).await;

            if let Err(mpsc::error::SendError(envelope)) =
                shared.queue.send(Envelope { item, reply }).await
            {
                shared.set_state(id, WorkState::FailedPermanently).await;
                let _ = envelope.reply.send(Err(EngineError::Dispatcher(
                    "work queue closed before retry".to_string(),
                )));
            }
        });
    }

    async fn execute(&self, item: &WorkItem) -> Result<WorkOutcome, AttemptError> {
        let time_limit = Duration::from_secs(self.config.retry.task_timeout_secs);

        match &item.kind {
            WorkKind::NodeExecution { state, node_id } => {
                if self.control.is_aborted(state.run_id).await {
                    return Err(AttemptError::Engine(EngineError::Aborted(state.run_id)));
                }

                self.emit(
                    state.run_id,
                    EventType::NodeStarted {
                        node_id: node_id.clone(),
                        task_type: self.task_type(item),
                        attempt: item.attempt,
                    },
                )
                .await;

                let next = attempt_node(&self.registry, time_limit, state, node_id).await?;
                Ok(WorkOutcome::Node {
                    state: next,
                    attempts: item.attempt,
                })
            }
            WorkKind::WorkflowRun { state } => {
                let runner = Arc::new(LocalRunner::new(
                    self.registry.clone(),
                    self.config.retry.clone(),
                    self.event_log.clone(),
                ));
                let orchestrator = Orchestrator::new(
                    runner,
                    self.event_log.clone(),
                    self.control.clone(),
                    self.config.orchestrator.clone(),
                );
                orchestrator
                    .run(state.clone())
                    .await
                    .map(WorkOutcome::Run)
                    .map_err(AttemptError::Engine)
            }
            WorkKind::Job { task_type, args } => {
                let entry = self
                    .registry
                    .resolve_type(task_type)
                    .map_err(AttemptError::Engine)?;
                let Handler::Job(job) = &entry.handler else {
                    return Err(AttemptError::Engine(EngineError::UnknownTaskType {
                        task_type: task_type.clone(),
                    }));
                };

                match tokio::time::timeout(time_limit, job.run(args.clone())).await {
                    Ok(Ok(value)) => Ok(WorkOutcome::Job(Some(value))),
                    Ok(Err(error)) => Err(AttemptError::Task {
                        error,
                        retryable: entry.retryable,
                    }),
                    Err(_) => Err(AttemptError::Task {
                        error: TaskError::retry(format!(
                            "timed out after {} seconds",
                            time_limit.as_secs()
                        )),
                        retryable: entry.retryable,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, RetryPolicy};
    use crate::error::TaskResult;
    use crate::storage::MemoryEventLog;
    use crate::types::{NodeId, NodeStatus, RunStatus, WorkflowId};
    use crate::workflow::contract::{FnTask, JobTask, NodeInput, NodeOutput};
    use crate::workflow::state::{FieldValue, NodeState};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait::async_trait]
    impl JobTask for Flaky {
        async fn run(&self, args: Value) -> TaskResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                return Err(TaskError::retry("vector index unavailable"));
            }
            Ok(json!({ "echo": args, "calls": n }))
        }
    }

    fn engine_config(max_attempts: u32) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry = RetryPolicy::new(max_attempts, 60);
        config
    }

    fn start(registry: TaskRegistry, config: EngineConfig) -> (Dispatcher, Arc<MemoryEventLog>) {
        let log = Arc::new(MemoryEventLog::new());
        let dispatcher = Dispatcher::start(
            config,
            Arc::new(registry),
            Arc::new(RunControl::new()),
            log.clone(),
        );
        (dispatcher, log)
    }

    fn flaky_node_registry(calls: Arc<AtomicU32>, fail_times: u32) -> TaskRegistry {
        let mut builder = TaskRegistry::builder();
        builder.category("vector_db").retryable(
            "add_data",
            FnTask(move |input: NodeInput| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= fail_times {
                        return Err(TaskError::retry("connection refused"));
                    }
                    TaskResult::Ok(NodeOutput::single(json!(input.external_id(0).0)))
                }
            }),
        );
        builder.category("text_processing").local(
            "text_in_out",
            FnTask(|input: NodeInput| async move {
                TaskResult::Ok(NodeOutput::single(input.get("text").cloned().unwrap_or_default()))
            }),
        );
        builder.build().unwrap()
    }

    fn one_node_state() -> WorkflowState {
        WorkflowState::new(WorkflowId::new("wf"), RunId::new()).with_node(
            NodeState::new("store", "vector_db.add_data")
                .with_field("text", FieldValue::literal("chunk")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let (dispatcher, log) =
            start(flaky_node_registry(calls.clone(), u32::MAX), engine_config(3));

        let state = one_node_state();
        let run_id = state.run_id;
        let item = WorkItem::node(state, NodeId::new("store"), &dispatcher.config().retry);
        let id = item.id;

        let err = dispatcher.submit_and_wait(item).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::HandlerPermanentFailure { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.status(id).await, Some(WorkState::FailedPermanently));

        let failures: Vec<bool> = log
            .get_run_events(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.event_type {
                EventType::NodeFailed { will_retry, .. } => Some(will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![true, true, false]);

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_keeps_external_id() {
        let calls = Arc::new(AtomicU32::new(0));
        let (dispatcher, _log) = start(flaky_node_registry(calls.clone(), 1), engine_config(4));

        let state = one_node_state();
        let expected =
            crate::types::ExternalId::derive(&[&state.run_id.to_string(), "store", "0"]).0;
        let item = WorkItem::node(state, NodeId::new("store"), &dispatcher.config().retry);
        let id = item.id;

        let outcome = dispatcher.submit_and_wait(item).await.unwrap();
        let WorkOutcome::Node { state, attempts } = outcome else {
            panic!("expected a node outcome");
        };
        assert_eq!(attempts, 2);
        assert_eq!(
            state.output(&NodeId::new("store"), "output"),
            Some(&json!(expected))
        );
        assert_eq!(dispatcher.status(id).await, Some(WorkState::Succeeded));

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_permanent_failure_is_absent_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut builder = TaskRegistry::builder();
        builder.category("background").job(
            "upsert_point",
            Flaky {
                calls: calls.clone(),
                fail_times: u32::MAX,
            },
        );
        let (dispatcher, _log) = start(builder.build().unwrap(), engine_config(2));

        let handle = dispatcher
            .submit_job("background.upsert_point", json!({"id": 1}))
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        assert!(matches!(outcome, WorkOutcome::Job(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_success_after_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut builder = TaskRegistry::builder();
        builder.category("background").job(
            "summarize_title",
            Flaky {
                calls: calls.clone(),
                fail_times: 1,
            },
        );
        let (dispatcher, _log) = start(builder.build().unwrap(), engine_config(4));

        let outcome = dispatcher
            .submit_and_wait(WorkItem::job(
                "background.summarize_title",
                json!("hi"),
                &RetryPolicy::new(4, 5),
            ))
            .await
            .unwrap();

        match outcome {
            WorkOutcome::Job(Some(value)) => assert_eq!(value["calls"], json!(2)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_an_error() {
        let (dispatcher, _log) = start(TaskRegistry::builder().build().unwrap(), engine_config(4));

        let err = dispatcher
            .submit_and_wait(WorkItem::job("background.nope", Value::Null, &RetryPolicy::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTaskType { .. }));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_skips_nodes_of_aborted_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let (dispatcher, _log) = start(flaky_node_registry(calls.clone(), 0), engine_config(4));

        let state = one_node_state();
        dispatcher.control().register(state.run_id).await;
        dispatcher.control().abort(state.run_id).await;

        let err = dispatcher
            .submit_and_wait(WorkItem::node(
                state,
                NodeId::new("store"),
                &RetryPolicy::default(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Aborted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestrator_over_the_queue() {
        let calls = Arc::new(AtomicU32::new(0));
        let (dispatcher, log) = start(flaky_node_registry(calls.clone(), 1), engine_config(4));
        let dispatcher = Arc::new(dispatcher);

        let state = one_node_state().with_node(
            NodeState::new("echo", "text_processing.text_in_out")
                .with_field("text", FieldValue::reference("store", "output")),
        );
        let orchestrator = Orchestrator::new(
            dispatcher.clone(),
            log,
            dispatcher.control(),
            OrchestratorConfig::default(),
        );

        let report = orchestrator.run(state).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.nodes[&NodeId::new("store")].attempts, 2);
        assert_eq!(report.node_status("echo"), Some(NodeStatus::Done));
        assert_eq!(
            report.state.output(&NodeId::new("echo"), "output"),
            report.state.output(&NodeId::new("store"), "output")
        );

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_workflow_run_item() {
        let (dispatcher, _log) =
            start(flaky_node_registry(Arc::new(AtomicU32::new(0)), 0), engine_config(4));

        let state = WorkflowState::new(WorkflowId::new("wf"), RunId::new()).with_node(
            NodeState::new("a", "text_processing.text_in_out")
                .with_field("text", FieldValue::literal("queued run")),
        );
        let outcome = dispatcher
            .submit_workflow(state)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let WorkOutcome::Run(report) = outcome else {
            panic!("expected a run report");
        };
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(
            report.state.output(&NodeId::new("a"), "output"),
            Some(&json!("queued run"))
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_statuses_are_bounded() {
        let mut builder = TaskRegistry::builder();
        builder.category("background").job(
            "summarize_title",
            Flaky {
                calls: Arc::new(AtomicU32::new(0)),
                fail_times: 0,
            },
        );
        let mut config = engine_config(4);
        config.worker.status_retention = 8;
        let (dispatcher, _log) = start(builder.build().unwrap(), config);

        let mut ids = Vec::new();
        for i in 0..20 {
            let handle = dispatcher
                .submit_job("background.summarize_title", json!(i))
                .await
                .unwrap();
            ids.push(handle.id());
            handle.wait().await.unwrap();
        }

        assert_eq!(dispatcher.pending_items().await, 0);
        assert_eq!(dispatcher.status(ids[0]).await, None);
        assert_eq!(dispatcher.status(ids[11]).await, None);
        for id in &ids[12..] {
            assert_eq!(dispatcher.status(*id).await, Some(WorkState::Succeeded));
        }
        dispatcher.shutdown().await;
    }
}
