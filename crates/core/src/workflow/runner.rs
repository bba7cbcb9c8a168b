use super::contract::{execute_node_task, NodeTaskError};
use super::state::WorkflowState;
use crate::config::{RetryDecision, RetryPolicy};
use crate::error::{EngineError, EngineResult, TaskError};
use crate::events::{Event, EventLog, EventType};
use crate::registry::{Handler, TaskRegistry};
use crate::types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Successful execution of one node
#[derive(Debug, Clone)]
pub struct NodeRun {
    /// Snapshot returned by the handler invocation
    pub state: WorkflowState,
    pub attempts: u32,
}

/// Executes a single node, locally or through the queue
#[async_trait::async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run_node(&self, state: WorkflowState, node_id: NodeId) -> EngineResult<NodeRun>;
}

/// Failure of a single attempt
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// The handler never ran
    Engine(EngineError),
    Task { error: TaskError, retryable: bool },
}

/// One attempt at a node: resolve the handler, run it under the time limit.
pub(crate) async fn attempt_node(
    registry: &TaskRegistry,
    time_limit: Duration,
    state: &WorkflowState,
    node_id: &NodeId,
) -> Result<WorkflowState, AttemptError> {
    let node = state.node(node_id).map_err(AttemptError::Engine)?;
    let entry = registry
        .resolve_type(&node.node_type)
        .map_err(AttemptError::Engine)?;
    let Handler::Node(task) = &entry.handler else {
        return Err(AttemptError::Engine(EngineError::UnknownTaskType {
            task_type: node.node_type.clone(),
        }));
    };

    match timeout(time_limit, execute_node_task(task.as_ref(), state, node_id)).await {
        Ok(Ok(next)) => Ok(next),
        Ok(Err(NodeTaskError::Engine(e))) => Err(AttemptError::Engine(e)),
        Ok(Err(NodeTaskError::Task(error))) => Err(AttemptError::Task {
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

/// Runs nodes in the current process, retrying transient failures inline
pub struct LocalRunner {
    registry: Arc<TaskRegistry>,
    policy: RetryPolicy,
    event_log: Arc<dyn EventLog>,
}

impl LocalRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        policy: RetryPolicy,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            policy,
            event_log,
        }
    }
}

#[async_trait::async_trait]
impl NodeRunner for LocalRunner {
    async fn run_node(&self, state: WorkflowState, node_id: NodeId) -> EngineResult<NodeRun> {
        let task_type = state.node(&node_id)?.node_type.clone();
        self.registry.resolve_type(&task_type)?;

        let mut attempt = 1;
        loop {
            tracing::debug!(
                "Executing node {} ({}) attempt {} for run {}",
                node_id,
                task_type,
                attempt,
                state.run_id
            );

            self.event_log
                .append(Event::new(
                    state.run_id,
                    EventType::NodeStarted {
                        node_id: node_id.clone(),
                        task_type: task_type.clone(),
                        attempt,
                    },
                ))
                .await?;

            let (error, retryable) =
                match attempt_node(&self.registry, self.policy.task_timeout(), &state, &node_id)
                    .await
                {
                    Ok(next) => {
                        return Ok(NodeRun {
                            state: next,
                            attempts: attempt,
                        })
                    }
                    Err(AttemptError::Engine(e)) => return Err(e),
                    Err(AttemptError::Task { error, retryable }) => (error, retryable),
                };

            let decision = self.policy.decide(attempt, &error, retryable);
            let will_retry = matches!(decision, RetryDecision::RetryAfter(_));

            self.event_log
                .append(Event::new(
                    state.run_id,
                    EventType::NodeFailed {
                        node_id: node_id.clone(),
                        error: error.message().to_string(),
                        attempt,
                        will_retry,
                    },
                ))
                .await?;

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    let failure = EngineError::HandlerTransientFailure {
                        task: task_type.clone(),
                        attempt,
                        message: error.message().to_string(),
                    };
                    tracing::warn!("{}; retrying node {} in {:?}", failure, node_id, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    return Err(EngineError::HandlerPermanentFailure {
                        task: task_type,
                        attempts: attempt,
                        message: error.message().to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskResult;
    use crate::storage::MemoryEventLog;
    use crate::types::{RunId, WorkflowId};
    use crate::workflow::contract::{FnTask, NodeInput, NodeOutput};
    use crate::workflow::state::{FieldValue, NodeState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn single_node_state(node_type: &str) -> WorkflowState {
        WorkflowState::new(WorkflowId::new("wf"), RunId::new()).with_node(
            NodeState::new("a", node_type).with_field("text", FieldValue::literal("hi")),
        )
    }

    fn flaky_registry(calls: Arc<AtomicU32>, fail_times: u32, retryable: bool) -> TaskRegistry {
        let task = FnTask(move |_input: NodeInput| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_times {
                    TaskResult::Err(TaskError::retry("upstream unavailable"))
                } else {
                    Ok(NodeOutput::single(json!(n)))
                }
            }
        });

        let mut builder = TaskRegistry::builder();
        if retryable {
            builder.category("llms").retryable("chat", task);
        } else {
            builder.category("llms").local("chat", task);
        }
        builder.build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let log = Arc::new(MemoryEventLog::new());
        let runner = LocalRunner::new(
            Arc::new(flaky_registry(calls.clone(), 2, true)),
            RetryPolicy::new(4, 60),
            log.clone(),
        );

        let state = single_node_state("llms.chat");
        let run = runner
            .run_node(state.clone(), NodeId::new("a"))
            .await
            .unwrap();

        assert_eq!(run.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.state.output(&NodeId::new("a"), "output"), Some(&json!(3)));

        let events = log.get_run_events(state.run_id).await.unwrap();
        let retries = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::NodeFailed { will_retry: true, .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = LocalRunner::new(
            Arc::new(flaky_registry(calls.clone(), u32::MAX, true)),
            RetryPolicy::new(3, 60),
            Arc::new(MemoryEventLog::new()),
        );

        let err = runner
            .run_node(single_node_state("llms.chat"), NodeId::new("a"))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            EngineError::HandlerPermanentFailure { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_local_tasks_never_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = LocalRunner::new(
            Arc::new(flaky_registry(calls.clone(), 1, false)),
            RetryPolicy::default(),
            Arc::new(MemoryEventLog::new()),
        );

        let err = runner
            .run_node(single_node_state("llms.chat"), NodeId::new("a"))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            EngineError::HandlerPermanentFailure { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut builder = TaskRegistry::builder();
        builder.category("llms").retryable(
            "chat",
            FnTask(move |_input: NodeInput| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    TaskResult::Ok(NodeOutput::single(json!("late but fine")))
                }
            }),
        );

        let policy = RetryPolicy {
            task_timeout_secs: 10,
            ..RetryPolicy::new(2, 1)
        };
        let runner = LocalRunner::new(
            Arc::new(builder.build().unwrap()),
            policy,
            Arc::new(MemoryEventLog::new()),
        );

        let run = runner
            .run_node(single_node_state("llms.chat"), NodeId::new("a"))
            .await
            .unwrap();
        assert_eq!(run.attempts, 2);
    }

    #[tokio::test]
    async fn test_unknown_type_is_reported() {
        let runner = LocalRunner::new(
            Arc::new(TaskRegistry::builder().build().unwrap()),
            RetryPolicy::default(),
            Arc::new(MemoryEventLog::new()),
        );

        let err = runner
            .run_node(single_node_state("nope.missing"), NodeId::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTaskType { .. }));
    }
}
