use crate::types::RunId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Shared run metadata used for cooperative cancellation.
///
/// The orchestrator checks it before every dispatch and workers check it
/// before executing a node item. Handlers already running are not interrupted.
/// Only registered runs are tracked, so a finished or unknown run leaves
/// nothing behind.
#[derive(Default)]
pub struct RunControl {
    // Run id -> abort requested
    runs: RwLock<HashMap<RunId, bool>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a run until [`RunControl::finish`]
    pub async fn register(&self, run_id: RunId) {
        self.runs.write().await.entry(run_id).or_insert(false);
    }

    /// Request cancellation of a run. Returns `false` if the run is not active.
    pub async fn abort(&self, run_id: RunId) -> bool {
        match self.runs.write().await.get_mut(&run_id) {
            Some(aborted) => {
                *aborted = true;
                tracing::info!("Abort requested for run {}", run_id);
                true
            }
            None => {
                tracing::warn!("Ignoring abort for inactive run {}", run_id);
                false
            }
        }
    }

    pub async fn is_aborted(&self, run_id: RunId) -> bool {
        self.runs
            .read()
            .await
            .get(&run_id)
            .copied()
            .unwrap_or(false)
    }

    /// Number of runs currently tracked
    pub async fn active_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Forget a finished run
    pub async fn finish(&self, run_id: RunId) {
        self.runs.write().await.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_of_active_run() {
        let control = RunControl::new();
        let run_id = RunId::new();
        control.register(run_id).await;
        assert!(!control.is_aborted(run_id).await);

        assert!(control.abort(run_id).await);
        assert!(control.is_aborted(run_id).await);

        control.finish(run_id).await;
        assert!(!control.is_aborted(run_id).await);
        assert_eq!(control.active_runs().await, 0);
    }

    #[tokio::test]
    async fn test_abort_of_unknown_runs_is_not_retained() {
        let control = RunControl::new();
        for _ in 0..100 {
            assert!(!control.abort(RunId::new()).await);
        }
        assert_eq!(control.active_runs().await, 0);

        // A run registered after a stray abort starts clean
        let run_id = RunId::new();
        control.abort(run_id).await;
        control.register(run_id).await;
        assert!(!control.is_aborted(run_id).await);
    }

    #[tokio::test]
    async fn test_register_keeps_existing_abort() {
        let control = RunControl::new();
        let run_id = RunId::new();
        control.register(run_id).await;
        control.abort(run_id).await;
        control.register(run_id).await;
        assert!(control.is_aborted(run_id).await);
    }
}
