//! Ephemeral result cache.
//!
//! Hand-off surface between an asynchronous producer (e.g. a title
//! summarization job) and a later consumer that shares no memory with it.
//! Entries expire after their TTL; writes to the same key are last-write-wins.

use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, RunId, RunStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Cache collaborator
pub trait ResultCache: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: Value, ttl: Duration) -> EngineResult<()>;

    /// Stored value, or `None` if missing or expired
    fn get(&self, key: &str) -> EngineResult<Option<Value>>;
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-process cache. Uses the tokio clock so expiry follows paused test time.
#[derive(Default)]
pub struct MemoryResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> EngineResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Storage(format!("result cache lock poisoned: {}", e))
}

impl ResultCache for MemoryResultCache {
    fn set(&self, key: &str, value: Value, ttl: Duration) -> EngineResult<()> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), entry);
        Ok(())
    }

    fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }
}

/// Run status codes published under [`run_status_key`]
pub const RUN_STATUS_RUNNING: u16 = 202;
pub const RUN_STATUS_FINISHED: u16 = 200;
pub const RUN_STATUS_FAILED: u16 = 500;
/// Reported for runs with no (or an expired) status entry
pub const RUN_STATUS_UNKNOWN: u16 = 404;

pub fn run_status_key(run_id: &RunId) -> String {
    format!("workflow:record:{}", run_id)
}

pub fn finished_nodes_key(run_id: &RunId) -> String {
    format!("workflow:record:finished_nodes:{}", run_id)
}

/// Publishes the progress of runs to a result cache, so a reader in another
/// process can poll a run without access to the run store.
///
/// Publishing is best effort: a cache failure is logged and never fails the run.
#[derive(Clone)]
pub struct RunProgress {
    cache: Arc<dyn ResultCache>,
    ttl: Duration,
}

impl RunProgress {
    pub fn new(cache: Arc<dyn ResultCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn publish(&self, key: String, value: Value) {
        if let Err(e) = self.cache.set(&key, value, self.ttl) {
            tracing::warn!("Failed to publish {}: {}", key, e);
        }
    }

    pub fn started(&self, run_id: &RunId) {
        self.publish(finished_nodes_key(run_id), Value::Array(Vec::new()));
        self.publish(run_status_key(run_id), Value::from(RUN_STATUS_RUNNING));
    }

    /// Replace the finished-node list, in completion order
    pub fn nodes_finished(&self, run_id: &RunId, finished: &[NodeId]) {
        let nodes = finished
            .iter()
            .map(|id| Value::String(id.to_string()))
            .collect();
        self.publish(finished_nodes_key(run_id), Value::Array(nodes));
    }

    /// `None` means the run failed before producing a report
    pub fn finished(&self, run_id: &RunId, status: Option<RunStatus>) {
        let code = match status {
            Some(RunStatus::Completed) => RUN_STATUS_FINISHED,
            _ => RUN_STATUS_FAILED,
        };
        self.publish(run_status_key(run_id), Value::from(code));
    }
}

/// Status code of a run as published by [`RunProgress`]
pub fn run_status(cache: &dyn ResultCache, run_id: &RunId) -> EngineResult<u16> {
    Ok(cache
        .get(&run_status_key(run_id))?
        .and_then(|v| v.as_u64())
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(RUN_STATUS_UNKNOWN))
}

/// Nodes of a run that have finished so far, in completion order
pub fn finished_nodes(cache: &dyn ResultCache, run_id: &RunId) -> EngineResult<Vec<NodeId>> {
    let Some(value) = cache.get(&finished_nodes_key(run_id))? else {
        return Ok(Vec::new());
    };
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = MemoryResultCache::new();
        cache
            .set("conversation-title:m1", json!("Trip plans"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            cache.get("conversation-title:m1").unwrap(),
            Some(json!("Trip plans"))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("conversation-title:m1").unwrap(), None);
        assert_eq!(cache.purge_expired().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_and_refreshes_ttl() {
        let cache = MemoryResultCache::new();
        cache.set("k", json!(1), Duration::from_secs(1)).unwrap();
        cache.set("k", json!(2), Duration::from_secs(10)).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").unwrap(), Some(json!(2)));
        assert_eq!(cache.get("missing").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_progress_lifecycle() {
        let cache = Arc::new(MemoryResultCache::new());
        let progress = RunProgress::new(cache.clone(), Duration::from_secs(3600));
        let run_id = RunId::new();

        assert_eq!(run_status(cache.as_ref(), &run_id).unwrap(), RUN_STATUS_UNKNOWN);

        progress.started(&run_id);
        assert_eq!(run_status(cache.as_ref(), &run_id).unwrap(), RUN_STATUS_RUNNING);
        assert!(finished_nodes(cache.as_ref(), &run_id).unwrap().is_empty());

        progress.nodes_finished(&run_id, &[NodeId::new("b"), NodeId::new("a")]);
        assert_eq!(
            finished_nodes(cache.as_ref(), &run_id).unwrap(),
            vec![NodeId::new("b"), NodeId::new("a")]
        );

        progress.finished(&run_id, Some(RunStatus::PartiallyFailed));
        assert_eq!(run_status(cache.as_ref(), &run_id).unwrap(), RUN_STATUS_FAILED);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(run_status(cache.as_ref(), &run_id).unwrap(), RUN_STATUS_UNKNOWN);
    }
}
