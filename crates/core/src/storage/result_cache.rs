use crate::cache::ResultCache;
use crate::error::{EngineError, EngineResult};
use anyhow::Context;
use chrono::Utc;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("result_cache");

/// Attempts to open the file while another process holds it
const OPEN_ATTEMPTS: u32 = 50;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    expires_at_ms: i64,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// File-backed result cache that several processes can share.
///
/// redb locks its file for as long as a `Database` is open, so every
/// operation opens the file, runs one transaction and closes it again.
#[derive(Clone)]
pub struct RedbResultCache {
    path: PathBuf,
    // Serializes openers within this process
    guard: Arc<Mutex<()>>,
}

impl RedbResultCache {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }

        let cache = Self {
            path,
            guard: Arc::new(Mutex::new(())),
        };
        cache
            .with_db(|db| {
                let write_txn = db.begin_write().context("Failed to begin write transaction")?;
                {
                    let _cache_table = write_txn
                        .open_table(CACHE_TABLE)
                        .context("Failed to open cache table")?;
                }
                write_txn.commit().context("Failed to commit transaction")?;
                Ok(())
            })
            .map_err(|e| anyhow::anyhow!("Failed to create cache database: {}", e))?;

        Ok(cache)
    }

    fn open(&self) -> anyhow::Result<Database> {
        let mut attempt = 1;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to open cache database {}", self.path.display())
                    })
                }
            }
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> anyhow::Result<T>) -> EngineResult<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| EngineError::Storage("result cache lock poisoned".to_string()))?;
        let db = self.open()?;
        Ok(f(&db)?)
    }

    /// Remove expired entries, returning how many were removed
    pub fn purge_expired(&self) -> EngineResult<usize> {
        let now = Utc::now().timestamp_millis();
        self.with_db(|db| {
            let write_txn = db.begin_write().context("Failed to begin write")?;
            let removed = {
                let mut table = write_txn
                    .open_table(CACHE_TABLE)
                    .context("Failed to open cache table")?;

                let mut expired = Vec::new();
                for item in table.iter().context("Failed to iterate cache")? {
                    let (key, value) = item.context("Failed to read cache entry")?;
                    let entry: StoredEntry = serde_json::from_slice(value.value())
                        .context("Failed to decode cache entry")?;
                    if entry.is_expired(now) {
                        expired.push(key.value().to_string());
                    }
                }

                for key in &expired {
                    table
                        .remove(key.as_str())
                        .context("Failed to remove cache entry")?;
                }
                expired.len()
            };
            write_txn.commit().context("Failed to commit")?;
            Ok(removed)
        })
    }
}

impl ResultCache for RedbResultCache {
    fn set(&self, key: &str, value: Value, ttl: Duration) -> EngineResult<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = StoredEntry {
            value,
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
        };
        let bytes = serde_json::to_vec(&entry)?;

        self.with_db(|db| {
            let write_txn = db.begin_write().context("Failed to begin write")?;
            {
                let mut table = write_txn
                    .open_table(CACHE_TABLE)
                    .context("Failed to open cache table")?;
                table
                    .insert(key, bytes.as_slice())
                    .context("Failed to insert cache entry")?;
            }
            write_txn.commit().context("Failed to commit")?;
            Ok(())
        })
    }

    /// Expired entries read as absent and are removed on the way
    fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        let now = Utc::now().timestamp_millis();
        self.with_db(|db| {
            let entry: Option<StoredEntry> = {
                let read_txn = db.begin_read().context("Failed to begin read")?;
                let table = read_txn
                    .open_table(CACHE_TABLE)
                    .context("Failed to open cache table")?;
                match table.get(key).context("Failed to get cache entry")? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value())
                            .context("Failed to decode cache entry")?,
                    ),
                    None => None,
                }
            };

            match entry {
                Some(entry) if entry.is_expired(now) => {
                    let write_txn = db.begin_write().context("Failed to begin write")?;
                    {
                        let mut table = write_txn
                            .open_table(CACHE_TABLE)
                            .context("Failed to open cache table")?;
                        table.remove(key).context("Failed to remove cache entry")?;
                    }
                    write_txn.commit().context("Failed to commit")?;
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.value)),
                None => Ok(None),
            }
        })
    }
}
