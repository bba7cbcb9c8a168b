use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Events buffered per run before they are flushed
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL files
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Per-run buffers, flushed when large or when the run's events are read
    buffer: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(HashMap::new()),
        })
    }

    /// Get the path to the event log file for a run on a given day
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: &NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Flush buffered events of a run to disk
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.write().await;
            match buffer.remove(run_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        // Group events by day
        let mut events_by_date: BTreeMap<NaiveDate, Vec<Event>> = BTreeMap::new();
        for event in events {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(run_id, &date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Flush every buffered run
    pub async fn flush_all(&self) -> Result<()> {
        let run_ids: Vec<RunId> = self.buffer.read().await.keys().copied().collect();
        for run_id in run_ids {
            self.flush(&run_id).await?;
        }
        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        // events/<year>/<month>/<day>/<run_id>.jsonl.gz
        for year in sorted_subdirs(&events_dir)? {
            for month in sorted_subdirs(&year)? {
                for day in sorted_subdirs(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).context("Failed to read event log directory")? {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let pending = {
            let mut buffer = self.buffer.write().await;
            let events = buffer.entry(run_id).or_default();
            events.push(event);
            events.len()
        };

        if pending > FLUSH_THRESHOLD {
            self.flush(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.flush(&run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}

/// In-memory event log, for tests and one-shot runs
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::{NodeId, WorkflowId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_event_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        let event = Event::new(
            run_id,
            EventType::RunStarted {
                workflow_id: WorkflowId::new("wf"),
                node_count: 3,
            },
        );

        log.append(event.clone()).await.unwrap();
        log.flush(&run_id).await.unwrap();

        let events = log.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn test_runs_are_kept_apart() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let first = RunId::new();
        let second = RunId::new();
        for run_id in [first, second, first] {
            log.append(Event::new(
                run_id,
                EventType::NodeCompleted {
                    node_id: NodeId::new("a"),
                    duration_ms: 1,
                },
            ))
            .await
            .unwrap();
        }
        log.flush_all().await.unwrap();

        assert_eq!(log.get_run_events(first).await.unwrap().len(), 2);
        assert_eq!(log.get_run_events(second).await.unwrap().len(), 1);

        // Appending after a flush extends the same file
        log.append(Event::new(second, EventType::RunCompleted { duration_ms: 5 }))
            .await
            .unwrap();
        assert_eq!(log.get_run_events(second).await.unwrap().len(), 2);
    }
}
