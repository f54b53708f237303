//! Run, history and object state persistence using JSON file storage

use crate::models::transition::{
    ActionResult, ObjectOutcome, ObjectRef, RunStatus, TransitionHistory, TransitionRun,
};
use crate::transitions::state_store::ObjectStateStore;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Root JSON store containing all engine data
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonStore {
    /// All transition runs with their action results
    pub runs: Vec<TransitionRun>,
    /// Audit trail of completed object transitions
    pub history: Vec<TransitionHistory>,
    /// Lifecycle state per object, keyed by `kind:id`
    pub object_states: BTreeMap<String, String>,
}

/// Run persistence manager
///
/// Every mutation is written through to the store file when one is
/// configured; an in-memory instance keeps everything in the process.
pub struct RunPersistence {
    /// Path to JSON store file
    store_path: Option<PathBuf>,
    /// In-memory data store
    store: Mutex<JsonStore>,
}

impl RunPersistence {
    /// Create persistence backed by a JSON file, loading it if present
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create transition store directory")?;
        }

        let store = Self::load_store(&store_path)?;

        Ok(Self {
            store_path: Some(store_path),
            store: Mutex::new(store),
        })
    }

    /// Create persistence that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            store_path: None,
            store: Mutex::new(JsonStore::default()),
        }
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Reload the store from its file, picking up writes of other processes
    pub fn refresh(&self) -> Result<()> {
        let Some(store_path) = &self.store_path else {
            return Ok(());
        };
        let mut store = self.lock();
        *store = Self::load_store(store_path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, JsonStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `<store file name><suffix>` next to the store file
    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        path.with_file_name(name)
    }

    /// Open the lock file guarding the store; the store itself is replaced on write
    fn open_lock_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::sibling(path, ".lock"))
            .context("Failed to open transition store lock file")
    }

    /// Load JSON store from file with file locking
    fn load_store(path: &Path) -> Result<JsonStore> {
        let lock_file = Self::open_lock_file(path)?;
        lock_file
            .lock_shared()
            .context("Failed to acquire read lock on transition store")?;

        // Lock is released when the lock file is closed
        Self::read_store_file(path)
    }

    fn read_store_file(path: &Path) -> Result<JsonStore> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JsonStore::default()),
            Err(e) => return Err(e).context("Failed to open transition store file"),
        };

        let mut contents = String::new();
        std::io::BufReader::new(file)
            .read_to_string(&mut contents)
            .context("Failed to read transition store")?;

        if contents.is_empty() {
            return Ok(JsonStore::default());
        }

        serde_json::from_str(&contents).context("Failed to parse transition store JSON")
    }

    /// Write the store to a temporary file and rename it over the store file
    fn write_store_file(path: &Path, store: &JsonStore) -> Result<()> {
        let temp_path = Self::sibling(path, ".tmp");
        let json =
            serde_json::to_string_pretty(store).context("Failed to serialize transition store")?;

        let file = File::create(&temp_path).context("Failed to create temporary transition store")?;
        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .context("Failed to write transition store")?;
        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context("Failed to flush transition store to disk")?;
        file.sync_all()
            .context("Failed to flush transition store to disk")?;

        std::fs::rename(&temp_path, path).context("Failed to replace transition store file")?;
        Ok(())
    }

    /// Apply a mutation to the latest store contents and write it back
    ///
    /// File-backed stores re-read the file under the exclusive lock, so
    /// writers in other processes are never overwritten. The cached copy is
    /// only replaced once the write succeeded.
    fn mutate<T>(&self, apply: impl FnOnce(&mut JsonStore) -> T) -> Result<T> {
        let mut cached = self.lock();
        let Some(store_path) = &self.store_path else {
            return Ok(apply(&mut cached));
        };

        let lock_file = Self::open_lock_file(store_path)?;
        lock_file
            .lock_exclusive()
            .context("Failed to acquire write lock on transition store")?;

        let mut store = Self::read_store_file(store_path)?;
        let value = apply(&mut store);
        Self::write_store_file(store_path, &store)?;
        *cached = store;
        Ok(value)
    }

    fn with_run(&self, run_id: Uuid, apply: impl FnOnce(&mut TransitionRun)) -> Result<()> {
        let found = self.mutate(|store| {
            store
                .runs
                .iter_mut()
                .find(|r| r.id == run_id)
                .map(apply)
                .is_some()
        })?;
        if found {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Transition run {} not found in store", run_id))
        }
    }

    /// Create new transition run
    pub fn create_run(&self, run: TransitionRun) -> Result<()> {
        self.mutate(|store| store.runs.push(run))
    }

    /// Mark a run as started
    pub fn start_run(&self, run_id: Uuid) -> Result<()> {
        self.with_run(run_id, |run| {
            run.status = RunStatus::Running;
            run.started_at.get_or_insert_with(Utc::now);
        })
    }

    /// Replace the outcome record of one object
    pub fn record_object_outcome(&self, run_id: Uuid, outcome: ObjectOutcome) -> Result<()> {
        self.with_run(run_id, |run| {
            match run.outcomes.iter_mut().find(|o| o.object == outcome.object) {
                Some(existing) => *existing = outcome,
                None => run.outcomes.push(outcome),
            }
        })
    }

    /// Append an action result; results are never rewritten
    pub fn record_action_result(&self, run_id: Uuid, result: ActionResult) -> Result<()> {
        self.with_run(run_id, |run| run.results.push(result))
    }

    /// Store the final status and return the finished run
    pub fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<TransitionRun> {
        let mut finished = None;
        self.with_run(run_id, |run| {
            run.status = status;
            run.finished_at = Some(Utc::now());
            finished = Some(run.clone());
        })?;
        finished.ok_or_else(|| anyhow::anyhow!("Transition run {} not found in store", run_id))
    }

    /// Get run by ID
    pub fn get_run(&self, run_id: Uuid) -> Option<TransitionRun> {
        self.lock().runs.iter().find(|r| r.id == run_id).cloned()
    }

    /// Runs, newest first, optionally for one transition
    pub fn list_runs(&self, transition: Option<&str>) -> Vec<TransitionRun> {
        let store = self.lock();
        let mut runs: Vec<_> = store
            .runs
            .iter()
            .filter(|r| transition.map_or(true, |t| r.transition == t))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Find runs that never finished, e.g. after a worker crash
    pub fn find_unfinished_runs(&self) -> Vec<TransitionRun> {
        self.lock()
            .runs
            .iter()
            .filter(|r| !r.status.is_finished())
            .cloned()
            .collect()
    }

    /// Persist a history entry
    pub fn append_history(&self, entry: TransitionHistory) -> Result<()> {
        self.mutate(|store| store.history.push(entry))
    }

    /// History entries, optionally for one object, oldest first
    pub fn history(&self, object: Option<&ObjectRef>) -> Vec<TransitionHistory> {
        self.lock()
            .history
            .iter()
            .filter(|h| object.map_or(true, |o| &h.object == o))
            .cloned()
            .collect()
    }

    /// Seed or overwrite an object's state
    pub fn set_object_state(&self, object: &ObjectRef, state: &str) -> Result<()> {
        self.mutate(|store| {
            store
                .object_states
                .insert(object.to_string(), state.to_string());
        })
    }

    /// All known object states keyed by `kind:id`
    pub fn object_states(&self) -> BTreeMap<String, String> {
        self.lock().object_states.clone()
    }

    /// Query metrics for one transition or all of them
    pub fn query_metrics(&self, transition: Option<&str>) -> RunMetrics {
        let store = self.lock();

        let runs: Vec<_> = store
            .runs
            .iter()
            .filter(|r| transition.map_or(true, |t| r.transition == t))
            .collect();

        let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();

        let durations: Vec<u64> = runs
            .iter()
            .filter_map(|r| match (r.started_at, r.finished_at) {
                (Some(started), Some(finished)) => {
                    Some((finished - started).num_milliseconds().max(0) as u64)
                }
                _ => None,
            })
            .collect();

        let avg_duration_ms = if durations.is_empty() {
            0
        } else {
            durations.iter().sum::<u64>() / durations.len() as u64
        };

        RunMetrics {
            run_count: runs.len(),
            succeeded_count: count(RunStatus::Succeeded),
            partially_failed_count: count(RunStatus::PartiallyFailed),
            failed_count: count(RunStatus::Failed),
            in_flight_count: runs.iter().filter(|r| !r.status.is_finished()).count(),
            avg_duration_ms,
        }
    }
}

impl ObjectStateStore for RunPersistence {
    fn current_state(&self, object: &ObjectRef) -> Result<Option<String>> {
        self.refresh()?;
        Ok(self.lock().object_states.get(&object.to_string()).cloned())
    }

    fn compare_and_set(&self, object: &ObjectRef, expected: &str, new: &str) -> Result<bool> {
        let key = object.to_string();
        self.mutate(|store| match store.object_states.get(&key) {
            Some(current) if current == expected => {
                store.object_states.insert(key, new.to_string());
                true
            }
            _ => false,
        })
    }
}

/// Transition run metrics
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_count: usize,
    pub succeeded_count: usize,
    pub partially_failed_count: usize,
    pub failed_count: usize,
    pub in_flight_count: usize,
    pub avg_duration_ms: u64,
}

impl RunMetrics {
    /// Percentage of finished runs that did not fully succeed
    pub fn failure_rate(&self) -> f64 {
        let finished = self.run_count - self.in_flight_count;
        if finished == 0 {
            return 0.0;
        }
        ((self.failed_count + self.partially_failed_count) as f64 / finished as f64) * 100.0
    }

    /// Percentage of finished runs that fully succeeded
    pub fn success_rate(&self) -> f64 {
        let finished = self.run_count - self.in_flight_count;
        if finished == 0 {
            return 0.0;
        }
        (self.succeeded_count as f64 / finished as f64) * 100.0
    }
}
