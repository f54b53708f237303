//! Read-only progress view over persisted transition runs

use crate::models::transition::{ObjectOutcome, ObjectStatus, RunStatus, TransitionRun};
use crate::transitions::error::{TransitionError, TransitionResult};
use crate::transitions::persistence::RunPersistence;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Snapshot of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub transition: String,
    pub status: RunStatus,
    pub total: usize,
    /// Objects that reached the target, including no-op skips
    pub completed: usize,
    /// Objects whose chain has not finished yet
    pub pending: usize,
    /// Objects that failed an action or were rejected
    pub failed: usize,
    pub outcomes: Vec<ObjectOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunProgress {
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

impl From<&TransitionRun> for RunProgress {
    fn from(run: &TransitionRun) -> Self {
        let mut completed = 0;
        let mut pending = 0;
        let mut failed = 0;
        for outcome in &run.outcomes {
            match outcome.status {
                ObjectStatus::Succeeded | ObjectStatus::Skipped => completed += 1,
                ObjectStatus::Pending | ObjectStatus::Running => pending += 1,
                ObjectStatus::Failed | ObjectStatus::Rejected => failed += 1,
            }
        }

        Self {
            run_id: run.id,
            transition: run.transition.clone(),
            status: run.status,
            total: run.objects.len(),
            completed,
            pending,
            failed,
            outcomes: run.outcomes.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

/// Polls runs recorded by whichever worker ran the executor
pub struct RunAwaiter {
    persistence: Arc<RunPersistence>,
    /// Re-read the store file before every lookup
    reload: bool,
}

impl RunAwaiter {
    pub fn new(persistence: Arc<RunPersistence>) -> Self {
        Self {
            persistence,
            reload: false,
        }
    }

    /// Awaiter for runs executed by another process sharing the store file
    pub fn reloading(persistence: Arc<RunPersistence>) -> Self {
        Self {
            persistence,
            reload: true,
        }
    }

    pub fn get_status(&self, run_id: Uuid) -> TransitionResult<RunProgress> {
        if self.reload {
            self.persistence.refresh()?;
        }
        self.persistence
            .get_run(run_id)
            .map(|run| RunProgress::from(&run))
            .ok_or(TransitionError::RunNotFound(run_id))
    }

    /// Poll until the run finishes or `timeout` elapses
    ///
    /// On timeout the last snapshot is returned; check
    /// [`RunProgress::is_finished`].
    pub async fn wait_for(
        &self,
        run_id: Uuid,
        poll_interval: Duration,
        timeout: Duration,
    ) -> TransitionResult<RunProgress> {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self.get_status(run_id)?;
            if progress.is_finished() || Instant::now() >= deadline {
                return Ok(progress);
            }
            tracing::debug!(
                run_id = %run_id,
                pending = progress.pending,
                "Waiting for transition run"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }
}
