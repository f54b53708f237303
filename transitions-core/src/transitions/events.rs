//! Run event sinks: outbound delivery of finished runs

use crate::models::transition::{ObjectStatus, RunEvent};
use async_trait::async_trait;
use std::error::Error;

/// Sink receiving one event per finished run (e.g. a message bus publisher).
#[async_trait]
pub trait RunEventSink: Send + Sync {
    /// Sink name for logging.
    fn name(&self) -> &str;

    /// Deliver an event. Failures are logged by the caller and never fail the run.
    async fn publish(&self, event: &RunEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Sink writing a summary line per run to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl RunEventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &RunEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        let count = |status: ObjectStatus| {
            event
                .outcomes
                .iter()
                .filter(|o| o.status == status)
                .count()
        };
        tracing::info!(
            run_id = %event.run_id,
            transition = %event.transition,
            status = %event.status,
            succeeded = count(ObjectStatus::Succeeded),
            skipped = count(ObjectStatus::Skipped),
            rejected = count(ObjectStatus::Rejected),
            failed = count(ObjectStatus::Failed),
            "Transition run finished"
        );
        Ok(())
    }
}
