//! Logging service

use crate::models::{LogLevel, ObjectRef};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified level
///
/// A `RUST_LOG` environment variable overrides the level. Installing a second
/// subscriber is an error but never panics.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("transitions_core={level},transitions={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
}

/// Log a transition lifecycle event for one object
pub fn log_transition_event(event_type: &str, transition: &str, object: &ObjectRef, details: Option<&str>) {
    tracing::info!(
        event_type = event_type,
        transition = transition,
        object = %object,
        details = details.unwrap_or(""),
        "Transition event"
    );
}

/// Log a refused authorization (always logged regardless of level)
pub fn log_permission_denied(actor: &str, transition: &str, object: &ObjectRef, permission: &str) {
    tracing::warn!(
        actor = actor,
        transition = transition,
        object = %object,
        permission = permission,
        "Permission denied"
    );
}

/// Log a system error
pub fn log_error(error: &str, context: Option<&str>) {
    tracing::error!(
        error = error,
        context = context.unwrap_or(""),
        "System error occurred"
    );
}
