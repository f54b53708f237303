//! Actions available to definition files run from the command line

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use transitions_core::models::ObjectRef;
use transitions_core::transitions::{
    ActionContext, ActionExecutionError, ActionParam, ActionRegistry, CommandAction, FnAction,
    RegisteredAction, TransitionAction, TransitionResult,
};

/// Sleeps for `seconds`; always runs in the background
struct WaitAction;

#[async_trait]
impl TransitionAction for WaitAction {
    async fn run(
        &self,
        ctx: &mut ActionContext<'_>,
        object: &ObjectRef,
    ) -> Result<(), ActionExecutionError> {
        let seconds = ctx
            .param("seconds")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| ActionExecutionError::new("'seconds' must be a non-negative number"))?;
        tracing::info!(object = %object, seconds, "Waiting");
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(())
    }

    fn is_async(&self) -> bool {
        true
    }
}

fn notify(ctx: &mut ActionContext<'_>, object: &ObjectRef) -> Result<(), ActionExecutionError> {
    let message = match ctx.param_str("message") {
        Some(message) => message.to_string(),
        None => format!("{} ran '{}' on {}", ctx.actor.username, ctx.transition, object),
    };
    let owner = ctx.shared.get("owner").and_then(Value::as_str).unwrap_or("-");
    tracing::info!(object = %object, owner, "{}", message);
    Ok(())
}

fn assign_owner(ctx: &mut ActionContext<'_>, object: &ObjectRef) -> Result<(), ActionExecutionError> {
    let owner = ctx.require_str("owner")?.to_string();
    tracing::info!(object = %object, owner = %owner, "Assigned owner");
    ctx.shared.insert("owner".to_string(), Value::String(owner));
    Ok(())
}

fn fail(ctx: &mut ActionContext<'_>, _object: &ObjectRef) -> Result<(), ActionExecutionError> {
    Err(ActionExecutionError::new(
        ctx.param_str("reason").unwrap_or("failed on request"),
    ))
}

/// Registry with the built-in actions
pub fn builtin_registry() -> TransitionResult<ActionRegistry> {
    let mut builder = ActionRegistry::builder();
    builder
        .register_entry(
            RegisteredAction::new("assign_owner", Arc::new(FnAction::new(assign_owner)))
                .with_params(vec![ActionParam::required("owner").describe("New owner username")])
                .with_verbose_name("Assign owner"),
        )?
        .register_entry(
            RegisteredAction::new("notify", Arc::new(FnAction::new(notify)))
                .with_params(vec![ActionParam::optional("message", None)])
                .run_after(["assign_owner", "run_command", "run_command_async"]),
        )?
        .register_entry(
            RegisteredAction::new("run_command", Arc::new(CommandAction::new()))
                .with_params(CommandAction::params()),
        )?
        .register_entry(
            RegisteredAction::new("run_command_async", Arc::new(CommandAction::new().asynchronous()))
                .with_params(CommandAction::params()),
        )?
        .register_entry(
            RegisteredAction::new("wait", Arc::new(WaitAction))
                .with_params(vec![ActionParam::optional("seconds", Some(json!(1)))]),
        )?
        .register_entry(
            RegisteredAction::new("fail", Arc::new(FnAction::new(fail)))
                .with_params(vec![ActionParam::optional("reason", None).excluded_from_history()]),
        )?;
    Ok(builder.build())
}
