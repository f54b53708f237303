//! Shell command action

use crate::models::transition::ObjectRef;
use crate::transitions::error::ActionExecutionError;
use crate::transitions::registry::{ActionContext, ActionParam, TransitionAction};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default command timeout in seconds
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Key under which the command's stdout is left in the shared params
pub const OUTPUT_KEY: &str = "command_output";

/// How long output readers may drain after the command was killed
const READER_GRACE: Duration = Duration::from_secs(2);

/// Runs `bash -c <command>` for each object
///
/// The object and run are exposed to the command as `TRANSITION_*`
/// environment variables. A non-zero exit or a timeout fails the action.
#[derive(Debug, Clone, Default)]
pub struct CommandAction {
    asynchronous: bool,
}

impl CommandAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the action long-running so its transitions go to the background
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Parameters to register the action with
    pub fn params() -> Vec<ActionParam> {
        vec![
            ActionParam::required("command").describe("Shell command run by bash"),
            ActionParam::optional("timeout_seconds", Some(json!(DEFAULT_TIMEOUT_SECONDS)))
                .describe("Seconds before the command is killed"),
        ]
    }

    fn timeout_seconds(ctx: &ActionContext<'_>) -> u64 {
        ctx.param("timeout_seconds")
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
    }
}

/// Kill the command together with everything it started
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "Failed to kill command process group");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Collect a reader's lines, giving up once `grace` has passed
async fn join_reader(mut task: JoinHandle<Vec<String>>, grace: Option<Duration>) -> Vec<String> {
    match grace {
        None => task.await.unwrap_or_default(),
        Some(grace) => match timeout(grace, &mut task).await {
            Ok(lines) => lines.unwrap_or_default(),
            Err(_) => {
                task.abort();
                Vec::new()
            }
        },
    }
}

/// Drain a pipe line by line, logging each line
fn collect_lines<R>(pipe: R, stream: &'static str) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("{}: {}", stream, line);
            collected.push(line);
        }
        collected
    })
}

#[async_trait]
impl TransitionAction for CommandAction {
    async fn run(
        &self,
        ctx: &mut ActionContext<'_>,
        object: &ObjectRef,
    ) -> Result<(), ActionExecutionError> {
        let command = ctx.require_str("command")?.to_string();
        let timeout_seconds = Self::timeout_seconds(ctx);
        let start_time = Instant::now();

        let mut command_builder = Command::new("bash");
        #[cfg(unix)]
        {
            command_builder.process_group(0);
        }
        let mut child = command_builder
            .arg("-c")
            .arg(&command)
            .env("TRANSITION_NAME", ctx.transition)
            .env("TRANSITION_RUN_ID", ctx.run_id.to_string())
            .env("TRANSITION_ACTOR", &ctx.actor.username)
            .env("TRANSITION_OBJECT_KIND", &object.kind)
            .env("TRANSITION_OBJECT_ID", &object.id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn bash process")?;
        let pid = child.id();

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;
        let stdout_task = collect_lines(stdout, "stdout");
        let stderr_task = collect_lines(stderr, "stderr");

        let wait_result = timeout(Duration::from_secs(timeout_seconds), child.wait()).await;
        let grace = if wait_result.is_err() {
            // grandchildren keep the pipes open until the whole group is gone
            kill_process_group(pid);
            let _ = child.kill().await;
            Some(READER_GRACE)
        } else {
            None
        };

        let stdout_lines = join_reader(stdout_task, grace).await;
        let stderr_lines = join_reader(stderr_task, grace).await;

        tracing::debug!(
            object = %object,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Command finished"
        );

        match wait_result {
            Ok(Ok(status)) if status.success() => {
                ctx.shared
                    .insert(OUTPUT_KEY.to_string(), Value::String(stdout_lines.join("\n")));
                Ok(())
            }
            Ok(Ok(status)) => {
                let detail = stderr_lines
                    .last()
                    .map(|line| format!(": {}", line))
                    .unwrap_or_default();
                Err(ActionExecutionError::new(format!(
                    "Command failed with exit code {:?}{}",
                    status.code(),
                    detail
                )))
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e)
                .context("Failed to wait for process")
                .into()),
            Err(_) => Err(ActionExecutionError::new(format!(
                "Command timed out after {} seconds",
                timeout_seconds
            ))),
        }
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }
}
