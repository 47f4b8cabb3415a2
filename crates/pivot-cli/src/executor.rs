//! Shell-backed [`Executor`] used by `pivot run`.
//!
//! A task's `parameters.command` is run through `sh -c` in the plan file's
//! directory. A non-zero exit fails the task with the tail of stderr.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use pivot_core::model::Task;
use pivot_core::scheduler::Executor;

/// Longest stderr excerpt kept in a task error.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    working_dir: PathBuf,
}

impl ShellExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, task: &Task) -> Result<Value> {
        let Some(command) = task.parameters.get("command").and_then(Value::as_str) else {
            tracing::debug!(task_id = %task.id, "task has no command, nothing to run");
            return Ok(Value::Null);
        };

        tracing::debug!(task_id = %task.id, command, "running shell command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn `sh -c {command}`"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr.get(start..).unwrap_or(stderr);
            match output.status.code() {
                Some(code) => bail!("command exited with status {code}: {tail}"),
                None => bail!("command terminated by signal: {tail}"),
            }
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": stdout.trim_end(),
        }))
    }
}
