//! `pivot run <plan.toml>`: execute a plan file with the shell executor and
//! print the plan and replanning reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast::error::RecvError;

use pivot_core::config::EngineConfig;
use pivot_core::events::EngineEvent;
use pivot_core::model::PlanStatus;
use pivot_core::orchestrator::{ExportFormat, Orchestrator};

use crate::executor::ShellExecutor;

pub struct RunOptions {
    pub plan_file: PathBuf,
    pub format: ExportFormat,
    pub output: Option<PathBuf>,
}

pub async fn run_plan(config: EngineConfig, options: &RunOptions) -> Result<()> {
    let content = std::fs::read_to_string(&options.plan_file).with_context(|| {
        format!("failed to read plan file: {}", options.plan_file.display())
    })?;

    let orchestrator = Orchestrator::new(config)?;
    let log_task = tokio::spawn(log_events(orchestrator.subscribe()));

    let plan_id = orchestrator
        .create_plan_from_toml(&content)
        .await
        .with_context(|| format!("failed to load plan file: {}", options.plan_file.display()))?;

    let working_dir = plan_dir(&options.plan_file);
    let executor = Arc::new(ShellExecutor::new(working_dir));
    let plan = orchestrator.execute_plan(plan_id, executor).await?;

    let mut report = orchestrator.export_plan(plan_id, options.format).await?;
    if options.format == ExportFormat::Markdown {
        report.push('\n');
        report.push_str(&orchestrator.export_history(ExportFormat::Markdown).await);
    }

    drop(orchestrator);
    let _ = log_task.await;

    match &options.output {
        Some(path) => {
            std::fs::write(path, &report)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => print!("{report}"),
    }

    if plan.status != PlanStatus::Completed {
        bail!(
            "plan {} finished {} ({} failed, {} skipped)",
            plan.id,
            plan.status,
            plan.metrics.failed_tasks,
            plan.metrics.skipped_tasks
        );
    }
    Ok(())
}

fn plan_dir(plan_file: &Path) -> PathBuf {
    match plan_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Mirror engine events into the log until the orchestrator is dropped.
async fn log_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                EngineEvent::TaskError { task_id, message, .. } => {
                    tracing::warn!(event = event.name(), task_id = %task_id, %message);
                }
                EngineEvent::PlanReplanTrigger { trigger, .. } => {
                    tracing::info!(event = event.name(), trigger = %trigger.kind(), task_id = ?trigger.task_id());
                }
                _ => tracing::info!(event = event.name()),
            },
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
