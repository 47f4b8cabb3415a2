//! Wavefront scheduler: drives a plan's tasks through the caller's
//! [`Executor`], sequentially or in bounded-parallel waves.
//!
//! In parallel mode each iteration computes the ready frontier (waiting
//! tasks whose dependencies have all completed), dispatches up to
//! `max_parallel` of them concurrently, and waits for the whole wave before
//! recomputing. Failed tasks cascade `skipped` onto their dependents.
//! Cancellation and pause are cooperative: they are observed between waves
//! and never interrupt an in-flight executor call.

pub mod executor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};
use crate::graph::TaskGraph;
use crate::model::{Plan, Task, TaskResult, TaskStatus};
use crate::monitor::{Monitor, TaskReport, Trigger};

pub use executor::Executor;

/// A plan shared between the scheduler and the orchestrator. The lock is
/// only held for state transitions, never across an executor call.
pub type SharedPlan = Arc<Mutex<Plan>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Maximum tasks dispatched in one wave.
    pub max_parallel: usize,
    /// Relative deviation `|actual - estimated| / estimated` above which
    /// remaining estimates are rescaled.
    pub replan_threshold: f64,
    /// Rescale estimates of same-component tasks after large deviations.
    pub adaptive: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_parallel: 4,
            replan_threshold: 0.5,
            adaptive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Control and report
// ---------------------------------------------------------------------------

/// Cooperative stop signals for one plan's execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn interruption(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.is_paused() {
            Some(StopReason::Paused)
        } else {
            None
        }
    }
}

/// Why a scheduler run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// No task is left to dispatch.
    #[default]
    Finished,
    Paused,
    Cancelled,
}

/// What happened during one scheduler run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Task ids per dispatched wave, in dispatch order. Sequential runs
    /// record one single-task wave per executed task.
    pub waves: Vec<Vec<String>>,
    /// Triggers raised during the run (monitor and deviation).
    pub triggers: Vec<Trigger>,
    pub stop: StopReason,
}

struct TaskRun {
    task_id: String,
    result: Result<Value, String>,
    elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    config: SchedulerConfig,
    events: EventBus,
    monitor: Option<Arc<Mutex<Monitor>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            monitor: None,
        }
    }

    /// Report every task outcome to `monitor` under the plan id.
    pub fn with_monitor(mut self, monitor: Arc<Mutex<Monitor>>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the plan's waiting tasks until none can be dispatched or the
    /// control signals a stop.
    pub async fn execute(
        &self,
        plan: &SharedPlan,
        executor: &Arc<dyn Executor>,
        control: &ExecutionControl,
    ) -> ExecutionReport {
        match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(plan, executor, control).await,
            ExecutionMode::Parallel => self.run_parallel(plan, executor, control).await,
        }
    }

    async fn run_parallel(
        &self,
        plan: &SharedPlan,
        executor: &Arc<dyn Executor>,
        control: &ExecutionControl,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let max_parallel = self.config.max_parallel.max(1);

        loop {
            if let Some(stop) = control.interruption() {
                report.stop = stop;
                break;
            }

            let (plan_id, wave) = {
                let mut plan = plan.lock().await;
                self.skip_unreachable(&mut plan);
                TaskGraph::promote_ready(&mut plan.tasks);
                let frontier = TaskGraph::ready_frontier(&plan.tasks);
                if frontier.is_empty() {
                    block_stranded(&mut plan);
                    plan.refresh_metrics();
                    break;
                }
                let wave: Vec<Task> = frontier
                    .into_iter()
                    .take(max_parallel)
                    .map(|i| start_task(&mut plan.tasks[i]))
                    .collect();
                (plan.id, wave)
            };

            tracing::debug!(plan_id = %plan_id, size = wave.len(), "dispatching wave");
            for task in &wave {
                self.emit_start(plan_id, task);
            }

            let runs = join_all(wave.into_iter().map(|task| run_task(executor.as_ref(), task))).await;
            report
                .waves
                .push(runs.iter().map(|r| r.task_id.clone()).collect());
            self.apply_runs(plan, plan_id, runs, &mut report).await;
        }

        report
    }

    async fn run_sequential(
        &self,
        plan: &SharedPlan,
        executor: &Arc<dyn Executor>,
        control: &ExecutionControl,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let order: Vec<String> = plan.lock().await.tasks.iter().map(|t| t.id.clone()).collect();

        for task_id in order {
            if let Some(stop) = control.interruption() {
                report.stop = stop;
                break;
            }

            let (plan_id, task) = {
                let mut plan = plan.lock().await;
                let plan_id = plan.id;
                let Some(pos) = plan.position(&task_id) else {
                    continue;
                };
                if !plan.tasks[pos].status.is_waiting() {
                    continue;
                }
                match dependency_state(&plan, &plan.tasks[pos]) {
                    DependencyState::Satisfied => {}
                    DependencyState::Unavailable => {
                        tracing::info!(plan_id = %plan_id, task_id = %task_id, "skipping task with failed dependency");
                        plan.tasks[pos].status = TaskStatus::Skipped;
                        continue;
                    }
                    DependencyState::Incomplete => {
                        tracing::warn!(plan_id = %plan_id, task_id = %task_id, "dependencies incomplete, blocking task");
                        plan.tasks[pos].status = TaskStatus::Blocked;
                        continue;
                    }
                }
                (plan_id, start_task(&mut plan.tasks[pos]))
            };

            self.emit_start(plan_id, &task);
            let run = run_task(executor.as_ref(), task).await;
            report.waves.push(vec![run.task_id.clone()]);
            self.apply_runs(plan, plan_id, vec![run], &mut report).await;
        }

        plan.lock().await.refresh_metrics();
        report
    }

    /// Record wave results on the plan, rescale estimates, and feed the
    /// monitor.
    async fn apply_runs(
        &self,
        plan: &SharedPlan,
        plan_id: Uuid,
        runs: Vec<TaskRun>,
        report: &mut ExecutionReport,
    ) {
        let context_id = plan_id.to_string();
        let mut outcomes = Vec::with_capacity(runs.len());
        {
            let mut plan = plan.lock().await;
            for run in runs {
                let Some(outcome) = self.record_run(&mut plan, run) else {
                    continue;
                };
                if let Some(ratio) = outcome.deviation {
                    let trigger = Trigger::deviation(&context_id, &outcome.report.task_id, ratio);
                    tracing::info!(
                        plan_id = %plan_id,
                        task_id = %outcome.report.task_id,
                        ratio,
                        "estimate deviation exceeded threshold"
                    );
                    self.events.emit(EngineEvent::PlanReplanTrigger {
                        plan_id,
                        trigger: trigger.clone(),
                    });
                    report.triggers.push(trigger);
                }
                outcomes.push(outcome.report);
            }
            self.skip_unreachable(&mut plan);
            plan.refresh_metrics();
        }

        if let Some(monitor) = &self.monitor {
            let mut monitor = monitor.lock().await;
            for outcome in &outcomes {
                if let Some(trigger) = monitor.report_result(&context_id, outcome) {
                    report.triggers.push(trigger);
                }
            }
        }
    }

    fn record_run(&self, plan: &mut Plan, run: TaskRun) -> Option<RunOutcome> {
        let plan_id = plan.id;
        let Some(task) = plan.task_mut(&run.task_id) else {
            tracing::warn!(plan_id = %plan_id, task_id = %run.task_id, "task vanished while executing");
            return None;
        };

        task.actual_ms = Some(run.elapsed_ms);
        task.completed_at = Some(Utc::now());
        let report = match run.result {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.result = Some(TaskResult::Success { output });
                tracing::info!(plan_id = %plan_id, task_id = %run.task_id, elapsed_ms = run.elapsed_ms, "task completed");
                self.events.emit(EngineEvent::TaskComplete {
                    plan_id,
                    task_id: run.task_id.clone(),
                    actual_ms: run.elapsed_ms,
                });
                TaskReport::success(run.task_id.clone())
            }
            Err(message) => {
                task.record_failure(message.clone());
                tracing::warn!(plan_id = %plan_id, task_id = %run.task_id, error = %message, "task failed");
                self.events.emit(EngineEvent::TaskError {
                    plan_id,
                    task_id: run.task_id.clone(),
                    message: message.clone(),
                });
                TaskReport::failed(run.task_id.clone(), message)
            }
        };

        let deviation = if self.config.adaptive && report.error.is_none() {
            rescale_estimates(&mut plan.tasks, &run.task_id, self.config.replan_threshold)
        } else {
            None
        };

        Some(RunOutcome { report, deviation })
    }

    fn skip_unreachable(&self, plan: &mut Plan) {
        for task_id in TaskGraph::apply_cascading_skip(&mut plan.tasks) {
            tracing::info!(plan_id = %plan.id, task_id = %task_id, "skipping task with failed dependency");
        }
    }

    fn emit_start(&self, plan_id: Uuid, task: &Task) {
        tracing::info!(plan_id = %plan_id, task_id = %task.id, attempt = task.attempts, "task started");
        self.events.emit(EngineEvent::TaskStart {
            plan_id,
            task_id: task.id.clone(),
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

struct RunOutcome {
    report: TaskReport,
    deviation: Option<f64>,
}

enum DependencyState {
    Satisfied,
    Unavailable,
    Incomplete,
}

fn dependency_state(plan: &Plan, task: &Task) -> DependencyState {
    let mut state = DependencyState::Satisfied;
    for dep in &task.dependencies {
        match plan.task(dep).map(|t| t.status) {
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Failed | TaskStatus::Skipped) => return DependencyState::Unavailable,
            _ => state = DependencyState::Incomplete,
        }
    }
    state
}

fn start_task(task: &mut Task) -> Task {
    task.status = TaskStatus::InProgress;
    task.started_at = Some(Utc::now());
    task.attempts += 1;
    task.clone()
}

/// Waiting tasks left once the frontier is empty can never run.
fn block_stranded(plan: &mut Plan) {
    let plan_id = plan.id;
    for task in plan.tasks.iter_mut().filter(|t| t.status.is_waiting()) {
        tracing::warn!(plan_id = %plan_id, task_id = %task.id, "no runnable path, blocking task");
        task.status = TaskStatus::Blocked;
    }
}

async fn run_task(executor: &dyn Executor, task: Task) -> TaskRun {
    let started = Instant::now();
    let result = executor
        .execute(&task)
        .await
        .map_err(|e| format!("{e:#}"));
    TaskRun {
        task_id: task.id,
        result,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

/// Rescale waiting same-component estimates after a large deviation.
///
/// When `|actual - estimated| / estimated` for `completed_id` exceeds
/// `threshold`, every pending or ready task whose `component` tag equals the
/// completed task's tag has its estimate multiplied by `actual / estimated`.
/// Returns that ratio, or `None` when the deviation is within bounds or the
/// task has no estimate.
pub fn rescale_estimates(tasks: &mut [Task], completed_id: &str, threshold: f64) -> Option<f64> {
    let task = tasks.iter().find(|t| t.id == completed_id)?;
    let actual = task.actual_ms? as f64;
    if task.estimated_ms == 0 {
        return None;
    }
    let estimated = task.estimated_ms as f64;
    if (actual - estimated).abs() / estimated <= threshold {
        return None;
    }

    let ratio = actual / estimated;
    if let Some(component) = task.component().map(str::to_owned) {
        for other in tasks
            .iter_mut()
            .filter(|t| t.status.is_waiting() && t.component() == Some(component.as_str()))
        {
            other.estimated_ms = (other.estimated_ms as f64 * ratio).round() as u64;
        }
    }
    Some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: &str, estimated: u64, actual: u64, component: &str) -> Task {
        let mut task = Task::new(id, id).with_estimate(estimated).with_component(component);
        task.status = TaskStatus::Completed;
        task.actual_ms = Some(actual);
        task
    }

    #[test]
    fn rescale_applies_only_to_waiting_same_component_tasks() {
        let mut tasks = vec![
            finished("done", 100, 300, "api"),
            Task::new("same", "same").with_estimate(50).with_component("api"),
            Task::new("other", "other").with_estimate(50).with_component("ui"),
            Task::new("untagged", "untagged").with_estimate(50),
        ];
        let ratio = rescale_estimates(&mut tasks, "done", 0.5).expect("deviation of 2.0");
        assert!((ratio - 3.0).abs() < f64::EPSILON);
        assert_eq!(tasks[1].estimated_ms, 150);
        assert_eq!(tasks[2].estimated_ms, 50);
        assert_eq!(tasks[3].estimated_ms, 50);
    }

    #[test]
    fn component_match_is_exact() {
        let mut tasks = vec![
            finished("done", 100, 200, "api"),
            Task::new("near", "near").with_estimate(40).with_component("API"),
        ];
        rescale_estimates(&mut tasks, "done", 0.5).unwrap();
        assert_eq!(tasks[1].estimated_ms, 40);
    }

    #[test]
    fn small_deviation_is_ignored() {
        let mut tasks = vec![
            finished("done", 100, 140, "api"),
            Task::new("same", "same").with_estimate(50).with_component("api"),
        ];
        assert!(rescale_estimates(&mut tasks, "done", 0.5).is_none());
        assert_eq!(tasks[1].estimated_ms, 50);
    }

    #[test]
    fn zero_estimate_never_divides() {
        let mut tasks = vec![finished("done", 0, 500, "api")];
        assert!(rescale_estimates(&mut tasks, "done", 0.5).is_none());
    }

    #[test]
    fn control_reports_cancel_over_pause() {
        let control = ExecutionControl::new();
        assert!(control.interruption().is_none());
        control.pause();
        assert_eq!(control.interruption(), Some(StopReason::Paused));
        control.cancel();
        assert_eq!(control.interruption(), Some(StopReason::Cancelled));
        control.resume();
        assert!(control.is_cancelled());
    }
}
