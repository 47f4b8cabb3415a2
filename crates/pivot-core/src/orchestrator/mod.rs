//! Orchestrator facade: owns plan lifecycle, drives the scheduler, and
//! closes the replanning loop (monitor trigger -> alternatives -> decision
//! -> history).
//!
//! Each plan has a single writer at a time. While a plan is executing only
//! the scheduler and this facade touch its tasks; mutations are rejected
//! with [`PivotError::PlanBusy`]. Independent plans run without sharing any
//! lock beyond the monitor and history.

mod export;
mod store;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::alternatives::{AlternativeGenerator, GenerationContext, choose_decision};
use crate::config::EngineConfig;
use crate::error::{PivotError, ProviderError, Result};
use crate::evaluator::{Efficiency, Evaluation, Evaluator, ExecutionState};
use crate::events::{EngineEvent, EventBus};
use crate::graph::TaskGraph;
use crate::history::{
    EventFilter, History, HistoryMetrics, NewReplanEvent, ReplanEvent, ReplanOutcome,
};
use crate::model::{Plan, PlanStatus, Priority, Task, TaskStatus};
use crate::monitor::{Monitor, TaskReport, Trigger, TriggerType, WatchState};
use crate::plan::{decompose_goal, parse_plan_toml};
use crate::provider::CompletionProvider;
use crate::scheduler::{Executor, Scheduler, StopReason};
use crate::strategy::{Decision, ReplanContext, ReplanStrategy, StrategyRegistry};

pub use export::{ExportFormat, render_plan, render_plan_markdown};
pub use store::{PlanEntry, PlanStore};

/// Partial update for [`Orchestrator::modify_task`]. `None` leaves a field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub dependencies: Option<BTreeSet<String>>,
    pub estimated_ms: Option<u64>,
    pub component: Option<String>,
    pub goal: Option<String>,
    pub skill: Option<String>,
    pub parameters: Option<Map<String, Value>>,
}

impl TaskUpdate {
    fn apply(self, task: &mut Task) {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(dependencies) = self.dependencies {
            task.dependencies = dependencies;
        }
        if let Some(estimated_ms) = self.estimated_ms {
            task.estimated_ms = estimated_ms;
        }
        if let Some(component) = self.component {
            task.metadata
                .insert("component".to_string(), Value::String(component));
        }
        if let Some(goal) = self.goal {
            task.goal = Some(goal);
        }
        if let Some(skill) = self.skill {
            task.skill = Some(skill);
        }
        if let Some(parameters) = self.parameters {
            task.parameters = parameters;
        }
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    store: PlanStore,
    scheduler: Scheduler,
    monitor: Arc<Mutex<Monitor>>,
    evaluator: Evaluator,
    provider: Option<Arc<dyn CompletionProvider>>,
    generator: Option<AlternativeGenerator>,
    strategies: StrategyRegistry,
    history: Mutex<History>,
    events: EventBus,
    /// Task lists captured before each replan, keyed by replan event id.
    snapshots: Mutex<HashMap<Uuid, Vec<Task>>>,
    /// Triggers raised outside a run, handled when the plan's run ends.
    pending_triggers: Mutex<HashMap<Uuid, Vec<Trigger>>>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let monitor = Arc::new(Mutex::new(Monitor::new(
            config.monitor.clone(),
            events.clone(),
        )));
        let scheduler = Scheduler::new(config.scheduler.clone(), events.clone())
            .with_monitor(Arc::clone(&monitor));
        Ok(Self {
            store: PlanStore::new(),
            scheduler,
            monitor,
            evaluator: Evaluator::new(config.evaluator.clone()),
            provider: None,
            generator: None,
            strategies: StrategyRegistry::with_defaults(),
            history: Mutex::new(History::new(config.history.clone())),
            events,
            snapshots: Mutex::new(HashMap::new()),
            pending_triggers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Use `provider` for alternative generation and goal decomposition.
    /// Without one, replanning only offers the retry alternative.
    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.generator = Some(AlternativeGenerator::new(
            Arc::clone(&provider),
            self.config.alternatives.clone(),
        ));
        self.provider = Some(provider);
        self
    }

    /// Register or replace the strategy for a decision.
    pub fn with_strategy(mut self, strategy: impl ReplanStrategy + 'static) -> Self {
        self.strategies.register(strategy);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn monitor(&self) -> &Arc<Mutex<Monitor>> {
        &self.monitor
    }

    // -----------------------------------------------------------------------
    // Creation and lookup
    // -----------------------------------------------------------------------

    /// Validate and order `tasks` into a new ready plan.
    pub async fn create_plan(
        &self,
        goal: impl Into<String>,
        tasks: Vec<Task>,
        context: Map<String, Value>,
    ) -> Result<Uuid> {
        let goal = goal.into();
        self.events.emit(EngineEvent::PlanCreating { goal: goal.clone() });
        let tasks = TaskGraph::resolve(tasks)?;
        self.insert_plan(goal, tasks, context).await
    }

    /// Create a plan from a `plan.toml` document.
    pub async fn create_plan_from_toml(&self, content: &str) -> Result<Uuid> {
        let parsed = parse_plan_toml(content)?;
        let tasks = parsed.into_tasks()?;
        self.create_plan(parsed.plan.goal, tasks, parsed.plan.context)
            .await
    }

    /// Ask the completion provider to decompose `goal` into tasks.
    pub async fn create_plan_from_goal(
        &self,
        goal: impl Into<String>,
        context: Map<String, Value>,
    ) -> Result<Uuid> {
        let goal = goal.into();
        let Some(provider) = &self.provider else {
            return Err(ProviderError::Unsupported {
                provider: "none".to_owned(),
                operation: "decompose_goal".to_owned(),
            }
            .into());
        };
        self.events.emit(EngineEvent::PlanCreating { goal: goal.clone() });
        let tasks = decompose_goal(provider.as_ref(), &goal, &context).await?;
        self.insert_plan(goal, tasks, context).await
    }

    async fn insert_plan(
        &self,
        goal: String,
        tasks: Vec<Task>,
        context: Map<String, Value>,
    ) -> Result<Uuid> {
        let mut plan = Plan::new(goal, tasks, context);
        transition(&mut plan, PlanStatus::Ready)?;
        let plan_id = plan.id;
        let task_count = plan.tasks.len();
        self.store.insert(plan).await;
        tracing::info!(plan_id = %plan_id, task_count, "plan created");
        self.events.emit(EngineEvent::PlanCreated {
            plan_id,
            task_count,
        });
        Ok(plan_id)
    }

    /// A snapshot of the plan.
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await;
        Ok(plan.clone())
    }

    pub async fn plan_ids(&self) -> Vec<Uuid> {
        self.store.ids().await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Run a ready plan until it completes, fails, pauses or is cancelled.
    ///
    /// Structural problems (a dependency cycle) fail before any task runs.
    /// Executor failures never surface here: they are recorded on the task
    /// and the plan ends `failed`.
    pub async fn execute_plan(&self, plan_id: Uuid, executor: Arc<dyn Executor>) -> Result<Plan> {
        let entry = self.store.get(plan_id).await?;
        let watch = {
            let mut plan = entry.plan.lock().await;
            TaskGraph::order(&plan.tasks)?;
            transition(&mut plan, PlanStatus::Executing)?;
            plan.started_at = Some(Utc::now());
            watch_state(&plan)
        };
        tracing::info!(plan_id = %plan_id, "plan executing");
        self.events.emit(EngineEvent::PlanExecuting { plan_id });
        self.monitor
            .lock()
            .await
            .watch(&plan_id.to_string(), watch);
        self.drive(plan_id, &entry, &executor).await
    }

    /// Ask an executing plan to stop after the current wave.
    pub async fn pause_plan(&self, plan_id: Uuid) -> Result<()> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await;
        if plan.status != PlanStatus::Executing {
            return Err(PivotError::InvalidTransition {
                plan_id,
                from: plan.status,
                to: PlanStatus::Paused,
            });
        }
        entry.control.pause();
        tracing::info!(plan_id = %plan_id, "pause requested");
        Ok(())
    }

    /// Continue a paused plan.
    pub async fn resume_plan(&self, plan_id: Uuid, executor: Arc<dyn Executor>) -> Result<Plan> {
        let entry = self.store.get(plan_id).await?;
        {
            let mut plan = entry.plan.lock().await;
            if plan.status != PlanStatus::Paused {
                return Err(PivotError::InvalidTransition {
                    plan_id,
                    from: plan.status,
                    to: PlanStatus::Executing,
                });
            }
            transition(&mut plan, PlanStatus::Executing)?;
        }
        entry.control.resume();
        tracing::info!(plan_id = %plan_id, "plan resumed");
        self.events.emit(EngineEvent::PlanExecuting { plan_id });
        self.drive(plan_id, &entry, &executor).await
    }

    /// Cancel a plan: waiting tasks become skipped, in-flight tasks finish
    /// but no longer affect the outcome.
    pub async fn cancel_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let entry = self.store.get(plan_id).await?;
        let (snapshot, was_executing) = {
            let mut plan = entry.plan.lock().await;
            let was_executing = plan.status == PlanStatus::Executing;
            transition(&mut plan, PlanStatus::Cancelled)?;
            skip_waiting(&mut plan);
            plan.refresh_metrics();
            (plan.clone(), was_executing)
        };
        entry.control.cancel();
        tracing::info!(plan_id = %plan_id, "plan cancelled");
        self.events.emit(EngineEvent::PlanCancelled { plan_id });
        if !was_executing {
            self.release(plan_id).await;
        }
        Ok(snapshot)
    }

    /// Drop a finished plan from this orchestrator. Its replan events stay
    /// in the history but can no longer be rolled back.
    pub async fn remove_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await.clone();
        if !plan.status.is_terminal() {
            return Err(PivotError::Validation(format!(
                "plan {plan_id} is {}; only finished plans can be removed",
                plan.status
            )));
        }
        self.store.remove(plan_id).await;
        self.release(plan_id).await;
        {
            let history = self.history.lock().await;
            self.snapshots
                .lock()
                .await
                .retain(|id, _| history.get(*id).is_some_and(|e| e.plan_id() != plan_id));
        }
        tracing::info!(plan_id = %plan_id, "plan removed");
        Ok(plan)
    }

    async fn drive(
        &self,
        plan_id: Uuid,
        entry: &PlanEntry,
        executor: &Arc<dyn Executor>,
    ) -> Result<Plan> {
        loop {
            let report = self
                .scheduler
                .execute(&entry.plan, executor, &entry.control)
                .await;
            match report.stop {
                StopReason::Paused => return self.settle_paused(plan_id, entry).await,
                StopReason::Cancelled => return self.finish(plan_id, entry).await,
                StopReason::Finished => {}
            }
            if entry.plan.lock().await.status == PlanStatus::Cancelled {
                break;
            }

            let mut resumed = false;
            for trigger in self.replan_candidates(plan_id, &report.triggers).await {
                if !self.still_relevant(entry, &trigger).await {
                    continue;
                }
                match self.handle_trigger(plan_id, entry, trigger).await {
                    Some((_, true)) => {
                        resumed = true;
                        break;
                    }
                    Some((_, false)) => break,
                    None => {}
                }
            }
            if !resumed {
                break;
            }
            tracing::info!(plan_id = %plan_id, "re-running plan after replan");
        }
        self.finish(plan_id, entry).await
    }

    async fn settle_paused(&self, plan_id: Uuid, entry: &PlanEntry) -> Result<Plan> {
        let snapshot = {
            let mut plan = entry.plan.lock().await;
            if plan.status == PlanStatus::Executing {
                transition(&mut plan, PlanStatus::Paused)?;
            }
            plan.refresh_metrics();
            plan.clone()
        };
        tracing::info!(plan_id = %plan_id, "plan paused");
        self.events.emit(EngineEvent::PlanPaused { plan_id });
        Ok(snapshot)
    }

    async fn finish(&self, plan_id: Uuid, entry: &PlanEntry) -> Result<Plan> {
        entry.control.resume();
        let snapshot = {
            let mut plan = entry.plan.lock().await;
            if plan.status == PlanStatus::Cancelled {
                skip_waiting(&mut plan);
            } else if plan.aborted || plan.has_failures() {
                transition(&mut plan, PlanStatus::Failed)?;
            } else {
                transition(&mut plan, PlanStatus::Completed)?;
            }
            plan.refresh_metrics();
            plan.clone()
        };

        match snapshot.status {
            PlanStatus::Completed => {
                tracing::info!(plan_id = %plan_id, "plan completed");
                self.events.emit(EngineEvent::PlanCompleted { plan_id });
            }
            PlanStatus::Failed => {
                let mut message = format!(
                    "{} task(s) failed, {} skipped",
                    snapshot.metrics.failed_tasks, snapshot.metrics.skipped_tasks
                );
                if snapshot.aborted {
                    message.push_str("; aborted by replan");
                }
                tracing::warn!(plan_id = %plan_id, %message, "plan failed");
                self.events.emit(EngineEvent::PlanError { plan_id, message });
            }
            _ => {}
        }
        self.release(plan_id).await;
        Ok(snapshot)
    }

    /// Drop per-run state once a plan stops for good.
    async fn release(&self, plan_id: Uuid) {
        self.monitor.lock().await.unwatch(&plan_id.to_string());
        self.pending_triggers.lock().await.remove(&plan_id);
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn add_task(&self, plan_id: Uuid, task: Task) -> Result<()> {
        let entry = self.store.get(plan_id).await?;
        let mut plan = entry.plan.lock().await;
        ensure_mutable(&plan)?;
        TaskGraph::validate_task(&plan.tasks, &task)?;

        let task_id = task.id.clone();
        let mut tasks = plan.tasks.clone();
        tasks.push(task);
        let mut tasks = TaskGraph::reorder(tasks)?;
        TaskGraph::promote_ready(&mut tasks);
        plan.tasks = tasks;
        plan.refresh_metrics();

        tracing::info!(plan_id = %plan_id, task_id = %task_id, "task added");
        self.events.emit(EngineEvent::TaskAdded { plan_id, task_id });
        Ok(())
    }

    /// Remove a task and strip it from every dependency set.
    pub async fn remove_task(&self, plan_id: Uuid, task_id: &str) -> Result<Task> {
        let entry = self.store.get(plan_id).await?;
        let mut plan = entry.plan.lock().await;
        ensure_mutable(&plan)?;
        let pos = plan
            .position(task_id)
            .ok_or_else(|| PivotError::task_not_found(task_id))?;

        let removed = plan.tasks.remove(pos);
        for task in &mut plan.tasks {
            task.dependencies.remove(task_id);
        }
        TaskGraph::promote_ready(&mut plan.tasks);
        plan.refresh_metrics();

        tracing::info!(plan_id = %plan_id, task_id = %task_id, "task removed");
        self.events.emit(EngineEvent::TaskRemoved {
            plan_id,
            task_id: task_id.to_owned(),
        });
        Ok(removed)
    }

    /// Put tasks in the given order. `order` must name every task exactly
    /// once and keep dependencies ahead of their dependents.
    pub async fn reorder_tasks(&self, plan_id: Uuid, order: &[String]) -> Result<()> {
        let entry = self.store.get(plan_id).await?;
        let mut plan = entry.plan.lock().await;
        ensure_mutable(&plan)?;

        let unique: HashSet<&str> = order.iter().map(String::as_str).collect();
        if order.len() != plan.tasks.len() || unique.len() != order.len() {
            return Err(PivotError::Validation(format!(
                "reorder must list each of the {} tasks exactly once",
                plan.tasks.len()
            )));
        }
        let mut reordered = Vec::with_capacity(order.len());
        for id in order {
            let task = plan
                .task(id)
                .cloned()
                .ok_or_else(|| PivotError::task_not_found(id.as_str()))?;
            reordered.push(task);
        }
        if !TaskGraph::is_topological(&reordered) {
            return Err(PivotError::Validation(
                "reorder would place a task before one of its dependencies".to_owned(),
            ));
        }
        plan.tasks = reordered;
        plan.refresh_metrics();
        tracing::debug!(plan_id = %plan_id, "tasks reordered");
        Ok(())
    }

    /// Apply `update` to a task. On any validation failure, including a
    /// dependency cycle, the plan is left unchanged.
    pub async fn modify_task(&self, plan_id: Uuid, task_id: &str, update: TaskUpdate) -> Result<Task> {
        let entry = self.store.get(plan_id).await?;
        let mut plan = entry.plan.lock().await;
        ensure_mutable(&plan)?;

        let mut tasks = plan.tasks.clone();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| PivotError::task_not_found(task_id))?;
        update.apply(task);

        TaskGraph::validate(&tasks)?;
        let mut tasks = TaskGraph::reorder(tasks)?;
        for task in tasks.iter_mut().filter(|t| t.status.is_waiting()) {
            task.status = TaskStatus::Pending;
        }
        TaskGraph::promote_ready(&mut tasks);
        plan.tasks = tasks;
        plan.refresh_metrics();

        tracing::info!(plan_id = %plan_id, task_id = %task_id, "task modified");
        plan.task(task_id)
            .cloned()
            .ok_or_else(|| PivotError::task_not_found(task_id))
    }

    // -----------------------------------------------------------------------
    // Monitoring and replanning
    // -----------------------------------------------------------------------

    /// Feed an externally observed outcome (e.g. a timeout seen by a
    /// supervisor) into the monitor. A resulting trigger is queued and
    /// handled when the plan's current run ends.
    pub async fn report_result(&self, plan_id: Uuid, report: TaskReport) -> Result<Option<Trigger>> {
        self.store.get(plan_id).await?;
        let trigger = self
            .monitor
            .lock()
            .await
            .report_result(&plan_id.to_string(), &report);
        if let Some(trigger) = &trigger {
            self.queue_trigger(plan_id, trigger.clone()).await;
        }
        Ok(trigger)
    }

    /// Raise a human-request trigger. Ready or paused plans are replanned
    /// immediately; executing plans handle it when the current run ends.
    pub async fn request_replan(&self, plan_id: Uuid, reason: &str) -> Result<Option<ReplanEvent>> {
        let entry = self.store.get(plan_id).await?;
        let status = entry.plan.lock().await.status;
        if status.is_terminal() {
            return Err(PivotError::Validation(format!(
                "plan {plan_id} is {status}; nothing to replan"
            )));
        }
        let Some(trigger) = self
            .monitor
            .lock()
            .await
            .request_replan(&plan_id.to_string(), reason)
        else {
            return Ok(None);
        };
        if status == PlanStatus::Executing {
            tracing::info!(plan_id = %plan_id, "replan request queued until the run ends");
            self.queue_trigger(plan_id, trigger).await;
            return Ok(None);
        }
        Ok(self
            .handle_trigger(plan_id, &entry, trigger)
            .await
            .map(|(event, _)| event))
    }

    async fn queue_trigger(&self, plan_id: Uuid, trigger: Trigger) {
        self.pending_triggers
            .lock()
            .await
            .entry(plan_id)
            .or_default()
            .push(trigger);
    }

    /// Queued triggers plus those raised during the run that should lead
    /// to a replan.
    async fn replan_candidates(&self, plan_id: Uuid, raised: &[Trigger]) -> Vec<Trigger> {
        let queued = self
            .pending_triggers
            .lock()
            .await
            .remove(&plan_id)
            .unwrap_or_default();
        queued
            .into_iter()
            .chain(raised.iter().cloned())
            .filter(|t| match t.kind() {
                TriggerType::HumanRequest => true,
                TriggerType::TaskFailed | TriggerType::Timeout => self.config.replan.auto_replan,
                TriggerType::Deviation => false,
            })
            .collect()
    }

    /// A trigger about a task that is no longer failed has been dealt with.
    async fn still_relevant(&self, entry: &PlanEntry, trigger: &Trigger) -> bool {
        let Some(task_id) = trigger.task_id() else {
            return true;
        };
        let plan = entry.plan.lock().await;
        plan.task(task_id)
            .is_some_and(|t| t.status == TaskStatus::Failed)
    }

    /// Generate alternatives, choose and apply a decision, and record it.
    ///
    /// Returns the recorded event and whether the plan has runnable work
    /// again, or `None` when the plan's replan budget is spent.
    async fn handle_trigger(
        &self,
        plan_id: Uuid,
        entry: &PlanEntry,
        trigger: Trigger,
    ) -> Option<(ReplanEvent, bool)> {
        let (failed, context) = {
            let plan = entry.plan.lock().await;
            if plan.metrics.replan_count >= self.config.replan.max_replans {
                tracing::warn!(
                    plan_id = %plan_id,
                    max_replans = self.config.replan.max_replans,
                    "replan budget exhausted, ignoring trigger"
                );
                return None;
            }
            let failed = match trigger.task_id() {
                Some(id) => plan.task(id).cloned(),
                None => plan
                    .tasks
                    .iter()
                    .find(|t| t.status == TaskStatus::Failed)
                    .cloned(),
            };
            let context = GenerationContext {
                plan_goal: Some(plan.goal.clone()),
                plan_context: plan.context.clone(),
                error: failed
                    .as_ref()
                    .and_then(|t| t.error_message().map(str::to_owned)),
                trigger: Some(trigger.kind()),
                completed: plan
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .map(|t| t.name.clone())
                    .collect(),
            };
            (failed, context)
        };

        tracing::info!(
            plan_id = %plan_id,
            trigger = %trigger.kind(),
            task_id = ?failed.as_ref().map(|t| t.id.as_str()),
            "handling replan trigger"
        );
        self.events.emit(EngineEvent::PlanReplanTrigger {
            plan_id,
            trigger: trigger.clone(),
        });

        let mut notes = Vec::new();
        let alternatives = match (&failed, &self.generator) {
            (None, _) => Vec::new(),
            (Some(task), None) => AlternativeGenerator::retry_only(task, &self.config.alternatives),
            (Some(task), Some(generator)) => {
                match generator.generate_alternatives(task, &context).await {
                    Ok(alternatives) => alternatives,
                    Err(e) => {
                        tracing::warn!(plan_id = %plan_id, task_id = %task.id, error = %e, "no alternatives available");
                        notes.push(format!("alternative generation failed: {e}"));
                        Vec::new()
                    }
                }
            }
        };
        let generation_failed = !notes.is_empty();
        let decision = choose_decision(&alternatives);
        let top = alternatives.first();
        let snapshot = if decision == Decision::Rollback {
            self.latest_snapshot(plan_id).await
        } else {
            None
        };

        let (success, resume, before) = {
            let mut plan = entry.plan.lock().await;
            let before = plan.tasks.clone();
            let ctx = ReplanContext {
                failed_task_id: failed.as_ref().map(|t| t.id.as_str()),
                alternative: top,
                snapshot: snapshot.as_deref(),
            };
            let result = match self.strategies.get(decision) {
                Some(strategy) => strategy.apply(&mut plan, &ctx),
                None => Err(PivotError::Validation(format!(
                    "no strategy registered for {decision}"
                ))),
            };
            plan.metrics.replan_count += 1;
            let (success, resume) = match result {
                Ok(outcome) => {
                    notes.push(outcome.notes);
                    for task_id in outcome.added_tasks {
                        self.events.emit(EngineEvent::TaskAdded { plan_id, task_id });
                    }
                    (!generation_failed, outcome.resume)
                }
                Err(e) => {
                    tracing::warn!(plan_id = %plan_id, %decision, error = %e, "replan strategy failed");
                    plan.tasks = before.clone();
                    notes.push(format!("{decision} failed: {e}"));
                    (false, false)
                }
            };
            plan.refresh_metrics();
            (success, resume, before)
        };

        let event = {
            let mut history = self.history.lock().await;
            let event = history.record(NewReplanEvent {
                trigger,
                decision,
                plan_id,
                failed_task_id: failed.map(|t| t.id),
                alternative_id: top.map(|a| a.id.clone()),
                outcome: ReplanOutcome {
                    success,
                    notes: notes.join("; "),
                },
            });
            let mut snapshots = self.snapshots.lock().await;
            snapshots.insert(event.id(), before);
            snapshots.retain(|id, _| history.get(*id).is_some());
            event
        };
        Some((event, resume))
    }

    /// Task list captured before the most recent, not rolled back, replan
    /// of `plan_id`.
    async fn latest_snapshot(&self, plan_id: Uuid) -> Option<Vec<Task>> {
        let history = self.history.lock().await;
        let snapshots = self.snapshots.lock().await;
        let filter = EventFilter {
            plan_id: Some(plan_id),
            ..EventFilter::default()
        };
        history
            .get_events(&filter)
            .into_iter()
            .rev()
            .filter(|e| !e.is_rolled_back())
            .find_map(|e| snapshots.get(&e.id()).cloned())
    }

    /// Mark a replan event rolled back and restore the task list captured
    /// before it.
    pub async fn rollback_replan(&self, event_id: Uuid) -> Result<ReplanEvent> {
        let plan_id = self
            .history
            .lock()
            .await
            .get(event_id)
            .map(|e| e.plan_id())
            .ok_or_else(|| PivotError::event_not_found(event_id))?;
        let tasks = self
            .snapshots
            .lock()
            .await
            .get(&event_id)
            .cloned()
            .ok_or_else(|| {
                PivotError::Validation(format!("no task snapshot recorded for replan {event_id}"))
            })?;

        let entry = self.store.get(plan_id).await?;
        let mut plan = entry.plan.lock().await;
        if plan.status == PlanStatus::Executing {
            return Err(PivotError::PlanBusy(plan_id));
        }
        let event = self.history.lock().await.rollback(event_id)?.clone();
        plan.tasks = tasks;
        plan.aborted = false;
        plan.refresh_metrics();
        tracing::info!(plan_id = %plan_id, event_id = %event_id, "replan rolled back");
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Evaluation, history and reports
    // -----------------------------------------------------------------------

    pub async fn evaluate_plan(&self, plan_id: Uuid) -> Result<Evaluation> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await;
        Ok(self
            .evaluator
            .evaluate(&plan, &ExecutionState::from_plan(&plan)))
    }

    pub async fn plan_efficiency(&self, plan_id: Uuid) -> Result<Efficiency> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await;
        Ok(self
            .evaluator
            .calculate_efficiency(&ExecutionState::from_plan(&plan)))
    }

    pub async fn history_events(&self, filter: &EventFilter) -> Vec<ReplanEvent> {
        self.history
            .lock()
            .await
            .get_events(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn history_metrics(&self) -> HistoryMetrics {
        self.history.lock().await.metrics()
    }

    pub async fn export_history(&self, format: ExportFormat) -> String {
        let history = self.history.lock().await;
        match format {
            ExportFormat::Markdown => history.export_markdown(),
            ExportFormat::Json => history.export_json(),
        }
    }

    /// Replace the history with an exported one. Returns the number of
    /// events loaded.
    pub async fn import_history(&self, content: &str, format: ExportFormat) -> Result<usize> {
        let config = self.config.history.clone();
        let imported = match format {
            ExportFormat::Markdown => History::import_markdown(content, config)?,
            ExportFormat::Json => History::import_json(content, config)?,
        };
        let count = imported.len();
        let mut history = self.history.lock().await;
        *history = imported;
        self.snapshots
            .lock()
            .await
            .retain(|id, _| history.get(*id).is_some());
        tracing::info!(events = count, "history imported");
        Ok(count)
    }

    /// Render the plan as Markdown or JSON. Works in every plan status.
    pub async fn export_plan(&self, plan_id: Uuid, format: ExportFormat) -> Result<String> {
        let entry = self.store.get(plan_id).await?;
        let plan = entry.plan.lock().await;
        Ok(render_plan(&plan, format))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_owned()))
            .field("strategies", &self.strategies)
            .finish()
    }
}

fn transition(plan: &mut Plan, to: PlanStatus) -> Result<()> {
    if !plan.status.can_transition_to(to) {
        return Err(PivotError::InvalidTransition {
            plan_id: plan.id,
            from: plan.status,
            to,
        });
    }
    tracing::debug!(plan_id = %plan.id, from = %plan.status, to = %to, "plan transition");
    plan.status = to;
    plan.updated_at = Utc::now();
    Ok(())
}

fn ensure_mutable(plan: &Plan) -> Result<()> {
    match plan.status {
        PlanStatus::Executing => Err(PivotError::PlanBusy(plan.id)),
        status if status.is_terminal() => Err(PivotError::Validation(format!(
            "plan {} is {status}; its tasks can no longer change",
            plan.id
        ))),
        _ => Ok(()),
    }
}

fn skip_waiting(plan: &mut Plan) {
    for task in plan.tasks.iter_mut().filter(|t| t.status.is_waiting()) {
        task.status = TaskStatus::Skipped;
    }
}

fn watch_state(plan: &Plan) -> WatchState {
    let ids = |pred: fn(TaskStatus) -> bool| -> BTreeSet<String> {
        plan.tasks
            .iter()
            .filter(|t| pred(t.status))
            .map(|t| t.id.clone())
            .collect()
    };
    WatchState {
        pending: ids(TaskStatus::is_waiting),
        completed: ids(|s| s == TaskStatus::Completed),
        failed: ids(|s| s == TaskStatus::Failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_update_touches_only_given_fields() {
        let mut task = Task::new("a", "Alpha")
            .with_description("first")
            .with_estimate(10);
        TaskUpdate {
            priority: Some(Priority::Critical),
            component: Some("api".into()),
            ..TaskUpdate::default()
        }
        .apply(&mut task);

        assert_eq!(task.name, "Alpha");
        assert_eq!(task.description, "first");
        assert_eq!(task.estimated_ms, 10);
        assert_eq!(task.priority, Priority::Critical);
        assert_eq!(task.component(), Some("api"));
    }

    #[test]
    fn mutability_follows_plan_status() {
        let mut plan = Plan::new("g", Vec::new(), Map::new());
        assert!(ensure_mutable(&plan).is_ok());
        plan.status = PlanStatus::Executing;
        assert!(matches!(ensure_mutable(&plan), Err(PivotError::PlanBusy(_))));
        plan.status = PlanStatus::Paused;
        assert!(ensure_mutable(&plan).is_ok());
        plan.status = PlanStatus::Cancelled;
        assert!(matches!(ensure_mutable(&plan), Err(PivotError::Validation(_))));
    }

    #[test]
    fn watch_state_partitions_tasks() {
        let mut done = Task::new("done", "Done");
        done.status = TaskStatus::Completed;
        let mut broken = Task::new("broken", "Broken");
        broken.status = TaskStatus::Failed;
        let plan = Plan::new(
            "g",
            vec![done, broken, Task::new("next", "Next")],
            Map::new(),
        );

        let state = watch_state(&plan);
        assert!(state.completed.contains("done"));
        assert!(state.failed.contains("broken"));
        assert!(state.pending.contains("next"));
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn transition_rejects_lifecycle_violations() {
        let mut plan = Plan::new("g", Vec::new(), Map::new());
        assert!(transition(&mut plan, PlanStatus::Executing).is_err());
        transition(&mut plan, PlanStatus::Ready).unwrap();
        transition(&mut plan, PlanStatus::Executing).unwrap();
        assert_eq!(plan.status, PlanStatus::Executing);
    }
}
