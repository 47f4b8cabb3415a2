//! Replan decisions and the strategies that apply them to a plan.
//!
//! Strategies are looked up by [`Decision`] in a [`StrategyRegistry`].
//! Registering a strategy for a decision that already has one replaces it,
//! so callers can override the built-in behavior.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alternatives::Alternative;
use crate::error::{PivotError, Result};
use crate::graph::TaskGraph;
use crate::model::{Plan, Task, TaskStatus};

/// How a replan changes the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    /// Swap the failed task's content for the proposal and run it again.
    Replace,
    /// Run the proposal as a new task before retrying the failed one.
    Insert,
    /// Skip everything that has not run yet.
    Abort,
    /// Restore the task list captured before the previous replan.
    Rollback,
}

impl Decision {
    pub const ALL: [Decision; 4] = [Self::Replace, Self::Insert, Self::Abort, Self::Rollback];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Insert => "insert",
            Self::Abort => "abort",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs a strategy may need. Which fields are required depends on the
/// decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplanContext<'a> {
    pub failed_task_id: Option<&'a str>,
    pub alternative: Option<&'a Alternative>,
    /// Task list captured before the previous replan of this plan.
    pub snapshot: Option<&'a [Task]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyOutcome {
    /// Whether the plan has runnable work again.
    pub resume: bool,
    pub notes: String,
    /// Ids of tasks the strategy created.
    pub added_tasks: Vec<String>,
}

pub trait ReplanStrategy: Send + Sync {
    fn decision(&self) -> Decision;

    fn apply(&self, plan: &mut Plan, ctx: &ReplanContext<'_>) -> Result<StrategyOutcome>;
}

// ---------------------------------------------------------------------------
// Built-in strategies
// ---------------------------------------------------------------------------

pub struct ReplaceStrategy;

impl ReplanStrategy for ReplaceStrategy {
    fn decision(&self) -> Decision {
        Decision::Replace
    }

    fn apply(&self, plan: &mut Plan, ctx: &ReplanContext<'_>) -> Result<StrategyOutcome> {
        let (task_id, alternative) = require_proposal(ctx, Decision::Replace)?;
        let task = plan
            .task_mut(task_id)
            .ok_or_else(|| PivotError::task_not_found(task_id))?;
        alternative.task.apply_to(task);
        task.reset();
        let reopened = reopen_dependents(plan, task_id);

        Ok(StrategyOutcome {
            resume: true,
            notes: format!(
                "replaced {task_id:?} with alternative {:?}; reopened {reopened} dependent(s)",
                alternative.id
            ),
            added_tasks: Vec::new(),
        })
    }
}

pub struct InsertStrategy;

impl ReplanStrategy for InsertStrategy {
    fn decision(&self) -> Decision {
        Decision::Insert
    }

    fn apply(&self, plan: &mut Plan, ctx: &ReplanContext<'_>) -> Result<StrategyOutcome> {
        let (task_id, alternative) = require_proposal(ctx, Decision::Insert)?;
        let failed = plan
            .task(task_id)
            .ok_or_else(|| PivotError::task_not_found(task_id))?;

        let prep_id = (1..)
            .map(|n| format!("{task_id}-prep-{n}"))
            .find(|id| plan.task(id).is_none())
            .unwrap_or_else(|| format!("{task_id}-prep"));

        let mut prep = Task::new(prep_id.clone(), alternative.task.name.clone())
            .with_priority(failed.priority)
            .with_dependencies(failed.dependencies.iter().cloned());
        prep.metadata = failed.metadata.clone();
        alternative.task.apply_to(&mut prep);

        let mut tasks = plan.tasks.clone();
        tasks.push(prep);
        if let Some(failed) = tasks.iter_mut().find(|t| t.id == task_id) {
            failed.dependencies.insert(prep_id.clone());
            failed.reset();
        }
        plan.tasks = TaskGraph::reorder(tasks)?;
        let reopened = reopen_dependents(plan, task_id);

        Ok(StrategyOutcome {
            resume: true,
            notes: format!(
                "inserted {prep_id:?} before {task_id:?} from alternative {:?}; reopened {reopened} dependent(s)",
                alternative.id
            ),
            added_tasks: vec![prep_id],
        })
    }
}

pub struct AbortStrategy;

impl ReplanStrategy for AbortStrategy {
    fn decision(&self) -> Decision {
        Decision::Abort
    }

    fn apply(&self, plan: &mut Plan, _ctx: &ReplanContext<'_>) -> Result<StrategyOutcome> {
        let mut skipped = 0;
        for task in plan.tasks.iter_mut().filter(|t| t.status.is_waiting()) {
            task.status = TaskStatus::Skipped;
            skipped += 1;
        }
        plan.aborted = true;
        Ok(StrategyOutcome {
            resume: false,
            notes: format!("aborted; skipped {skipped} waiting task(s)"),
            added_tasks: Vec::new(),
        })
    }
}

pub struct RollbackStrategy;

impl ReplanStrategy for RollbackStrategy {
    fn decision(&self) -> Decision {
        Decision::Rollback
    }

    fn apply(&self, plan: &mut Plan, ctx: &ReplanContext<'_>) -> Result<StrategyOutcome> {
        let snapshot = ctx.snapshot.ok_or_else(|| {
            PivotError::Validation("no earlier replan snapshot to roll back to".to_owned())
        })?;
        plan.tasks = snapshot.to_vec();
        plan.aborted = false;
        Ok(StrategyOutcome {
            resume: false,
            notes: format!("restored {} task(s) from snapshot", snapshot.len()),
            added_tasks: Vec::new(),
        })
    }
}

fn require_proposal<'a>(
    ctx: &ReplanContext<'a>,
    decision: Decision,
) -> Result<(&'a str, &'a Alternative)> {
    match (ctx.failed_task_id, ctx.alternative) {
        (Some(task_id), Some(alternative)) => Ok((task_id, alternative)),
        _ => Err(PivotError::Validation(format!(
            "{decision} needs a failed task and an alternative"
        ))),
    }
}

/// Reset skipped or blocked transitive dependents of `task_id` to pending.
fn reopen_dependents(plan: &mut Plan, task_id: &str) -> usize {
    let dependents = TaskGraph::dependents(&plan.tasks, task_id);
    let mut reopened = 0;
    for id in dependents {
        if let Some(task) = plan.task_mut(&id) {
            if matches!(task.status, TaskStatus::Skipped | TaskStatus::Blocked) {
                task.reset();
                reopened += 1;
            }
        }
    }
    reopened
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Strategies keyed by the decision they implement.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<Decision, Box<dyn ReplanStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the four built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ReplaceStrategy);
        registry.register(InsertStrategy);
        registry.register(AbortStrategy);
        registry.register(RollbackStrategy);
        registry
    }

    /// Register a strategy under [`ReplanStrategy::decision`], returning the
    /// one it replaces.
    pub fn register(
        &mut self,
        strategy: impl ReplanStrategy + 'static,
    ) -> Option<Box<dyn ReplanStrategy>> {
        self.strategies
            .insert(strategy.decision(), Box::new(strategy))
    }

    pub fn get(&self, decision: Decision) -> Option<&dyn ReplanStrategy> {
        self.strategies.get(&decision).map(|b| b.as_ref())
    }

    /// Registered decisions in declaration order.
    pub fn decisions(&self) -> Vec<Decision> {
        let mut decisions: Vec<_> = self.strategies.keys().copied().collect();
        decisions.sort();
        decisions
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("decisions", &self.decisions())
            .finish()
    }
}
