use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ExecutionError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a plan.
///
/// Lifecycle:
///
/// ```text
/// draft     -> ready
/// ready     -> executing
/// executing -> completed | failed | paused
/// paused    -> executing
/// any non-terminal -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Ready,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether `self -> to` is an edge of the plan lifecycle.
    pub fn can_transition_to(self, to: PlanStatus) -> bool {
        if to == Self::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Self::Draft, Self::Ready)
                | (Self::Ready, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Failed)
                | (Self::Executing, Self::Paused)
                | (Self::Paused, Self::Executing)
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("plan status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Pending or ready: the task has not been dispatched yet.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Task priority. Ordered by urgency: `Critical < High < ... < Optional`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Optional,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Optional => "optional",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "optional" => Ok(Self::Optional),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

/// Error returned when parsing an unknown enum token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Outcome stored on a task once the executor returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Success { output: Value },
    Error(ExecutionError),
}

/// A unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Ids of tasks in the same plan that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub estimated_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Explicit goal, preferred over the description when replanning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Name of the capability the executor should use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Number of times the executor has been invoked for this task.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            dependencies: BTreeSet::new(),
            estimated_ms: 0,
            actual_ms: None,
            result: None,
            goal: None,
            skill: None,
            parameters: Map::new(),
            metadata: Map::new(),
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_estimate(mut self, estimated_ms: u64) -> Self {
        self.estimated_ms = estimated_ms;
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.metadata
            .insert("component".to_string(), Value::String(component.into()));
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>, parameters: Map<String, Value>) -> Self {
        self.skill = Some(skill.into());
        self.parameters = parameters;
        self
    }

    /// The `component` metadata tag, used for deviation propagation.
    pub fn component(&self) -> Option<&str> {
        self.metadata.get("component").and_then(Value::as_str)
    }

    /// The executor failure recorded on this task, if it failed.
    pub fn error(&self) -> Option<&ExecutionError> {
        match &self.result {
            Some(TaskResult::Error(err)) => Some(err),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error().map(|err| err.message.as_str())
    }

    /// Mark the task failed with `message`.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.result = Some(TaskResult::Error(ExecutionError {
            task_id: self.id.clone(),
            message: message.into(),
        }));
    }

    /// Clear execution state so the task can be dispatched again.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.actual_ms = None;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Aggregate counters for a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub estimated_ms: u64,
    pub actual_ms: u64,
    pub replan_count: u32,
}

/// An ordered collection of tasks pursuing a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub goal: String,
    pub status: PlanStatus,
    /// Always a valid topological order of the dependency edges.
    pub tasks: Vec<Task>,
    pub metrics: PlanMetrics,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Set by an abort decision; the plan can no longer complete until a
    /// rollback clears it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, tasks: Vec<Task>, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        let mut plan = Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            status: PlanStatus::Draft,
            tasks,
            metrics: PlanMetrics::default(),
            context,
            aborted: false,
            created_at: now,
            updated_at: now,
            started_at: None,
        };
        plan.refresh_metrics();
        plan
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
    }

    /// Recompute the aggregate counters from the task list.
    pub fn refresh_metrics(&mut self) {
        let replan_count = self.metrics.replan_count;
        self.metrics = PlanMetrics {
            total_tasks: self.tasks.len(),
            completed_tasks: self.count(TaskStatus::Completed),
            failed_tasks: self.count(TaskStatus::Failed),
            skipped_tasks: self.count(TaskStatus::Skipped),
            estimated_ms: self.tasks.iter().map(|t| t.estimated_ms).sum(),
            actual_ms: self.tasks.iter().filter_map(|t| t.actual_ms).sum(),
            replan_count,
        };
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
