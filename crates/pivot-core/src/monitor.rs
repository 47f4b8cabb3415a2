//! Execution monitor: ingests per-task outcomes for watched contexts and
//! classifies them into replan [`Trigger`]s.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Kind of condition that proposes a replan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    TaskFailed,
    Timeout,
    Deviation,
    HumanRequest,
}

impl TriggerType {
    pub const ALL: [TriggerType; 4] = [
        Self::TaskFailed,
        Self::Timeout,
        Self::Deviation,
        Self::HumanRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskFailed => "task-failed",
            Self::Timeout => "timeout",
            Self::Deviation => "deviation",
            Self::HumanRequest => "human-request",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the trigger is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPayload {
    Task {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Deviation {
        task_id: String,
        ratio: f64,
    },
    Request {
        reason: String,
    },
}

/// A detected condition proposing a replan. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    id: Uuid,
    #[serde(rename = "type")]
    kind: TriggerType,
    context_id: String,
    payload: TriggerPayload,
    timestamp: DateTime<Utc>,
}

impl Trigger {
    fn new(kind: TriggerType, context_id: &str, payload: TriggerPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            context_id: context_id.to_owned(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn task_failed(context_id: &str, task_id: &str, error: Option<String>) -> Self {
        Self::new(
            TriggerType::TaskFailed,
            context_id,
            TriggerPayload::Task {
                task_id: task_id.to_owned(),
                error,
            },
        )
    }

    pub fn timeout(context_id: &str, task_id: &str) -> Self {
        Self::new(
            TriggerType::Timeout,
            context_id,
            TriggerPayload::Task {
                task_id: task_id.to_owned(),
                error: None,
            },
        )
    }

    pub fn deviation(context_id: &str, task_id: &str, ratio: f64) -> Self {
        Self::new(
            TriggerType::Deviation,
            context_id,
            TriggerPayload::Deviation {
                task_id: task_id.to_owned(),
                ratio,
            },
        )
    }

    pub fn human_request(context_id: &str, reason: &str) -> Self {
        Self::new(
            TriggerType::HumanRequest,
            context_id,
            TriggerPayload::Request {
                reason: reason.to_owned(),
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TriggerType {
        self.kind
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn payload(&self) -> &TriggerPayload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The task the trigger refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match &self.payload {
            TriggerPayload::Task { task_id, .. } | TriggerPayload::Deviation { task_id, .. } => {
                Some(task_id)
            }
            TriggerPayload::Request { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Failures within one context before a `task-failed` trigger fires.
    pub failure_threshold: u32,
    pub enabled_triggers: BTreeSet<TriggerType>,
    /// Reset the failure counter when a success is reported.
    pub reset_on_success: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            enabled_triggers: TriggerType::ALL.into_iter().collect(),
            reset_on_success: false,
        }
    }
}

/// Reported outcome of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: String,
    pub status: ReportStatus,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn success(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ReportStatus::Success,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ReportStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn timeout(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ReportStatus::Timeout,
            error: None,
        }
    }
}

/// Initial task sets handed to [`Monitor::watch`].
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    pub pending: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

/// Tracked state of one watched run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub context_id: String,
    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    /// Failures since the last trigger (or success, if configured).
    pub failure_count: u32,
    /// Times each task was reported again after a failure.
    pub retries: HashMap<String, u32>,
}

impl ExecutionContext {
    pub fn total_retries(&self) -> u32 {
        self.retries.values().sum()
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct Monitor {
    config: MonitorConfig,
    contexts: HashMap<String, ExecutionContext>,
    events: EventBus,
}

impl Monitor {
    pub fn new(config: MonitorConfig, events: EventBus) -> Self {
        Self {
            config,
            contexts: HashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Begin tracking `context_id`. Re-watching replaces the old state.
    pub fn watch(&mut self, context_id: &str, initial: WatchState) {
        let context = ExecutionContext {
            context_id: context_id.to_owned(),
            completed: initial.completed,
            pending: initial.pending,
            failed: initial.failed,
            started_at: Utc::now(),
            failure_count: 0,
            retries: HashMap::new(),
        };
        self.contexts.insert(context_id.to_owned(), context);
        tracing::debug!(context_id, "watch started");
        self.events.emit(EngineEvent::WatchStarted {
            context_id: context_id.to_owned(),
        });
    }

    /// Stop tracking `context_id`, returning its final state.
    pub fn unwatch(&mut self, context_id: &str) -> Option<ExecutionContext> {
        let removed = self.contexts.remove(context_id);
        if removed.is_some() {
            self.events.emit(EngineEvent::WatchStopped {
                context_id: context_id.to_owned(),
            });
        }
        removed
    }

    /// True while at least one context is being watched.
    pub fn is_watching(&self) -> bool {
        !self.contexts.is_empty()
    }

    pub fn is_watching_context(&self, context_id: &str) -> bool {
        self.contexts.contains_key(context_id)
    }

    pub fn context(&self, context_id: &str) -> Option<&ExecutionContext> {
        self.contexts.get(context_id)
    }

    /// Ingest one task outcome and return the trigger it caused, if any.
    pub fn report_result(&mut self, context_id: &str, report: &TaskReport) -> Option<Trigger> {
        let threshold = self.config.failure_threshold;
        let reset_on_success = self.config.reset_on_success;
        let failed_enabled = self.is_enabled(TriggerType::TaskFailed);
        let timeout_enabled = self.is_enabled(TriggerType::Timeout);

        let Some(context) = self.contexts.get_mut(context_id) else {
            tracing::warn!(context_id, task_id = %report.task_id, "result reported for unwatched context");
            return None;
        };

        let task_id = report.task_id.as_str();
        if context.failed.contains(task_id) {
            *context.retries.entry(task_id.to_owned()).or_insert(0) += 1;
        }
        context.pending.remove(task_id);

        let trigger = match report.status {
            ReportStatus::Success => {
                context.failed.remove(task_id);
                context.completed.insert(task_id.to_owned());
                if reset_on_success {
                    context.failure_count = 0;
                }
                None
            }
            ReportStatus::Failed => {
                context.failed.insert(task_id.to_owned());
                context.failure_count += 1;
                if context.failure_count >= threshold && failed_enabled {
                    context.failure_count = 0;
                    Some(Trigger::task_failed(context_id, task_id, report.error.clone()))
                } else {
                    None
                }
            }
            ReportStatus::Timeout => {
                context.failed.insert(task_id.to_owned());
                timeout_enabled.then(|| Trigger::timeout(context_id, task_id))
            }
        };

        if let Some(trigger) = &trigger {
            self.publish(trigger);
        }
        trigger
    }

    /// Raise a `human-request` trigger immediately, bypassing counters.
    pub fn request_replan(&mut self, context_id: &str, reason: &str) -> Option<Trigger> {
        if !self.is_enabled(TriggerType::HumanRequest) {
            tracing::info!(context_id, "human-request triggers are disabled");
            return None;
        }
        let trigger = Trigger::human_request(context_id, reason);
        self.publish(&trigger);
        Some(trigger)
    }

    fn is_enabled(&self, kind: TriggerType) -> bool {
        self.config.enabled_triggers.contains(&kind)
    }

    fn publish(&self, trigger: &Trigger) {
        tracing::info!(
            context_id = trigger.context_id(),
            trigger = %trigger.kind(),
            "replan trigger raised"
        );
        self.events.emit(EngineEvent::Trigger {
            trigger: trigger.clone(),
        });
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .field("contexts", &self.contexts.keys().collect::<Vec<_>>())
            .finish()
    }
}
