//! Typed engine events and the bus they are published on.
//!
//! Delivery is asynchronous: [`EventBus::emit`] enqueues the event on a
//! broadcast channel before returning, and every subscriber created before
//! the call receives it from its own receiver. Emitting with no
//! subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::monitor::Trigger;

const CHANNEL_CAPACITY: usize = 1024;

/// Consumer-visible lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PlanCreating { goal: String },
    PlanCreated { plan_id: Uuid, task_count: usize },
    PlanExecuting { plan_id: Uuid },
    PlanCompleted { plan_id: Uuid },
    PlanError { plan_id: Uuid, message: String },
    PlanPaused { plan_id: Uuid },
    PlanCancelled { plan_id: Uuid },
    TaskStart { plan_id: Uuid, task_id: String },
    TaskComplete { plan_id: Uuid, task_id: String, actual_ms: u64 },
    TaskError { plan_id: Uuid, task_id: String, message: String },
    TaskAdded { plan_id: Uuid, task_id: String },
    TaskRemoved { plan_id: Uuid, task_id: String },
    PlanReplanTrigger { plan_id: Uuid, trigger: Trigger },
    Trigger { trigger: Trigger },
    WatchStarted { context_id: String },
    WatchStopped { context_id: String },
}

impl EngineEvent {
    /// The wire name consumers match on, e.g. `plan:created`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanCreating { .. } => "plan:creating",
            Self::PlanCreated { .. } => "plan:created",
            Self::PlanExecuting { .. } => "plan:executing",
            Self::PlanCompleted { .. } => "plan:completed",
            Self::PlanError { .. } => "plan:error",
            Self::PlanPaused { .. } => "plan:paused",
            Self::PlanCancelled { .. } => "plan:cancelled",
            Self::TaskStart { .. } => "task:start",
            Self::TaskComplete { .. } => "task:complete",
            Self::TaskError { .. } => "task:error",
            Self::TaskAdded { .. } => "task:added",
            Self::TaskRemoved { .. } => "task:removed",
            Self::PlanReplanTrigger { .. } => "plan:replan-trigger",
            Self::Trigger { .. } => "trigger",
            Self::WatchStarted { .. } => "watch:started",
            Self::WatchStopped { .. } => "watch:stopped",
        }
    }
}

/// Fire-and-forget fan-out of [`EngineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!(event = event.name(), "engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let plan_id = Uuid::new_v4();
        bus.emit(EngineEvent::PlanExecuting { plan_id });

        let event = rx.try_recv().expect("event should be queued");
        assert_eq!(event.name(), "plan:executing");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::WatchStopped {
            context_id: "ctx".into(),
        });
    }

    #[test]
    fn clones_share_the_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.clone().emit(EngineEvent::PlanCreating { goal: "g".into() });
        assert_eq!(rx.try_recv().unwrap().name(), "plan:creating");
    }
}
