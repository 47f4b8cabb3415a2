//! Error taxonomy for the planning engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::PlanStatus;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum PivotError {
    /// Malformed plan or task definition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A dependency cycle was found while ordering tasks.
    #[error("circular dependency detected at task {task:?}")]
    CircularDependency { task: String },

    /// An operation referenced an unknown plan, task or event.
    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },

    /// A plan status change that the lifecycle does not allow.
    #[error("invalid transition for plan {plan_id}: {from} -> {to}")]
    InvalidTransition {
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
    },

    /// The plan is being executed and cannot be mutated right now.
    #[error("plan {0} is executing; mutations are rejected until it stops")]
    PlanBusy(Uuid),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PivotError {
    pub fn plan_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "plan",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    pub fn event_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "replan event",
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PivotError>;

/// Failures of the completion provider collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("completion request failed: {0}")]
    Request(String),

    #[error("provider reply did not match the expected schema: {0}")]
    Schema(String),

    #[error("operation {operation:?} is not supported by provider {provider:?}")]
    Unsupported { provider: String, operation: String },
}

/// An executor failure, captured on the task it belongs to.
///
/// Never propagated out of plan execution; dependents of the failed task
/// are skipped instead.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("task {task_id:?} failed: {message}")]
pub struct ExecutionError {
    pub task_id: String,
    pub message: String,
}
