//! Plan TOML parser with validation.
//!
//! Parses a `plan.toml` string into a [`PlanToml`] and validates:
//! - The goal is present and at least one task is defined.
//! - Task ids are unique and priorities are known.
//! - `depends_on` references point to existing task ids.
//! - The dependency graph is acyclic.

use std::collections::HashSet;

use thiserror::Error;

use crate::error::PivotError;
use crate::graph::TaskGraph;
use crate::model::Priority;

use super::toml_format::PlanToml;

/// Errors that can occur during plan parsing and validation.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("plan goal must not be empty")]
    EmptyGoal,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid priority {value:?} on task {task:?} (expected critical, high, medium, low, or optional)")]
    InvalidPriority { task: String, value: String },

    #[error("dependency cycle detected at task {0:?}")]
    CycleDetected(String),

    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("plan must contain at least one task")]
    NoTasks,
}

impl From<PlanParseError> for PivotError {
    fn from(err: PlanParseError) -> Self {
        match err {
            PlanParseError::CycleDetected(task) => PivotError::CircularDependency { task },
            other => PivotError::Validation(other.to_string()),
        }
    }
}

/// Parse and validate a `plan.toml` string.
pub fn parse_plan_toml(content: &str) -> Result<PlanToml, PlanParseError> {
    let plan: PlanToml = toml::from_str(content)?;
    validate(&plan)?;
    Ok(plan)
}

fn validate(plan: &PlanToml) -> Result<(), PlanParseError> {
    if plan.plan.goal.trim().is_empty() {
        return Err(PlanParseError::EmptyGoal);
    }
    if plan.tasks.is_empty() {
        return Err(PlanParseError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !seen.insert(task.key()) {
            return Err(PlanParseError::DuplicateTaskId(task.key().to_owned()));
        }
    }

    for task in &plan.tasks {
        if task.priority.parse::<Priority>().is_err() {
            return Err(PlanParseError::InvalidPriority {
                task: task.key().to_owned(),
                value: task.priority.clone(),
            });
        }
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanParseError::UnknownDependency {
                    task: task.key().to_owned(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(plan)
}

/// Reject dependency cycles with the ordering the scheduler uses.
fn check_for_cycles(plan: &PlanToml) -> Result<(), PlanParseError> {
    let tasks = plan.into_tasks()?;
    match TaskGraph::order(&tasks) {
        Ok(_) => Ok(()),
        Err(PivotError::CircularDependency { task }) => Err(PlanParseError::CycleDetected(task)),
        Err(other) => Err(PlanParseError::InvalidGraph(other.to_string())),
    }
}
