//! Progress, health and efficiency metrics for a plan under execution.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{Plan, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Failure rate at which the plan is at risk and replanning is advised.
    pub failure_rate_threshold: f64,
    /// Failure rate at which the plan is critical.
    pub critical_failure_rate: f64,
    /// Elapsed/estimated ratio above which the plan is running late.
    pub time_overrun_ratio: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.2,
            critical_failure_rate: 0.5,
            time_overrun_ratio: 1.5,
        }
    }
}

/// Percentage of work done, rounded. An empty plan counts as done.
pub fn calculate_progress(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u32
}

/// Snapshot of execution state the evaluator works from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionState {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
    pub estimated_ms: u64,
    /// Actual durations of completed tasks.
    pub durations_ms: Vec<u64>,
    pub retries: u32,
    pub total_attempts: u32,
}

impl ExecutionState {
    /// Derive the state from a plan. Elapsed time runs from `started_at` to
    /// now, or zero for a plan that never started.
    pub fn from_plan(plan: &Plan) -> Self {
        let elapsed_ms = plan
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        Self {
            total: plan.tasks.len(),
            completed: plan.count(TaskStatus::Completed),
            failed: plan.count(TaskStatus::Failed),
            skipped: plan.count(TaskStatus::Skipped),
            elapsed_ms,
            estimated_ms: plan.tasks.iter().map(|t| t.estimated_ms).sum(),
            durations_ms: plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .filter_map(|t| t.actual_ms)
                .collect(),
            retries: plan.tasks.iter().map(|t| t.attempts.saturating_sub(1)).sum(),
            total_attempts: plan.tasks.iter().map(|t| t.attempts).sum(),
        }
    }

    pub fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.completed + self.failed + self.skipped)
    }

    /// `failed / (completed + failed)`, zero before any task finished.
    pub fn failure_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percentage: u32,
    pub completed: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Healthy,
    AtRisk,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub failure_rate: f64,
    /// Elapsed over estimated time; zero when nothing was estimated.
    pub time_ratio: f64,
    pub elapsed_ms: u64,
    pub estimated_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationKind {
    Replan,
    Abort,
    Reestimate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub progress: Progress,
    pub health: Health,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Efficiency {
    /// Mean duration of completed tasks, if any completed.
    pub mean_duration_ms: Option<f64>,
    /// `retries / total_attempts`, zero before any attempt.
    pub retry_rate: f64,
    pub completed_tasks: usize,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn evaluate(&self, plan: &Plan, state: &ExecutionState) -> Evaluation {
        let progress = Progress {
            percentage: calculate_progress(state.completed, state.total),
            completed: state.completed,
            pending: state.pending(),
            failed: state.failed,
            skipped: state.skipped,
            total: state.total,
        };

        let failure_rate = state.failure_rate();
        let time_ratio = if state.estimated_ms == 0 {
            0.0
        } else {
            state.elapsed_ms as f64 / state.estimated_ms as f64
        };
        let overrun = time_ratio > self.config.time_overrun_ratio;

        let status = if failure_rate >= self.config.critical_failure_rate && state.failed > 0 {
            HealthStatus::Critical
        } else if (failure_rate >= self.config.failure_rate_threshold && state.failed > 0) || overrun
        {
            HealthStatus::AtRisk
        } else {
            HealthStatus::Healthy
        };

        let mut recommendations = Vec::new();
        if state.failed > 0 && failure_rate >= self.config.failure_rate_threshold {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Replan,
                message: format!(
                    "failure rate {:.0}% exceeds {:.0}%; generate alternatives for the failed tasks",
                    failure_rate * 100.0,
                    self.config.failure_rate_threshold * 100.0
                ),
            });
        }
        if status == HealthStatus::Critical {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Abort,
                message: format!("plan {:?} is critical; consider aborting", plan.goal),
            });
        }
        if overrun {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Reestimate,
                message: format!(
                    "elapsed time is {time_ratio:.1}x the estimate; re-estimate remaining tasks"
                ),
            });
        }

        tracing::debug!(
            plan_id = %plan.id,
            percentage = progress.percentage,
            failure_rate,
            ?status,
            "plan evaluated"
        );

        Evaluation {
            progress,
            health: Health {
                status,
                failure_rate,
                time_ratio,
                elapsed_ms: state.elapsed_ms,
                estimated_ms: state.estimated_ms,
            },
            recommendations,
        }
    }

    pub fn calculate_efficiency(&self, state: &ExecutionState) -> Efficiency {
        let mean_duration_ms = if state.durations_ms.is_empty() {
            None
        } else {
            let sum: u64 = state.durations_ms.iter().sum();
            Some(sum as f64 / state.durations_ms.len() as f64)
        };
        let retry_rate = if state.total_attempts == 0 {
            0.0
        } else {
            f64::from(state.retries) / f64::from(state.total_attempts)
        };
        Efficiency {
            mean_duration_ms,
            retry_rate,
            completed_tasks: state.durations_ms.len(),
        }
    }
}
