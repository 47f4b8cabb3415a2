//! Engine configuration.
//!
//! Every section defaults independently, so a TOML file only needs the keys
//! it changes. Environment overrides are applied on top with
//! [`EngineConfig::apply_env`].

use serde::{Deserialize, Serialize};

use crate::alternatives::AlternativeConfig;
use crate::error::{PivotError, Result};
use crate::evaluator::EvaluatorConfig;
use crate::history::HistoryConfig;
use crate::monitor::MonitorConfig;
use crate::scheduler::SchedulerConfig;

pub const ENV_MAX_PARALLEL: &str = "PIVOT_MAX_PARALLEL";
pub const ENV_FAILURE_THRESHOLD: &str = "PIVOT_FAILURE_THRESHOLD";
pub const ENV_REPLAN_THRESHOLD: &str = "PIVOT_REPLAN_THRESHOLD";
pub const ENV_AUTO_REPLAN: &str = "PIVOT_AUTO_REPLAN";
pub const ENV_MAX_EVENTS: &str = "PIVOT_MAX_EVENTS";

/// Automatic replanning after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanConfig {
    /// Handle task-failed and timeout triggers when a run ends.
    pub auto_replan: bool,
    /// Replans allowed per plan.
    pub max_replans: u32,
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            auto_replan: false,
            max_replans: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub evaluator: EvaluatorConfig,
    pub alternatives: AlternativeConfig,
    pub history: HistoryConfig,
    pub replan: ReplanConfig,
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| PivotError::Validation(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PivotError::Validation(format!("cannot serialize engine config: {e}")))
    }

    /// Overlay `PIVOT_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay `PIVOT_*` variables read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_PARALLEL) {
            self.scheduler.max_parallel = parse_env(ENV_MAX_PARALLEL, &v)?;
        }
        if let Some(v) = lookup(ENV_FAILURE_THRESHOLD) {
            self.monitor.failure_threshold = parse_env(ENV_FAILURE_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_REPLAN_THRESHOLD) {
            self.scheduler.replan_threshold = parse_env(ENV_REPLAN_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_AUTO_REPLAN) {
            self.replan.auto_replan = parse_bool(ENV_AUTO_REPLAN, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_EVENTS) {
            self.history.max_events = parse_env(ENV_MAX_EVENTS, &v)?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(invalid("scheduler.max_parallel must be at least 1"));
        }
        if self.scheduler.replan_threshold.is_nan() || self.scheduler.replan_threshold < 0.0 {
            return Err(invalid("scheduler.replan_threshold must be non-negative"));
        }
        if self.monitor.failure_threshold == 0 {
            return Err(invalid("monitor.failure_threshold must be at least 1"));
        }
        for (name, value) in [
            ("evaluator.failure_rate_threshold", self.evaluator.failure_rate_threshold),
            ("evaluator.critical_failure_rate", self.evaluator.critical_failure_rate),
            ("alternatives.min_confidence", self.alternatives.min_confidence),
            ("alternatives.retry_confidence", self.alternatives.retry_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.evaluator.critical_failure_rate < self.evaluator.failure_rate_threshold {
            return Err(invalid(
                "evaluator.critical_failure_rate must not be below failure_rate_threshold",
            ));
        }
        if self.evaluator.time_overrun_ratio.is_nan() || self.evaluator.time_overrun_ratio <= 0.0 {
            return Err(invalid("evaluator.time_overrun_ratio must be positive"));
        }
        if self.history.max_events == 0 {
            return Err(invalid("history.max_events must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> PivotError {
    PivotError::Validation(message.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PivotError::Validation(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PivotError::Validation(format!(
            "{key}={value:?}: expected a boolean"
        ))),
    }
}
