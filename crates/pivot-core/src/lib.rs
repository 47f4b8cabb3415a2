//! Adaptive task planning and replanning engine.
//!
//! A goal is decomposed into a dependency-ordered set of tasks, executed in
//! waves by a pluggable [`Executor`], observed by a [`Monitor`] that raises
//! replanning triggers, and repaired through alternatives and
//! [`ReplanStrategy`] decisions recorded in a [`History`].
//!
//! [`Orchestrator`] is the entry point that ties these together.

pub mod alternatives;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod graph;
pub mod history;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod provider;
pub mod scheduler;
pub mod strategy;

pub use alternatives::{Alternative, AlternativeConfig, AlternativeGenerator, ProposedTask};
pub use config::EngineConfig;
pub use error::{ExecutionError, PivotError, ProviderError, Result};
pub use evaluator::{Evaluation, Evaluator, EvaluatorConfig};
pub use events::{EngineEvent, EventBus};
pub use graph::TaskGraph;
pub use history::{EventFilter, History, HistoryConfig, HistoryMetrics, ReplanEvent};
pub use model::{Plan, PlanMetrics, PlanStatus, Priority, Task, TaskResult, TaskStatus};
pub use monitor::{Monitor, MonitorConfig, TaskReport, Trigger, TriggerType};
pub use orchestrator::{ExportFormat, Orchestrator, TaskUpdate};
pub use provider::{Completion, CompletionOptions, CompletionProvider};
pub use scheduler::{ExecutionMode, Executor, Scheduler, SchedulerConfig};
pub use strategy::{Decision, ReplanStrategy, StrategyRegistry};
