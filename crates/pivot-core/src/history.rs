//! Size-bounded log of replanning events.
//!
//! Events are append-only; the only later change is the rollback marker set
//! by [`History::rollback`]. Rolling back is bookkeeping: restoring plan
//! state is the caller's job.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PivotError, Result};
use crate::monitor::{Trigger, TriggerType};
use crate::strategy::Decision;

const REPORT_HEADER: &str = "# Replanning History Report";
const RAW_DATA_HEADER: &str = "## Raw Data";
const RAW_DATA_FENCE: &str = "\n```json\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Oldest events are dropped beyond this many.
    pub max_events: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_events: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanOutcome {
    pub success: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionKind {
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub kind: ResolutionKind,
    pub at: DateTime<Utc>,
}

/// Input to [`History::record`].
#[derive(Debug, Clone)]
pub struct NewReplanEvent {
    pub trigger: Trigger,
    pub decision: Decision,
    pub plan_id: Uuid,
    pub failed_task_id: Option<String>,
    pub alternative_id: Option<String>,
    pub outcome: ReplanOutcome,
}

/// A recorded replan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplanEvent {
    id: Uuid,
    timestamp: DateTime<Utc>,
    trigger: Trigger,
    decision: Decision,
    plan_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alternative_id: Option<String>,
    outcome: ReplanOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolution: Option<Resolution>,
}

impl ReplanEvent {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn failed_task_id(&self) -> Option<&str> {
        self.failed_task_id.as_deref()
    }

    pub fn alternative_id(&self) -> Option<&str> {
        self.alternative_id.as_deref()
    }

    pub fn outcome(&self) -> &ReplanOutcome {
        &self.outcome
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Conjunctive filter for [`History::get_events`]. `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub trigger: Option<TriggerType>,
    pub decision: Option<Decision>,
    pub success: Option<bool>,
    pub plan_id: Option<Uuid>,
}

impl EventFilter {
    fn matches(&self, event: &ReplanEvent) -> bool {
        self.trigger.is_none_or(|t| event.trigger.kind() == t)
            && self.decision.is_none_or(|d| event.decision == d)
            && self.success.is_none_or(|s| event.outcome.success == s)
            && self.plan_id.is_none_or(|p| event.plan_id == p)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMetrics {
    pub total_replans: usize,
    pub successful_replans: usize,
    pub failed_replans: usize,
    /// `successful / total`, zero for an empty history.
    pub success_rate: f64,
    pub by_trigger: BTreeMap<TriggerType, usize>,
    pub by_decision: BTreeMap<Decision, usize>,
    pub rolled_back: usize,
}

#[derive(Serialize, Deserialize)]
struct HistoryExport {
    events: Vec<ReplanEvent>,
    #[serde(default)]
    metrics: HistoryMetrics,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct History {
    config: HistoryConfig,
    events: VecDeque<ReplanEvent>,
}

impl History {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Append an event, assigning its id and timestamp.
    pub fn record(&mut self, event: NewReplanEvent) -> ReplanEvent {
        let recorded = ReplanEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            trigger: event.trigger,
            decision: event.decision,
            plan_id: event.plan_id,
            failed_task_id: event.failed_task_id,
            alternative_id: event.alternative_id,
            outcome: event.outcome,
            resolution: None,
        };
        tracing::info!(
            event_id = %recorded.id,
            plan_id = %recorded.plan_id,
            trigger = %recorded.trigger.kind(),
            decision = %recorded.decision,
            success = recorded.outcome.success,
            "replan recorded"
        );
        self.push(recorded.clone());
        recorded
    }

    fn push(&mut self, event: ReplanEvent) {
        self.events.push_back(event);
        while self.events.len() > self.config.max_events.max(1) {
            self.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &ReplanEvent> {
        self.events.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&ReplanEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn get_events(&self, filter: &EventFilter) -> Vec<&ReplanEvent> {
        self.events.iter().filter(|e| filter.matches(e)).collect()
    }

    pub fn metrics(&self) -> HistoryMetrics {
        let mut metrics = HistoryMetrics {
            total_replans: self.events.len(),
            ..HistoryMetrics::default()
        };
        for event in &self.events {
            if event.outcome.success {
                metrics.successful_replans += 1;
            } else {
                metrics.failed_replans += 1;
            }
            if event.is_rolled_back() {
                metrics.rolled_back += 1;
            }
            *metrics.by_trigger.entry(event.trigger.kind()).or_insert(0) += 1;
            *metrics.by_decision.entry(event.decision).or_insert(0) += 1;
        }
        if metrics.total_replans > 0 {
            metrics.success_rate =
                metrics.successful_replans as f64 / metrics.total_replans as f64;
        }
        metrics
    }

    /// Mark an event rolled back. Plan state is left untouched.
    pub fn rollback(&mut self, id: Uuid) -> Result<&ReplanEvent> {
        let event = self
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| PivotError::event_not_found(id))?;
        if event.resolution.is_some() {
            return Err(PivotError::Validation(format!(
                "replan event {id} is already rolled back"
            )));
        }
        event.resolution = Some(Resolution {
            kind: ResolutionKind::RolledBack,
            at: Utc::now(),
        });
        tracing::info!(event_id = %id, "replan event rolled back");
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    /// `{"events": [...], "metrics": {...}}`.
    pub fn export_json(&self) -> String {
        let export = HistoryExport {
            events: self.events.iter().cloned().collect(),
            metrics: self.metrics(),
        };
        serde_json::to_string_pretty(&export).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize history");
            String::from("{\"events\": [], \"metrics\": {}}")
        })
    }

    /// Rebuild a history from [`History::export_json`] output, keeping the
    /// newest `config.max_events` events. Metrics are recomputed.
    pub fn import_json(json: &str, config: HistoryConfig) -> Result<Self> {
        let export: HistoryExport = serde_json::from_str(json)
            .map_err(|e| PivotError::Validation(format!("invalid history JSON: {e}")))?;
        let mut history = Self::new(config);
        for event in export.events {
            history.push(event);
        }
        Ok(history)
    }

    /// Human-readable report with an embedded JSON block for re-import.
    pub fn export_markdown(&self) -> String {
        let metrics = self.metrics();
        let mut out = String::new();
        let _ = writeln!(out, "{REPORT_HEADER}\n");
        let _ = writeln!(out, "Generated: {}\n", Utc::now().to_rfc3339());

        let _ = writeln!(out, "## Events\n");
        if self.events.is_empty() {
            let _ = writeln!(out, "_No replanning events recorded._");
        }
        for event in &self.events {
            let _ = write!(
                out,
                "- {} `{}` -> {} (plan {}",
                event.timestamp.to_rfc3339(),
                event.trigger.kind(),
                event.decision,
                event.plan_id
            );
            if let Some(task_id) = &event.failed_task_id {
                let _ = write!(out, ", task `{task_id}`");
            }
            let status = if event.outcome.success { "success" } else { "failure" };
            let _ = write!(out, "): {status}");
            if !event.outcome.notes.is_empty() {
                let _ = write!(out, " - {}", event.outcome.notes);
            }
            if event.is_rolled_back() {
                let _ = write!(out, " [rolled back]");
            }
            out.push('\n');
        }

        let _ = writeln!(out, "\n## Metrics\n");
        let _ = writeln!(out, "- totalReplans: {}", metrics.total_replans);
        let _ = writeln!(out, "- successfulReplans: {}", metrics.successful_replans);
        let _ = writeln!(out, "- failedReplans: {}", metrics.failed_replans);
        let _ = writeln!(out, "- successRate: {:.1}%", metrics.success_rate * 100.0);
        let _ = writeln!(out, "- rolledBack: {}", metrics.rolled_back);
        if !metrics.by_trigger.is_empty() {
            let _ = writeln!(out, "\n### By trigger\n");
            for (trigger, count) in &metrics.by_trigger {
                let _ = writeln!(out, "- {trigger}: {count}");
            }
        }
        if !metrics.by_decision.is_empty() {
            let _ = writeln!(out, "\n### By decision\n");
            for (decision, count) in &metrics.by_decision {
                let _ = writeln!(out, "- {decision}: {count}");
            }
        }

        let _ = writeln!(out, "\n{RAW_DATA_HEADER}\n");
        let _ = writeln!(out, "```json\n{}\n```", self.export_json());
        out
    }

    /// Rebuild a history from [`History::export_markdown`] output.
    pub fn import_markdown(markdown: &str, config: HistoryConfig) -> Result<Self> {
        if !markdown.trim_start().starts_with(REPORT_HEADER) {
            return Err(PivotError::Validation(
                "not a replanning history report".to_owned(),
            ));
        }
        // The raw block closes the report. JSON strings never hold a raw
        // newline, so the last opening fence is the real one.
        let body = markdown
            .trim_end()
            .strip_suffix("```")
            .ok_or_else(|| PivotError::Validation("raw data block is not closed".to_owned()))?;
        let open = body
            .rfind(RAW_DATA_FENCE)
            .ok_or_else(|| PivotError::Validation("raw data block is missing".to_owned()))?;
        if !body[..open].contains(RAW_DATA_HEADER) {
            return Err(PivotError::Validation(
                "report has no raw data section".to_owned(),
            ));
        }
        let json = &body[open + RAW_DATA_FENCE.len()..];
        Self::import_json(json.trim(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(plan_id: Uuid, trigger: Trigger, decision: Decision, success: bool) -> NewReplanEvent {
        NewReplanEvent {
            trigger,
            decision,
            plan_id,
            failed_task_id: Some("t1".into()),
            alternative_id: None,
            outcome: ReplanOutcome {
                success,
                notes: String::new(),
            },
        }
    }

    fn failed(plan_id: Uuid, success: bool) -> NewReplanEvent {
        new_event(
            plan_id,
            Trigger::task_failed(&plan_id.to_string(), "t1", None),
            Decision::Replace,
            success,
        )
    }

    #[test]
    fn ring_buffer_keeps_newest_events_in_order() {
        let mut history = History::new(HistoryConfig { max_events: 3 });
        let plan_id = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..5).map(|_| history.record(failed(plan_id, true)).id()).collect();
        let kept: Vec<Uuid> = history.events().map(|e| e.id()).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[test]
    fn filter_by_trigger_decision_and_success() {
        let mut history = History::default();
        let plan_id = Uuid::new_v4();
        history.record(failed(plan_id, true));
        history.record(new_event(
            plan_id,
            Trigger::timeout("ctx", "t2"),
            Decision::Abort,
            false,
        ));

        let timeouts = history.get_events(&EventFilter {
            trigger: Some(TriggerType::Timeout),
            ..EventFilter::default()
        });
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].decision(), Decision::Abort);

        let successes = history.get_events(&EventFilter {
            success: Some(true),
            decision: Some(Decision::Replace),
            ..EventFilter::default()
        });
        assert_eq!(successes.len(), 1);
        assert!(history
            .get_events(&EventFilter {
                plan_id: Some(Uuid::new_v4()),
                ..EventFilter::default()
            })
            .is_empty());
    }

    #[test]
    fn metrics_count_outcomes_and_triggers() {
        let mut history = History::default();
        let plan_id = Uuid::new_v4();
        history.record(failed(plan_id, true));
        history.record(failed(plan_id, false));
        history.record(new_event(
            plan_id,
            Trigger::human_request("ctx", "operator"),
            Decision::Insert,
            true,
        ));

        let metrics = history.metrics();
        assert_eq!(metrics.total_replans, 3);
        assert_eq!(metrics.successful_replans, 2);
        assert_eq!(metrics.failed_replans, 1);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.by_trigger.get(&TriggerType::TaskFailed), Some(&2));
        assert_eq!(metrics.by_trigger.get(&TriggerType::HumanRequest), Some(&1));
        assert_eq!(metrics.by_trigger.get(&TriggerType::Timeout), None);
    }

    #[test]
    fn empty_history_has_zero_success_rate() {
        assert_eq!(History::default().metrics().success_rate, 0.0);
    }

    #[test]
    fn rollback_marks_once() {
        let mut history = History::default();
        let id = history.record(failed(Uuid::new_v4(), true)).id();
        assert!(history.rollback(id).unwrap().is_rolled_back());
        assert!(matches!(history.rollback(id), Err(PivotError::Validation(_))));
        assert!(matches!(
            history.rollback(Uuid::new_v4()),
            Err(PivotError::NotFound { .. })
        ));
        assert_eq!(history.metrics().rolled_back, 1);
    }

    #[test]
    fn markdown_report_has_stable_markers() {
        let mut history = History::default();
        history.record(failed(Uuid::new_v4(), true));
        history.record(failed(Uuid::new_v4(), false));

        let report = history.export_markdown();
        assert!(report.starts_with("# Replanning History Report"));
        assert!(report.contains("`task-failed` -> replace"));
        assert!(report.contains("totalReplans: 2"));
        assert!(report.contains("successRate: 50.0%"));

        let restored = History::import_markdown(&report, HistoryConfig::default()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.metrics(), history.metrics());
    }

    #[test]
    fn markdown_import_ignores_fences_in_notes() {
        let mut history = History::default();
        let mut event = failed(Uuid::new_v4(), false);
        event.outcome.notes = "see\n## Raw Data\n```json\n{\"events\": []}\n```\nabove".into();
        history.record(event);
        history.record(failed(Uuid::new_v4(), true));

        let report = history.export_markdown();
        let restored = History::import_markdown(&report, HistoryConfig::default()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.get_events(&EventFilter::default())[0].outcome.notes,
            history.get_events(&EventFilter::default())[0].outcome.notes
        );
    }

    #[test]
    fn json_export_carries_metrics() {
        let mut history = History::default();
        let id = history.record(failed(Uuid::new_v4(), true)).id();
        history.rollback(id).unwrap();

        let json: serde_json::Value = serde_json::from_str(&history.export_json()).unwrap();
        assert_eq!(json["metrics"]["totalReplans"], 1);
        assert_eq!(json["metrics"]["byTrigger"]["task-failed"], 1);
        assert_eq!(json["events"][0]["resolution"]["kind"], "rolled-back");

        let restored = History::import_json(&history.export_json(), HistoryConfig { max_events: 5 })
            .unwrap();
        assert!(restored.get(id).unwrap().is_rolled_back());
    }

    #[test]
    fn import_rejects_foreign_markdown() {
        assert!(History::import_markdown("# Something else", HistoryConfig::default()).is_err());
        assert!(History::import_json("not json", HistoryConfig::default()).is_err());
    }
}
