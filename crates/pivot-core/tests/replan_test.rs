//! Monitoring, alternative generation, replanning, and history.

use std::sync::Arc;

use serde_json::Map;
use uuid::Uuid;

use pivot_core::alternatives::{AlternativeConfig, AlternativeGenerator, GenerationContext};
use pivot_core::config::EngineConfig;
use pivot_core::error::{PivotError, ProviderError};
use pivot_core::events::EventBus;
use pivot_core::history::{
    EventFilter, History, HistoryConfig, NewReplanEvent, ReplanOutcome,
};
use pivot_core::model::{PlanStatus, Task, TaskStatus};
use pivot_core::monitor::{Monitor, MonitorConfig, TaskReport, Trigger, TriggerType, WatchState};
use pivot_core::orchestrator::{ExportFormat, Orchestrator};
use pivot_core::strategy::Decision;
use pivot_test_utils::{ScriptedExecutor, ScriptedProvider, alternatives_reply, chain};

fn auto_replan_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.monitor.failure_threshold = 1;
    config.replan.auto_replan = true;
    config
}

// ===========================================================================
// Monitor
// ===========================================================================

#[test]
fn failure_threshold_counts_consecutive_failures() {
    let mut monitor = Monitor::new(
        MonitorConfig {
            failure_threshold: 2,
            ..MonitorConfig::default()
        },
        EventBus::new(),
    );
    monitor.watch("ctx", WatchState::default());

    assert!(monitor.report_result("ctx", &TaskReport::failed("a", "x")).is_none());
    let trigger = monitor
        .report_result("ctx", &TaskReport::failed("b", "y"))
        .expect("second failure should trigger");
    assert_eq!(trigger.kind(), TriggerType::TaskFailed);
    assert_eq!(trigger.task_id(), Some("b"));

    let timeout = monitor
        .report_result("ctx", &TaskReport::timeout("c"))
        .expect("timeouts always trigger");
    assert_eq!(timeout.kind(), TriggerType::Timeout);
}

// ===========================================================================
// Alternatives
// ===========================================================================

#[tokio::test]
async fn low_confidence_alternatives_are_filtered() {
    let provider = ScriptedProvider::new()
        .reply_json(alternatives_reply(&[0.9, 0.6]))
        .into_shared();
    let generator = AlternativeGenerator::new(
        provider,
        AlternativeConfig {
            min_confidence: 0.7,
            ..AlternativeConfig::default()
        },
    );
    let failed = Task::new("deploy", "Deploy").with_description("Push the release");

    let alternatives = generator
        .generate_alternatives(&failed, &GenerationContext::default())
        .await
        .unwrap();

    assert_eq!(alternatives.len(), 2);
    assert_eq!(alternatives[0].confidence, 0.9);
    assert!(alternatives[1].is_retry());
}

#[tokio::test]
async fn provider_errors_propagate_without_fallback() {
    let provider = ScriptedProvider::new()
        .error(ProviderError::Request("rate limited".into()))
        .into_shared();
    let generator = AlternativeGenerator::new(
        provider,
        AlternativeConfig {
            fallback_to_retry: false,
            ..AlternativeConfig::default()
        },
    );

    let err = generator
        .generate_alternatives(&Task::new("a", "A"), &GenerationContext::default())
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::Request("rate limited".into()));
}

// ===========================================================================
// Replanning loop
// ===========================================================================

#[tokio::test]
async fn auto_replan_retries_a_failed_task() {
    let orch = Orchestrator::new(auto_replan_config()).unwrap();
    let id = orch.create_plan("flaky", chain(2), Map::new()).await.unwrap();
    let executor = Arc::new(ScriptedExecutor::new().fail_times("t1", 1, "transient"));

    let plan = orch.execute_plan(id, executor.clone()).await.unwrap();

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.metrics.replan_count, 1);
    assert_eq!(plan.task("t1").unwrap().attempts, 2);
    assert_eq!(executor.calls(), vec!["t1", "t1", "t2"]);

    let events = orch.history_events(&EventFilter::default()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision(), Decision::Replace);
    assert_eq!(events[0].trigger().kind(), TriggerType::TaskFailed);
    assert_eq!(events[0].failed_task_id(), Some("t1"));
    assert_eq!(events[0].alternative_id(), Some("retry"));
    assert!(events[0].outcome().success);
}

#[tokio::test]
async fn replan_budget_bounds_the_loop() {
    let mut config = auto_replan_config();
    config.replan.max_replans = 2;
    let orch = Orchestrator::new(config).unwrap();
    let id = orch.create_plan("doomed", chain(2), Map::new()).await.unwrap();
    let executor = Arc::new(ScriptedExecutor::new().fail("t1", "always"));

    let plan = orch.execute_plan(id, executor.clone()).await.unwrap();

    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.metrics.replan_count, 2);
    assert_eq!(executor.call_count("t1"), 3);
    assert_eq!(executor.call_count("t2"), 0);
}

#[tokio::test]
async fn failures_are_not_replanned_without_auto_replan() {
    let orch = Orchestrator::new(EngineConfig::default()).unwrap();
    let id = orch.create_plan("manual", chain(1), Map::new()).await.unwrap();

    let plan = orch
        .execute_plan(id, Arc::new(ScriptedExecutor::new().fail("t1", "nope")))
        .await
        .unwrap();

    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.metrics.replan_count, 0);
    assert_eq!(orch.history_metrics().await.total_replans, 0);
}

#[tokio::test]
async fn provider_alternative_replaces_the_failed_task() {
    let provider = ScriptedProvider::new()
        .reply_json(alternatives_reply(&[0.8]))
        .into_shared();
    let orch = Orchestrator::new(auto_replan_config())
        .unwrap()
        .with_provider(provider.clone());
    let id = orch.create_plan("swap", chain(2), Map::new()).await.unwrap();
    let executor = Arc::new(ScriptedExecutor::new().fail_times("t1", 1, "wrong tool"));

    let plan = orch.execute_plan(id, executor).await.unwrap();

    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.task("t1").unwrap().name, "Alternative task 1");
    assert!(provider.prompts()[0].contains("wrong tool"));

    let events = orch.history_events(&EventFilter::default()).await;
    assert_eq!(events[0].alternative_id(), Some("alt-1"));
}

#[tokio::test]
async fn human_request_without_failures_aborts_and_can_be_rolled_back() {
    let orch = Orchestrator::new(EngineConfig::default()).unwrap();
    let id = orch.create_plan("halt", chain(2), Map::new()).await.unwrap();
    let before = orch.get_plan(id).await.unwrap();

    let event = orch
        .request_replan(id, "priorities changed")
        .await
        .unwrap()
        .expect("human requests are handled immediately on idle plans");
    assert_eq!(event.decision(), Decision::Abort);
    assert_eq!(event.trigger().kind(), TriggerType::HumanRequest);
    let plan = orch.get_plan(id).await.unwrap();
    assert!(plan.tasks.iter().all(|t| t.status == TaskStatus::Skipped));
    assert!(plan.aborted);
    assert_eq!(plan.metrics.replan_count, 1);

    let rolled_back = orch.rollback_replan(event.id()).await.unwrap();
    assert!(rolled_back.is_rolled_back());
    let plan = orch.get_plan(id).await.unwrap();
    assert_eq!(plan.tasks, before.tasks);
    assert!(!plan.aborted);

    assert!(orch.rollback_replan(event.id()).await.is_err());
    assert!(matches!(
        orch.rollback_replan(Uuid::new_v4()).await.unwrap_err(),
        PivotError::NotFound { .. }
    ));
    assert_eq!(orch.history_metrics().await.rolled_back, 1);
}

#[tokio::test]
async fn aborted_plan_fails_without_running_tasks() {
    let orch = Orchestrator::new(EngineConfig::default()).unwrap();
    let mut rx = orch.subscribe();
    let id = orch.create_plan("halt", chain(2), Map::new()).await.unwrap();

    let event = orch
        .request_replan(id, "stop everything")
        .await
        .unwrap()
        .expect("idle plans replan immediately");
    assert_eq!(event.decision(), Decision::Abort);

    let executor = Arc::new(ScriptedExecutor::new());
    let plan = orch.execute_plan(id, executor.clone()).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.metrics.completed_tasks, 0);
    assert_eq!(plan.metrics.skipped_tasks, 2);
    assert!(executor.calls().is_empty());

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"plan:error"), "events: {names:?}");
    assert!(!names.contains(&"plan:completed"), "events: {names:?}");
}

#[tokio::test]
async fn request_replan_rejects_finished_plans() {
    let orch = Orchestrator::new(EngineConfig::default()).unwrap();
    let id = orch.create_plan("done", chain(1), Map::new()).await.unwrap();
    orch.execute_plan(id, Arc::new(ScriptedExecutor::new()))
        .await
        .unwrap();

    assert!(matches!(
        orch.request_replan(id, "too late").await.unwrap_err(),
        PivotError::Validation(_)
    ));
}

#[tokio::test]
async fn reports_for_plans_not_yet_running_raise_nothing() {
    let orch = Orchestrator::new(auto_replan_config()).unwrap();
    let id = orch.create_plan("watch", chain(1), Map::new()).await.unwrap();

    // Watching starts with execution.
    let trigger = orch
        .report_result(id, TaskReport::timeout("t1"))
        .await
        .unwrap();
    assert!(trigger.is_none());
}

// ===========================================================================
// History
// ===========================================================================

fn new_event(kind: TriggerType, success: bool) -> NewReplanEvent {
    let trigger = match kind {
        TriggerType::Timeout => Trigger::timeout("ctx", "t"),
        TriggerType::HumanRequest => Trigger::human_request("ctx", "stop"),
        _ => Trigger::task_failed("ctx", "t", None),
    };
    NewReplanEvent {
        trigger,
        decision: Decision::Replace,
        plan_id: Uuid::nil(),
        failed_task_id: Some("t".into()),
        alternative_id: None,
        outcome: ReplanOutcome {
            success,
            notes: String::new(),
        },
    }
}

#[test]
fn history_keeps_the_most_recent_events() {
    let mut history = History::new(HistoryConfig { max_events: 3 });
    let ids: Vec<Uuid> = (0..5)
        .map(|_| history.record(new_event(TriggerType::TaskFailed, true)).id())
        .collect();

    let kept: Vec<Uuid> = history.events().map(|e| e.id()).collect();
    assert_eq!(kept, ids[2..].to_vec());
}

#[test]
fn history_metrics_and_markdown_export() {
    let mut history = History::new(HistoryConfig::default());
    history.record(new_event(TriggerType::TaskFailed, true));
    history.record(new_event(TriggerType::Timeout, true));
    history.record(new_event(TriggerType::TaskFailed, false));

    let metrics = history.metrics();
    assert_eq!(metrics.total_replans, 3);
    assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(metrics.by_trigger.get(&TriggerType::TaskFailed), Some(&2));
    assert_eq!(metrics.by_trigger.get(&TriggerType::Timeout), Some(&1));
    assert_eq!(metrics.by_trigger.get(&TriggerType::HumanRequest), None);

    let markdown = history.export_markdown();
    assert!(markdown.starts_with("# Replanning History Report"));
    assert!(markdown.contains("`task-failed`"));
    assert!(markdown.contains("totalReplans: 3"));
    assert!(markdown.contains("successRate: 66.7%"));

    let restored = History::import_markdown(&markdown, HistoryConfig::default()).unwrap();
    assert_eq!(restored.metrics(), metrics);
}

#[tokio::test]
async fn orchestrator_history_round_trips_through_json() {
    let orch = Orchestrator::new(auto_replan_config()).unwrap();
    let id = orch.create_plan("flaky", chain(1), Map::new()).await.unwrap();
    orch.execute_plan(id, Arc::new(ScriptedExecutor::new().fail_times("t1", 1, "x")))
        .await
        .unwrap();

    let exported = orch.export_history(ExportFormat::Json).await;
    let other = Orchestrator::new(EngineConfig::default()).unwrap();
    assert_eq!(other.import_history(&exported, ExportFormat::Json).await.unwrap(), 1);

    let filtered = other
        .history_events(&EventFilter {
            plan_id: Some(id),
            decision: Some(Decision::Replace),
            ..EventFilter::default()
        })
        .await;
    assert_eq!(filtered.len(), 1);
    assert!(
        other
            .history_events(&EventFilter {
                success: Some(false),
                ..EventFilter::default()
            })
            .await
            .is_empty()
    );
}
