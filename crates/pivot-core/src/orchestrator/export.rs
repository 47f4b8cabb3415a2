//! Plan reports.

use std::fmt::Write as _;
use std::str::FromStr;

use crate::evaluator::calculate_progress;
use crate::model::{Plan, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Markdown,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown export format {other:?} (expected markdown or json)")),
        }
    }
}

pub fn render_plan(plan: &Plan, format: ExportFormat) -> String {
    match format {
        ExportFormat::Markdown => render_plan_markdown(plan),
        ExportFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_else(|e| {
            tracing::error!(plan_id = %plan.id, error = %e, "failed to serialize plan");
            format!("{{\"id\": \"{}\"}}", plan.id)
        }),
    }
}

/// `# Plan: <goal>` with a summary and one table row per task.
pub fn render_plan_markdown(plan: &Plan) -> String {
    let metrics = &plan.metrics;
    let mut out = String::new();
    let _ = writeln!(out, "# Plan: {}\n", plan.goal);
    let _ = writeln!(out, "- id: {}", plan.id);
    let _ = writeln!(out, "- status: {}", plan.status);
    let _ = writeln!(
        out,
        "- progress: {}% ({}/{} completed, {} failed, {} skipped)",
        calculate_progress(metrics.completed_tasks, metrics.total_tasks),
        metrics.completed_tasks,
        metrics.total_tasks,
        metrics.failed_tasks,
        metrics.skipped_tasks
    );
    let _ = writeln!(
        out,
        "- time: {} ms actual / {} ms estimated",
        metrics.actual_ms, metrics.estimated_ms
    );
    let _ = writeln!(out, "- replans: {}", metrics.replan_count);

    let _ = writeln!(out, "\n## Tasks\n");
    let _ = writeln!(
        out,
        "| # | id | name | status | priority | depends on | estimated ms | actual ms |"
    );
    let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
    for (i, task) in plan.tasks.iter().enumerate() {
        let deps = if task.dependencies.is_empty() {
            "-".to_owned()
        } else {
            task.dependencies
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let actual = task
            .actual_ms
            .map_or_else(|| "-".to_owned(), |ms| ms.to_string());
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} | {} |",
            i + 1,
            task.id,
            task.name.replace('|', "\\|"),
            task.status,
            task.priority,
            deps,
            task.estimated_ms,
            actual
        );
    }

    let errors: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .filter_map(|t| t.error_message().map(|m| (t.id.as_str(), m)))
        .collect();
    if !errors.is_empty() {
        let _ = writeln!(out, "\n## Errors\n");
        for (id, message) in errors {
            let _ = writeln!(out, "- `{id}`: {message}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::model::Task;

    #[test]
    fn markdown_lists_tasks_and_errors() {
        let mut failed = Task::new("deploy", "Deploy").with_dependencies(["build"]);
        failed.record_failure("timeout talking to host");
        let plan = Plan::new(
            "release",
            vec![Task::new("build", "Build"), failed],
            Map::new(),
        );

        let report = render_plan_markdown(&plan);
        assert!(report.starts_with("# Plan: release"));
        assert!(report.contains("| 2 | deploy | Deploy | failed | medium | build | 0 | - |"));
        assert!(report.contains("- `deploy`: timeout talking to host"));
        assert!(report.contains("progress: 0% (0/2 completed, 1 failed, 0 skipped)"));
    }

    #[test]
    fn json_is_the_serialized_plan() {
        let plan = Plan::new("g", vec![Task::new("a", "A")], Map::new());
        let json: serde_json::Value =
            serde_json::from_str(&render_plan(&plan, ExportFormat::Json)).unwrap();
        assert_eq!(json["goal"], "g");
        assert_eq!(json["tasks"][0]["id"], "a");
    }

    #[test]
    fn format_parses() {
        assert_eq!("md".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("yaml".parse::<ExportFormat>().is_err());
    }
}
