//! `pivot validate <plan.toml>`: parse a plan file and print the execution
//! order without running anything.

use std::path::Path;

use anyhow::{Context, Result};

use pivot_core::graph::TaskGraph;
use pivot_core::plan::parse_plan_toml;

pub fn run_validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file: {}", path.display()))?;
    let parsed = parse_plan_toml(&content)
        .with_context(|| format!("failed to parse plan file: {}", path.display()))?;
    let tasks = parsed.into_tasks()?;
    let tasks = TaskGraph::resolve(tasks)
        .with_context(|| format!("invalid task graph in {}", path.display()))?;

    println!("Plan: {}", parsed.plan.goal);
    println!("{} task(s), execution order:", tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            let deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
            format!(" (after {})", deps.join(", "))
        };
        println!(
            "  {:>2}. {} [{}] {}{}",
            i + 1,
            task.id,
            task.priority,
            task.name,
            deps
        );
    }
    Ok(())
}
