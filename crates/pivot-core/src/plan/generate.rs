//! Goal decomposition through the completion provider.
//!
//! The provider is asked for a JSON task list, which is converted to engine
//! tasks and resolved through [`TaskGraph`] before it is handed back.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ProviderError, Result};
use crate::graph::TaskGraph;
use crate::model::{Priority, Task};
use crate::provider::{CompletionOptions, CompletionProvider, strip_code_fence};

// ---------------------------------------------------------------------------
// Reply schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DecompositionReply {
    tasks: Vec<ProposedStep>,
}

#[derive(Debug, Deserialize)]
struct ProposedStep {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    estimated_ms: u64,
    #[serde(default)]
    component: Option<String>,
}

impl ProposedStep {
    fn into_task(self) -> std::result::Result<Task, ProviderError> {
        let priority = match self.priority.as_deref() {
            None => Priority::default(),
            Some(p) => p
                .parse()
                .map_err(|e| ProviderError::Schema(format!("task {:?}: {e}", self.id)))?,
        };
        let mut task = Task::new(self.id, self.name)
            .with_description(self.description)
            .with_priority(priority)
            .with_dependencies(self.dependencies)
            .with_estimate(self.estimated_ms);
        if let Some(component) = self.component {
            task = task.with_component(component);
        }
        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Build the decomposition prompt for `goal`.
pub fn build_decomposition_prompt(goal: &str, context: &Map<String, Value>) -> String {
    let mut prompt = format!("## Goal\n\n{goal}\n");
    if !context.is_empty() {
        prompt.push_str("\n## Context\n\n");
        for (key, value) in context {
            match value {
                Value::String(s) => prompt.push_str(&format!("- {key}: {s}\n")),
                other => prompt.push_str(&format!("- {key}: {other}\n")),
            }
        }
    }
    prompt.push_str(
        "\n## Instructions\n\n\
Break the goal into small tasks. Each task lists the ids of the tasks that \
must finish before it in `dependencies`. Do not create cycles.\n\n\
## Reply format\n\n\
{\"tasks\": [{\"id\": string, \"name\": string, \"description\": string, \
\"dependencies\": [string], \"priority\": \"critical\" | \"high\" | \"medium\" | \"low\" | \"optional\", \
\"estimated_ms\": number, \"component\": string}]}\n",
    );
    prompt
}

/// Ask `provider` to decompose `goal` into an ordered, validated task list.
///
/// Schema mismatches surface as [`ProviderError::Schema`]; structural
/// problems in the proposed graph (unknown dependency, cycle) surface as
/// the matching validation errors.
pub async fn decompose_goal(
    provider: &dyn CompletionProvider,
    goal: &str,
    context: &Map<String, Value>,
) -> Result<Vec<Task>> {
    let prompt = build_decomposition_prompt(goal, context);
    let options = CompletionOptions {
        system: Some("You are a planning assistant. Reply with JSON only.".to_owned()),
        ..CompletionOptions::default()
    };
    let completion = provider.complete(&prompt, &options).await?;

    let reply: DecompositionReply = serde_json::from_str(strip_code_fence(&completion.content))
        .map_err(|e| ProviderError::Schema(e.to_string()))?;
    if reply.tasks.is_empty() {
        return Err(ProviderError::Schema("decomposition returned no tasks".to_owned()).into());
    }

    let tasks = reply
        .tasks
        .into_iter()
        .map(ProposedStep::into_task)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    tracing::info!(
        provider = provider.name(),
        model = %completion.model,
        tasks = tasks.len(),
        "goal decomposed"
    );
    TaskGraph::resolve(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_goal_and_schema() {
        let mut context = Map::new();
        context.insert("language".into(), Value::String("rust".into()));
        let prompt = build_decomposition_prompt("add caching", &context);
        assert!(prompt.contains("add caching"));
        assert!(prompt.contains("- language: rust"));
        assert!(prompt.contains("\"dependencies\""));
    }

    #[test]
    fn step_with_bad_priority_is_schema_error() {
        let step = ProposedStep {
            id: "a".into(),
            name: "A".into(),
            description: String::new(),
            dependencies: vec![],
            priority: Some("whenever".into()),
            estimated_ms: 0,
            component: None,
        };
        assert!(matches!(step.into_task(), Err(ProviderError::Schema(_))));
    }
}
