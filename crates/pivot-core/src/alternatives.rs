//! Alternative generation for failed tasks.
//!
//! Asks the completion provider for ranked continuations, filters them by
//! confidence and optionally appends a deterministic retry option.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::model::Task;
use crate::monitor::TriggerType;
use crate::provider::{CompletionOptions, CompletionProvider, strip_code_fence};
use crate::strategy::Decision;

/// Id of the built-in retry alternative.
pub const RETRY_ALTERNATIVE_ID: &str = "retry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternativeConfig {
    /// Alternatives below this confidence are discarded.
    pub min_confidence: f64,
    pub max_alternatives: usize,
    /// Append an unchanged-task retry option to every result.
    pub include_retry_option: bool,
    pub retry_confidence: f64,
    /// Degrade to the retry option when the provider fails.
    pub fallback_to_retry: bool,
}

impl Default for AlternativeConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_alternatives: 3,
            include_retry_option: true,
            retry_confidence: 0.3,
            fallback_to_retry: true,
        }
    }
}

/// The task an alternative proposes to run instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_ms: Option<u64>,
}

impl ProposedTask {
    /// A proposal identical to `task`.
    pub fn from_task(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            description: task.description.clone(),
            goal: task.goal.clone(),
            skill: task.skill.clone(),
            parameters: task.parameters.clone(),
            estimated_ms: Some(task.estimated_ms),
        }
    }

    /// Overwrite `task`'s content with this proposal, keeping its id,
    /// dependencies and priority.
    pub fn apply_to(&self, task: &mut Task) {
        task.name = self.name.clone();
        task.description = self.description.clone();
        task.goal = self.goal.clone();
        task.skill = self.skill.clone();
        task.parameters = self.parameters.clone();
        if let Some(estimated_ms) = self.estimated_ms {
            task.estimated_ms = estimated_ms;
        }
    }
}

/// A ranked candidate continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub id: String,
    pub description: String,
    pub task: ProposedTask,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub risks: Vec<String>,
    /// How the proposal should be applied. Defaults to replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl Alternative {
    /// Re-run `task` unchanged.
    pub fn retry(task: &Task, confidence: f64) -> Self {
        Self {
            id: RETRY_ALTERNATIVE_ID.to_owned(),
            description: format!("Retry {:?} unchanged", task.name),
            task: ProposedTask::from_task(task),
            confidence,
            reasoning: "The failure may be transient.".to_owned(),
            risks: vec!["The same failure may recur.".to_owned()],
            decision: Some(Decision::Replace),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.id == RETRY_ALTERNATIVE_ID
    }
}

/// Pick the decision for a ranked alternative list: abort when there is
/// nothing to try, otherwise what the top alternative suggests.
pub fn choose_decision(alternatives: &[Alternative]) -> Decision {
    match alternatives.first() {
        None => Decision::Abort,
        Some(top) => top.decision.unwrap_or(Decision::Replace),
    }
}

/// What the generator knows about the failure.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    /// The plan's goal and free-form context.
    pub plan_goal: Option<String>,
    pub plan_context: Map<String, Value>,
    pub error: Option<String>,
    pub trigger: Option<TriggerType>,
    /// Names of tasks that already completed.
    pub completed: Vec<String>,
}

/// Derive the goal a task pursues.
///
/// Prefers the task's explicit goal, then a `goal` entry in `context`, then
/// the description, then a phrase built from the skill and its parameters,
/// and finally the task name.
pub fn extract_goal(task: &Task, context: &Map<String, Value>) -> String {
    if let Some(goal) = task.goal.as_deref().filter(|g| !g.trim().is_empty()) {
        return goal.to_owned();
    }
    if let Some(goal) = context.get("goal").and_then(Value::as_str) {
        return goal.to_owned();
    }
    if !task.description.trim().is_empty() {
        return task.description.clone();
    }
    if let Some(skill) = &task.skill {
        if task.parameters.is_empty() {
            return skill.clone();
        }
        let params: Vec<String> = task
            .parameters
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect();
        return format!("{skill} with {}", params.join(", "));
    }
    task.name.clone()
}

#[derive(Debug, Deserialize)]
struct AlternativeReply {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    goal: String,
    alternatives: Vec<Alternative>,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct AlternativeGenerator {
    provider: Arc<dyn CompletionProvider>,
    config: AlternativeConfig,
}

impl AlternativeGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: AlternativeConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &AlternativeConfig {
        &self.config
    }

    /// The alternative set used when no provider answer is available.
    pub fn retry_only(failed: &Task, config: &AlternativeConfig) -> Vec<Alternative> {
        vec![Alternative::retry(failed, config.retry_confidence)]
    }

    /// Ask the provider for continuations of `failed`.
    ///
    /// Returns the surviving alternatives sorted by confidence, followed by
    /// the retry option when enabled. Provider or schema failures degrade
    /// to the retry option when `fallback_to_retry` is set.
    pub async fn generate_alternatives(
        &self,
        failed: &Task,
        context: &GenerationContext,
    ) -> Result<Vec<Alternative>, ProviderError> {
        match self.request(failed, context).await {
            Ok(mut alternatives) => {
                if self.config.include_retry_option {
                    alternatives.push(Alternative::retry(failed, self.config.retry_confidence));
                }
                Ok(alternatives)
            }
            Err(e) if self.config.fallback_to_retry => {
                tracing::warn!(
                    task_id = %failed.id,
                    provider = self.provider.name(),
                    error = %e,
                    "alternative generation failed, falling back to retry"
                );
                Ok(Self::retry_only(failed, &self.config))
            }
            Err(e) => Err(e),
        }
    }

    async fn request(
        &self,
        failed: &Task,
        context: &GenerationContext,
    ) -> Result<Vec<Alternative>, ProviderError> {
        let goal = extract_goal(failed, &context.plan_context);
        let prompt = build_prompt(failed, &goal, context);
        let options = CompletionOptions {
            system: Some(SYSTEM_PROMPT.to_owned()),
            ..CompletionOptions::default()
        };

        let completion = self.provider.complete(&prompt, &options).await?;
        let reply: AlternativeReply = serde_json::from_str(strip_code_fence(&completion.content))
            .map_err(|e| ProviderError::Schema(e.to_string()))?;

        for alt in &reply.alternatives {
            if !(0.0..=1.0).contains(&alt.confidence) {
                return Err(ProviderError::Schema(format!(
                    "alternative {:?} has confidence {} outside [0, 1]",
                    alt.id, alt.confidence
                )));
            }
        }

        tracing::debug!(
            task_id = %failed.id,
            model = %completion.model,
            goal = %reply.goal,
            analysis = %reply.analysis,
            offered = reply.alternatives.len(),
            "provider proposed alternatives"
        );

        Ok(rank(reply.alternatives, &self.config))
    }
}

impl std::fmt::Debug for AlternativeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlternativeGenerator")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Drop low-confidence entries, cap the count, then sort by confidence
/// descending. The sort is stable, so ties keep provider order.
fn rank(mut alternatives: Vec<Alternative>, config: &AlternativeConfig) -> Vec<Alternative> {
    alternatives.retain(|a| a.confidence >= config.min_confidence);
    alternatives.truncate(config.max_alternatives);
    alternatives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    alternatives
}

const SYSTEM_PROMPT: &str = "You are a planning assistant. A task in an automated plan failed. \
Propose alternative ways to reach the task's goal. Reply with JSON only.";

fn build_prompt(failed: &Task, goal: &str, context: &GenerationContext) -> String {
    let mut prompt = String::new();
    prompt.push_str("## Failed task\n\n");
    prompt.push_str(&format!("- id: {}\n- name: {}\n", failed.id, failed.name));
    if !failed.description.is_empty() {
        prompt.push_str(&format!("- description: {}\n", failed.description));
    }
    if let Some(skill) = &failed.skill {
        prompt.push_str(&format!("- skill: {skill}\n"));
    }
    prompt.push_str(&format!("- goal: {goal}\n"));
    if let Some(error) = context.error.as_deref().or(failed.error_message()) {
        prompt.push_str(&format!("- error: {error}\n"));
    }
    if let Some(trigger) = context.trigger {
        prompt.push_str(&format!("- trigger: {trigger}\n"));
    }

    if let Some(plan_goal) = &context.plan_goal {
        prompt.push_str(&format!("\n## Plan goal\n\n{plan_goal}\n"));
    }
    if !context.completed.is_empty() {
        prompt.push_str("\n## Completed tasks\n\n");
        for name in &context.completed {
            prompt.push_str(&format!("- {name}\n"));
        }
    }

    prompt.push_str(
        "\n## Reply format\n\n\
{\"analysis\": string, \"goal\": string, \"alternatives\": [{\"id\": string, \
\"description\": string, \"task\": {\"name\": string, \"description\": string}, \
\"confidence\": number between 0 and 1, \"reasoning\": string, \"risks\": [string], \
\"decision\": \"replace\" | \"insert\"}]}\n",
    );
    prompt
}
