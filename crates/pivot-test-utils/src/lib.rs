//! Shared test utilities for pivot integration tests.
//!
//! Provides scripted collaborators: an [`Executor`] whose per-task outcome
//! and latency are configured up front, and a [`CompletionProvider`] that
//! replays canned replies. Both record what they were asked to do.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use pivot_core::error::ProviderError;
use pivot_core::model::Task;
use pivot_core::provider::{Completion, CompletionOptions, CompletionProvider, Usage};
use pivot_core::scheduler::Executor;

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Script {
    /// Remaining failures before the task starts succeeding. `None` means
    /// it fails forever.
    failures: Option<Option<u32>>,
    delay: Option<Duration>,
    message: Option<String>,
}

/// An executor driven by per-task scripts.
///
/// Tasks without a script succeed immediately with `{"task": <id>}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    default_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task sleeps `delay` before returning unless it has its own.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// `task_id` always fails with `message`.
    pub fn fail(self, task_id: &str, message: &str) -> Self {
        self.script(task_id, |s| {
            s.failures = Some(None);
            s.message = Some(message.to_owned());
        })
    }

    /// `task_id` fails `times` times, then succeeds.
    pub fn fail_times(self, task_id: &str, times: u32, message: &str) -> Self {
        self.script(task_id, |s| {
            s.failures = Some(Some(times));
            s.message = Some(message.to_owned());
        })
    }

    pub fn delay(self, task_id: &str, delay: Duration) -> Self {
        self.script(task_id, |s| s.delay = Some(delay))
    }

    fn script(self, task_id: &str, edit: impl FnOnce(&mut Script)) -> Self {
        {
            let mut scripts = self.scripts.lock().unwrap();
            edit(scripts.entry(task_id.to_owned()).or_default());
        }
        self
    }

    /// Task ids in the order the executor was invoked.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, task_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Whether this call should fail, consuming one scripted failure.
    fn next_outcome(&self, task_id: &str) -> (Option<Duration>, Option<String>) {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(task_id) else {
            return (self.default_delay, None);
        };
        let delay = script.delay.or(self.default_delay);
        let failure = match &mut script.failures {
            Some(None) => script.message.clone(),
            Some(Some(0)) | None => None,
            Some(Some(n)) => {
                *n -= 1;
                script.message.clone()
            }
        };
        (delay, failure)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(task.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let (delay, failure) = self.next_outcome(&task.id);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match failure {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(json!({ "task": task.id })),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// A completion provider that replays queued replies in order.
///
/// Once the queue is empty every call fails with a request error.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(content.into()));
        self
    }

    pub fn reply_json(self, value: Value) -> Self {
        self.reply(value.to_string())
    }

    pub fn error(self, error: ProviderError) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_owned());
        let next = self.replies.lock().unwrap().pop_front();
        let content = next
            .unwrap_or_else(|| Err(ProviderError::Request("no scripted reply left".into())))?;
        Ok(Completion {
            content,
            model: "scripted-1".into(),
            usage: Usage::default(),
            finish_reason: "stop".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// `n` tasks with no dependencies, ids `t1..=tn`.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (1..=n)
        .map(|i| Task::new(format!("t{i}"), format!("Task {i}")))
        .collect()
}

/// A linear chain `t1 <- t2 <- ... <- tn`.
pub fn chain(n: usize) -> Vec<Task> {
    (1..=n)
        .map(|i| {
            let task = Task::new(format!("t{i}"), format!("Task {i}"));
            if i == 1 {
                task
            } else {
                task.with_dependencies([format!("t{}", i - 1)])
            }
        })
        .collect()
}

/// A provider reply proposing alternatives with the given confidences.
pub fn alternatives_reply(confidences: &[f64]) -> Value {
    let alternatives: Vec<Value> = confidences
        .iter()
        .enumerate()
        .map(|(i, confidence)| {
            json!({
                "id": format!("alt-{}", i + 1),
                "description": format!("Alternative {}", i + 1),
                "task": {
                    "name": format!("Alternative task {}", i + 1),
                    "description": "Try a different approach",
                },
                "confidence": confidence,
                "reasoning": "scripted",
                "risks": [],
            })
        })
        .collect();
    json!({ "alternatives": alternatives })
}
