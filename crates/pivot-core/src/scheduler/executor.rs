//! The `Executor` trait -- the caller-supplied adapter that performs a task.
//!
//! The trait is object-safe so the scheduler can hold it as
//! `Arc<dyn Executor>` and share it across every task of a wave.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::model::Task;

/// Performs the work described by a [`Task`].
///
/// Returning `Err` marks the task failed; the error is recorded on the task
/// and never propagates out of plan execution.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, task: &Task) -> Result<Value> {
            Ok(Value::String(task.name.clone()))
        }
    }

    #[tokio::test]
    async fn executor_is_usable_as_trait_object() {
        let executor: Box<dyn Executor> = Box::new(EchoExecutor);
        let out = executor.execute(&Task::new("a", "Alpha")).await.unwrap();
        assert_eq!(out, Value::String("Alpha".into()));
    }
}
