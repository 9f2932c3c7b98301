//! Task runners: the collaborator that actually performs a task

pub mod agent;

use crate::models::{Plan, Task, MAX_OUTPUT_SIZE};
use crate::observer::ProgressReporter;
use async_trait::async_trait;

/// Performs the work behind a task.
///
/// The scheduler calls `run` concurrently for distinct tasks; implementations
/// must tolerate that. An `Err` marks the task `failed` with the error text as
/// its result. Timeouts are the runner's own business.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task against a read-only snapshot of the plan
    async fn run(
        &self,
        task: &Task,
        plan: &Plan,
        progress: &ProgressReporter,
    ) -> anyhow::Result<String>;

    /// One-off step before any task is dispatched (shared project setup).
    ///
    /// Its failure is reported but never stops the run.
    async fn bootstrap(
        &self,
        _plan: &Plan,
        _progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Truncate string output to MAX_OUTPUT_SIZE on a char boundary
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_str(data: &str) -> (String, bool) {
    if data.len() <= MAX_OUTPUT_SIZE {
        return (data.to_string(), false);
    }

    let mut end = MAX_OUTPUT_SIZE;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    (data[..end].to_string(), true)
}
