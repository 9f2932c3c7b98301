//! Scheduler event observers
//!
//! Observers are the only window into a running plan. Callbacks fire on the
//! scheduler's own control flow immediately after the mutation they describe,
//! so an observer never sees a status older than the event it is handling.
//! The scheduler does not wait on or inspect anything an observer does.

use crate::models::Plan;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives scheduler notifications. Every method defaults to a no-op.
///
/// Callbacks run on the scheduler's control loop. When delivered through
/// [`Observers`], a panicking callback is logged and skipped; the run and the
/// remaining observers carry on.
pub trait SchedulerObserver: Send + Sync {
    /// A task (or the bootstrap step) was dispatched
    fn on_task_start(&self, _task_id: &str) {}

    /// Partial output reported by the runner while a task is in flight
    fn on_task_progress(&self, _task_id: &str, _partial: &str) {}

    fn on_task_done(&self, _task_id: &str, _result: &str) {}

    fn on_task_failed(&self, _task_id: &str, _error: &str) {}

    /// A dispatching pass finished and its first settlement came in
    fn on_round_complete(&self, _round: u64) {}

    /// Nothing is ready and nothing is in flight
    fn on_quiescent(&self, _plan: &Plan) {}

    /// Read-only snapshot after any task mutation
    fn on_plan_changed(&self, _plan: &Plan) {}
}

/// Fan-out over a list of observers
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn SchedulerObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer (builder style)
    pub fn with(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn SchedulerObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observers {
    fn notify(&self, event: &str, f: impl Fn(&dyn SchedulerObserver)) {
        for o in &self.observers {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(o.as_ref()))) {
                warn!(
                    event,
                    "Observer panicked: {}",
                    panic_text(panic.as_ref()).unwrap_or("no message")
                );
            }
        }
    }
}

impl SchedulerObserver for Observers {
    fn on_task_start(&self, task_id: &str) {
        self.notify("task_start", |o| o.on_task_start(task_id));
    }

    fn on_task_progress(&self, task_id: &str, partial: &str) {
        self.notify("task_progress", |o| o.on_task_progress(task_id, partial));
    }

    fn on_task_done(&self, task_id: &str, result: &str) {
        self.notify("task_done", |o| o.on_task_done(task_id, result));
    }

    fn on_task_failed(&self, task_id: &str, error: &str) {
        self.notify("task_failed", |o| o.on_task_failed(task_id, error));
    }

    fn on_round_complete(&self, round: u64) {
        self.notify("round_complete", |o| o.on_round_complete(round));
    }

    fn on_quiescent(&self, plan: &Plan) {
        self.notify("quiescent", |o| o.on_quiescent(plan));
    }

    fn on_plan_changed(&self, plan: &Plan) {
        self.notify("plan_changed", |o| o.on_plan_changed(plan));
    }
}

/// Message carried by a panic payload, if it is a string
pub(crate) fn panic_text(panic: &(dyn Any + Send)) -> Option<&str> {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
}

/// Handed to a runner so it can stream partial output for one task
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    observers: Arc<Observers>,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, observers: Arc<Observers>) -> Self {
        Self {
            task_id: task_id.into(),
            observers,
        }
    }

    /// Reporter that drops everything (for running a task outside a scheduler)
    pub fn detached(task_id: impl Into<String>) -> Self {
        Self::new(task_id, Arc::new(Observers::new()))
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn report(&self, partial: &str) {
        self.observers.on_task_progress(&self.task_id, partial);
    }
}

/// Logs every scheduler event through `tracing`
#[derive(Debug, Default)]
pub struct TracingObserver;

impl SchedulerObserver for TracingObserver {
    fn on_task_start(&self, task_id: &str) {
        info!(task = task_id, "Task started");
    }

    fn on_task_progress(&self, task_id: &str, partial: &str) {
        debug!(task = task_id, "{}", partial);
    }

    fn on_task_done(&self, task_id: &str, result: &str) {
        info!(task = task_id, result_bytes = result.len(), "Task done");
    }

    fn on_task_failed(&self, task_id: &str, error: &str) {
        warn!(task = task_id, "Task failed: {}", error);
    }

    fn on_round_complete(&self, round: u64) {
        debug!(round, "Round complete");
    }

    fn on_quiescent(&self, plan: &Plan) {
        info!(
            plan = %plan.name,
            "Plan quiescent: {} done, {} failed, {} pending",
            plan.count(crate::models::TaskStatus::Done),
            plan.count(crate::models::TaskStatus::Failed),
            plan.count(crate::models::TaskStatus::Pending),
        );
    }
}
