//! Dynamic, dependency-aware task scheduler
//!
//! One control loop owns the working plan. Each turn it drains retry
//! requests, asks the graph analyzer for ready tasks, dispatches all of them,
//! and then suspends until the first in-flight task settles. Newly ready
//! downstream work therefore starts as soon as any single dependency finishes,
//! interleaved with siblings that are still running.
//!
//! When nothing is ready and nothing is in flight the run is quiescent. The
//! loop publishes the quiescence point and then waits: a retry that resets a
//! failed task resumes scheduling, while [`RunHandle::finish`] (or dropping the
//! handle) ends the loop.
//!
//! # Example
//!
//! ```no_run
//! use agentflow::executors::TaskRunner;
//! use agentflow::models::{Plan, Task};
//! use agentflow::observer::{Observers, TracingObserver};
//! use agentflow::scheduler::{RunOptions, Scheduler};
//! use std::sync::Arc;
//!
//! # async fn example(runner: Arc<dyn TaskRunner>) -> agentflow::error::Result<()> {
//! let plan = Plan::new("demo", vec![Task::new("a", "A", &[]), Task::new("b", "B", &["a"])]);
//! let observers = Observers::new().with(Arc::new(TracingObserver));
//!
//! let mut handle = Scheduler::new(runner).run(plan, observers, RunOptions::default());
//! let first = handle.quiescent().await?;
//! for blocked in &first.summary.blocked {
//!     println!("{} is blocked", blocked.id);
//! }
//! let final_plan = handle.finish().await?;
//! # Ok(())
//! # }
//! ```

use crate::dag::{blocked_tasks, ready_tasks, BlockedTask};
use crate::error::{AgentFlowError, Result};
use crate::executors::TaskRunner;
use crate::models::{Plan, TaskStatus};
use crate::observer::{panic_text, Observers, ProgressReporter, SchedulerObserver};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Id reported to observers for the bootstrap step
pub const DEFAULT_BOOTSTRAP_ID: &str = "bootstrap";

/// Options for a single run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Skip the bootstrap step (resuming a plan that was already bootstrapped)
    pub skip_bootstrap: bool,
    /// Id used for bootstrap notifications
    pub bootstrap_id: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            skip_bootstrap: false,
            bootstrap_id: DEFAULT_BOOTSTRAP_ID.to_string(),
        }
    }
}

/// Status counts and blocked residue of a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub interrupted: usize,
    /// Pending tasks that cannot run, with the reason
    pub blocked: Vec<BlockedTask>,
}

impl RunSummary {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            total: plan.tasks.len(),
            done: plan.count(TaskStatus::Done),
            failed: plan.count(TaskStatus::Failed),
            pending: plan.count(TaskStatus::Pending),
            in_progress: plan.count(TaskStatus::InProgress),
            interrupted: plan.count(TaskStatus::Interrupted),
            blocked: blocked_tasks(&plan.tasks),
        }
    }

    /// Every task finished successfully
    pub fn is_complete(&self) -> bool {
        self.done == self.total
    }
}

/// A point at which nothing was ready and nothing was in flight
#[derive(Debug, Clone)]
pub struct Quiescence {
    /// 1 for the first quiescence of a run, 2 after a retry resumed it, ...
    pub index: u64,
    /// Rounds dispatched so far
    pub rounds: u64,
    pub plan: Plan,
    pub summary: RunSummary,
}

/// Enqueue side of a run's retry queue.
///
/// Clones can be moved to other tasks or threads. The scheduling loop drains
/// the queue at the top of every turn.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl RetryQueue {
    /// Request a retry. Returns `false` if the run has already ended.
    pub fn enqueue(&self, task_id: impl Into<String>) -> bool {
        match self.tx.send(task_id.into()) {
            Ok(()) => true,
            Err(rejected) => {
                debug!("Retry for '{}' dropped: run already finished", rejected.0);
                false
            }
        }
    }
}

/// Handle to a running plan
pub struct RunHandle {
    retries: RetryQueue,
    quiescence: watch::Receiver<Option<Arc<Quiescence>>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Plan>,
}

impl RunHandle {
    /// Reset `task_id` to pending if it is `failed`; otherwise a no-op
    pub fn retry(&self, task_id: impl Into<String>) {
        self.retries.enqueue(task_id);
    }

    /// Clonable retry queue for callers outside this handle's owner
    pub fn retry_queue(&self) -> RetryQueue {
        self.retries.clone()
    }

    /// Wait for the next quiescence point this handle has not seen yet.
    ///
    /// If several quiescence points happen between calls only the latest is
    /// returned.
    pub async fn quiescent(&mut self) -> Result<Arc<Quiescence>> {
        self.quiescence
            .changed()
            .await
            .map_err(|_| AgentFlowError::RunFinished)?;

        self.quiescence
            .borrow_and_update()
            .clone()
            .ok_or(AgentFlowError::RunFinished)
    }

    /// Let the loop exit at its next quiescence point and return the final plan.
    ///
    /// In-flight tasks and already queued retries are still processed.
    pub async fn finish(self) -> Result<Plan> {
        // The loop may already be gone; the join below reports that
        let _ = self.shutdown.send(true);

        self.join
            .await
            .map_err(|e| AgentFlowError::Other(format!("Scheduler loop failed: {}", e)))
    }
}

/// Drives plans through their task lifecycle
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn TaskRunner>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self { runner }
    }

    /// Start running `plan` on the current tokio runtime and return immediately.
    ///
    /// No validation happens here: callers check for cycles first. Tasks in or
    /// downstream of a cycle simply never become ready.
    pub fn run(&self, plan: Plan, observers: Observers, options: RunOptions) -> RunHandle {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (quiescence_tx, quiescence_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run_loop = RunLoop {
            plan,
            runner: self.runner.clone(),
            observers: Arc::new(observers),
            retries: retry_rx,
            shutdown: shutdown_rx,
            quiescence: quiescence_tx,
            in_flight: FuturesUnordered::new(),
            round: 0,
            quiescence_count: 0,
        };

        let join = tokio::spawn(run_loop.drive(options));

        RunHandle {
            retries: RetryQueue { tx: retry_tx },
            quiescence: quiescence_rx,
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Run until the first quiescence point and return the final plan
    pub async fn run_to_quiescence(
        &self,
        plan: Plan,
        observers: Observers,
        options: RunOptions,
    ) -> Result<Plan> {
        self.run(plan, observers, options).finish().await
    }
}

struct Settlement {
    task_id: String,
    outcome: std::result::Result<String, String>,
}

struct RunLoop {
    plan: Plan,
    runner: Arc<dyn TaskRunner>,
    observers: Arc<Observers>,
    retries: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
    quiescence: watch::Sender<Option<Arc<Quiescence>>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Settlement>>,
    round: u64,
    quiescence_count: u64,
}

impl RunLoop {
    async fn drive(mut self, options: RunOptions) -> Plan {
        info!(
            "Starting plan '{}' ({} tasks)",
            self.plan.name,
            self.plan.tasks.len()
        );

        if options.skip_bootstrap {
            debug!("Bootstrap skipped");
        } else {
            run_bootstrap(
                &self.runner,
                &self.plan,
                &self.observers,
                &options.bootstrap_id,
            )
            .await;
        }

        loop {
            self.drain_retries();

            let ready: Vec<String> = ready_tasks(&self.plan.tasks)
                .iter()
                .map(|t| t.id.clone())
                .collect();

            if ready.is_empty() {
                if self.in_flight.is_empty() {
                    self.publish_quiescence();
                    if self.wait_for_retry().await {
                        continue;
                    }
                    break;
                }
                self.await_settlement().await;
                continue;
            }

            self.round += 1;
            debug!(round = self.round, "Dispatching {} ready task(s)", ready.len());
            self.dispatch(&ready);
            self.await_settlement().await;
            self.observers.on_round_complete(self.round);
        }

        info!(
            "Plan '{}' finished after {} round(s)",
            self.plan.name, self.round
        );
        self.plan
    }

    fn drain_retries(&mut self) {
        while let Ok(task_id) = self.retries.try_recv() {
            self.apply_retry(&task_id);
        }
    }

    /// Returns `true` if the task was reset
    fn apply_retry(&mut self, task_id: &str) -> bool {
        let Some(task) = self.plan.task_mut(task_id) else {
            warn!("Retry requested for unknown task '{}'", task_id);
            return false;
        };

        if task.status != TaskStatus::Failed {
            debug!("Ignoring retry for '{}': status is {}", task_id, task.status);
            return false;
        }

        task.reset();
        self.plan.touch();
        info!("Task '{}' reset to pending for retry", task_id);
        self.observers.on_plan_changed(&self.plan);
        true
    }

    fn dispatch(&mut self, ready: &[String]) {
        for task_id in ready {
            if let Some(task) = self.plan.task_mut(task_id) {
                task.status = TaskStatus::InProgress;
                task.result = None;
                task.session_id = Some(Uuid::new_v4().to_string());
                task.started_at = Some(Utc::now());
                task.completed_at = None;
            }
            self.plan.touch();
            self.observers.on_task_start(task_id);
            self.observers.on_plan_changed(&self.plan);
        }

        // One snapshot per pass, shared by every runner dispatched in it
        let snapshot = Arc::new(self.plan.clone());

        for task_id in ready {
            let Some(task) = snapshot.task(task_id).cloned() else {
                continue;
            };
            let runner = self.runner.clone();
            let snapshot = snapshot.clone();
            let progress = ProgressReporter::new(task_id.as_str(), self.observers.clone());

            let settlement = async move {
                let outcome = AssertUnwindSafe(runner.run(&task, &snapshot, &progress))
                    .catch_unwind()
                    .await;
                Settlement {
                    task_id: task.id.clone(),
                    outcome: flatten_outcome(outcome),
                }
            };
            self.in_flight.push(settlement.boxed());
        }
    }

    async fn await_settlement(&mut self) {
        if let Some(settlement) = self.in_flight.next().await {
            self.settle(settlement);
        }
    }

    fn settle(&mut self, settlement: Settlement) {
        let Settlement { task_id, outcome } = settlement;

        let Some(task) = self.plan.task_mut(&task_id) else {
            error!("Settled task '{}' is no longer in the plan", task_id);
            return;
        };

        let (status, payload) = match outcome {
            Ok(result) => (TaskStatus::Done, result),
            Err(error) => (TaskStatus::Failed, error),
        };
        task.status = status;
        task.result = Some(payload.clone());
        task.completed_at = Some(Utc::now());
        self.plan.touch();

        info!("Task '{}' settled as {}", task_id, status);
        match status {
            TaskStatus::Done => self.observers.on_task_done(&task_id, &payload),
            _ => self.observers.on_task_failed(&task_id, &payload),
        }
        self.observers.on_plan_changed(&self.plan);
    }

    fn publish_quiescence(&mut self) {
        self.quiescence_count += 1;
        let summary = RunSummary::from_plan(&self.plan);

        info!(
            "Plan '{}' quiescent after {} round(s): {} done, {} failed, {} blocked",
            self.plan.name,
            self.round,
            summary.done,
            summary.failed,
            summary.blocked.len()
        );
        if !summary.blocked.is_empty() {
            let ids: Vec<&str> = summary.blocked.iter().map(|b| b.id.as_str()).collect();
            warn!("Blocked tasks: {}", ids.join(", "));
        }

        self.observers.on_quiescent(&self.plan);
        self.quiescence.send_replace(Some(Arc::new(Quiescence {
            index: self.quiescence_count,
            rounds: self.round,
            plan: self.plan.clone(),
            summary,
        })));
    }

    /// Park at quiescence. Returns `true` once a retry reset a task, `false`
    /// when the run should end.
    async fn wait_for_retry(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;

                request = self.retries.recv() => match request {
                    Some(task_id) => {
                        if self.apply_retry(&task_id) {
                            return true;
                        }
                    }
                    None => return false,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

async fn run_bootstrap(
    runner: &Arc<dyn TaskRunner>,
    plan: &Plan,
    observers: &Arc<Observers>,
    bootstrap_id: &str,
) {
    info!("Running bootstrap step '{}'", bootstrap_id);
    observers.on_task_start(bootstrap_id);

    let progress = ProgressReporter::new(bootstrap_id, observers.clone());
    let outcome = AssertUnwindSafe(runner.bootstrap(plan, &progress))
        .catch_unwind()
        .await;

    match flatten_outcome(outcome) {
        Ok(result) => observers.on_task_done(bootstrap_id, &result),
        Err(error) => {
            warn!("Bootstrap failed, continuing with the plan: {}", error);
            observers.on_task_failed(bootstrap_id, &error);
        }
    }
}

fn flatten_outcome(
    outcome: std::thread::Result<anyhow::Result<String>>,
) -> std::result::Result<String, String> {
    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match panic_text(panic) {
        Some(msg) => format!("Runner panicked: {}", msg),
        None => "Runner panicked".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::BlockReason;
    use crate::models::Task;

    #[test]
    fn test_run_options_default() {
        let options = RunOptions::default();
        assert!(!options.skip_bootstrap);
        assert_eq!(options.bootstrap_id, DEFAULT_BOOTSTRAP_ID);
    }

    #[test]
    fn test_summary_complete() {
        let plan = Plan::new(
            "p",
            vec![
                Task::new("a", "A", &[]).with_status(TaskStatus::Done),
                Task::new("b", "B", &["a"]).with_status(TaskStatus::Done),
            ],
        );
        let summary = RunSummary::from_plan(&plan);
        assert!(summary.is_complete());
        assert!(summary.blocked.is_empty());
    }

    #[test]
    fn test_summary_reports_blocked_residue() {
        let plan = Plan::new(
            "p",
            vec![
                Task::new("a", "A", &[]).with_status(TaskStatus::Failed),
                Task::new("b", "B", &["a"]),
            ],
        );
        let summary = RunSummary::from_plan(&plan);
        assert!(!summary.is_complete());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.blocked.len(), 1);
        assert_eq!(
            summary.blocked[0].reason,
            BlockReason::FailedDependency {
                failed: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn test_flatten_outcome() {
        assert_eq!(flatten_outcome(Ok(Ok("ok".to_string()))), Ok("ok".to_string()));

        let err = flatten_outcome(Ok(Err(anyhow::anyhow!("agent exited 2"))));
        assert_eq!(err, Err("agent exited 2".to_string()));

        let panicked = flatten_outcome(Err(Box::new("boom")));
        assert_eq!(panicked, Err("Runner panicked: boom".to_string()));
    }

    #[tokio::test]
    async fn test_retry_queue_after_finish() {
        struct Noop;

        #[async_trait::async_trait]
        impl TaskRunner for Noop {
            async fn run(
                &self,
                _task: &Task,
                _plan: &Plan,
                _progress: &ProgressReporter,
            ) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }

        let scheduler = Scheduler::new(Arc::new(Noop));
        let handle = scheduler.run(
            Plan::new("empty", vec![]),
            Observers::new(),
            RunOptions::default(),
        );
        let queue = handle.retry_queue();

        let plan = handle.finish().await.unwrap();
        assert!(plan.tasks.is_empty());
        assert!(!queue.enqueue("a"));
    }
}
