//! Prometheus metrics for plan runs
//!
//! `MetricsObserver` is a scheduler observer that records into its own
//! registry. The CLI renders the registry in the text exposition format when a
//! run finishes.
//!
//! # Available Metrics
//!
//! - `agentflow_task_outcomes_total{status}` - Counter of settled tasks (`done` or `failed`)
//! - `agentflow_task_duration_seconds` - Histogram of task durations
//! - `agentflow_active_tasks` - Gauge of tasks currently in flight
//! - `agentflow_rounds_total` - Counter of completed dispatch rounds
//! - `agentflow_quiescence_total` - Counter of quiescence points reached
//!
//! # Example
//!
//! ```
//! use agentflow::metrics::MetricsObserver;
//! use agentflow::observer::SchedulerObserver;
//!
//! let metrics = MetricsObserver::new()?;
//! metrics.on_task_start("build");
//! metrics.on_task_done("build", "ok");
//! assert!(metrics.render()?.contains("agentflow_task_outcomes_total"));
//! # Ok::<(), agentflow::error::AgentFlowError>(())
//! ```

use crate::error::{AgentFlowError, Result};
use crate::models::Plan;
use crate::observer::SchedulerObserver;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Histogram bucket boundaries for task duration metrics (in seconds).
/// Agent tasks run from seconds to tens of minutes.
const TASK_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

pub struct MetricsObserver {
    registry: Registry,
    task_outcomes: IntCounterVec,
    task_duration: Histogram,
    active_tasks: IntGauge,
    rounds: IntCounter,
    quiescence: IntCounter,
    started: Mutex<HashMap<String, Instant>>,
}

impl MetricsObserver {
    /// Create an observer with all metrics registered
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let task_outcomes = IntCounterVec::new(
            Opts::new(
                "agentflow_task_outcomes_total",
                "Total number of settled tasks by outcome",
            ),
            &["status"],
        )?;

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agentflow_task_duration_seconds",
                "Task run duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
        )?;

        let active_tasks = IntGauge::new("agentflow_active_tasks", "Tasks currently in flight")?;
        let rounds = IntCounter::new("agentflow_rounds_total", "Completed dispatch rounds")?;
        let quiescence = IntCounter::new(
            "agentflow_quiescence_total",
            "Quiescence points reached",
        )?;

        registry.register(Box::new(task_outcomes.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(rounds.clone()))?;
        registry.register(Box::new(quiescence.clone()))?;

        Ok(Self {
            registry,
            task_outcomes,
            task_duration,
            active_tasks,
            rounds,
            quiescence,
            started: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| AgentFlowError::Other(e.to_string()))
    }

    /// Start times of tasks in flight. A poisoned lock still holds valid entries.
    fn started(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, task_id: &str, status: &str) {
        self.task_outcomes.with_label_values(&[status]).inc();

        let started = self.started().remove(task_id);
        if let Some(started) = started {
            self.active_tasks.dec();
            self.task_duration.observe(started.elapsed().as_secs_f64());
        }
    }
}

impl SchedulerObserver for MetricsObserver {
    fn on_task_start(&self, task_id: &str) {
        let previous = self.started().insert(task_id.to_string(), Instant::now());
        if previous.is_none() {
            self.active_tasks.inc();
        }
    }

    fn on_task_done(&self, task_id: &str, _result: &str) {
        self.settle(task_id, "done");
    }

    fn on_task_failed(&self, task_id: &str, _error: &str) {
        self.settle(task_id, "failed");
    }

    fn on_round_complete(&self, _round: u64) {
        self.rounds.inc();
    }

    fn on_quiescent(&self, _plan: &Plan) {
        self.quiescence.inc();
    }
}
