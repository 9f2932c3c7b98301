//! JSON state file for the working plan
//!
//! The state file is the plan itself, statuses and results included. It is
//! rewritten after every task mutation so that a crash leaves the last known
//! `in_progress` set on disk for recovery.

use crate::error::Result;
use crate::models::Plan;
use crate::observer::SchedulerObserver;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Reads and writes a plan at a fixed path
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the plan from disk
    pub fn load(&self) -> Result<Plan> {
        let content = fs::read_to_string(&self.path)?;
        let plan = serde_json::from_str(&content)?;
        Ok(plan)
    }

    /// Write the plan atomically (temp file in the same directory, then rename)
    pub fn save(&self, plan: &Plan) -> Result<()> {
        let json = serde_json::to_string_pretty(plan)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.temp_path();
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved plan '{}' to {}", plan.name, self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "plan".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Saves the plan on every change notification.
///
/// Save failures are logged and counted; they never reach the scheduler.
#[derive(Debug)]
pub struct PersistingObserver {
    store: PlanStore,
    failures: AtomicU64,
}

impl PersistingObserver {
    pub fn new(store: PlanStore) -> Self {
        Self {
            store,
            failures: AtomicU64::new(0),
        }
    }

    /// Number of saves that failed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn persist(&self, plan: &Plan) {
        if let Err(e) = self.store.save(plan) {
            error!(
                "Failed to save plan state to {}: {}",
                self.store.path().display(),
                e
            );
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl SchedulerObserver for PersistingObserver {
    fn on_plan_changed(&self, plan: &Plan) {
        self.persist(plan);
    }

    fn on_quiescent(&self, plan: &Plan) {
        self.persist(plan);
    }
}
