//! Core data models: tasks, their lifecycle, and the plan that holds them

use crate::error::{AgentFlowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Input validation limits
pub const MAX_PLAN_FILE_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_TASK_COUNT: usize = 1_000;
pub const MAX_TASK_ID_LEN: usize = 64;
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

/// Task status
///
/// `Pending -> InProgress -> Done | Failed`. A retry moves `Failed` back to
/// `Pending`. `Interrupted` is only ever set by restart recovery.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Interrupted,
}

impl TaskStatus {
    /// Whether the status is final for the current run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Interrupted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A unit of work handed to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Agent session assigned when the task was last dispatched
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with the given dependencies
    pub fn new(id: impl Into<String>, title: impl Into<String>, depends_on: &[&str]) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Pending,
            result: None,
            session_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Reset to `Pending`, dropping everything the previous attempt recorded
    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.session_id = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// An ordered collection of tasks plus metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Number of tasks currently in the given status
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Move a `failed` or `interrupted` task back to `pending`.
    ///
    /// This is the caller's explicit decision path for tasks that recovery
    /// relabelled; the scheduler itself only ever resets `failed` tasks.
    pub fn requeue(&mut self, id: &str) -> Result<()> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| AgentFlowError::UnknownTask(id.to_string()))?;

        match task.status {
            TaskStatus::Failed | TaskStatus::Interrupted => {
                task.reset();
                self.touch();
                Ok(())
            }
            status => Err(AgentFlowError::NotRequeueable {
                task: id.to_string(),
                status: status.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Done.to_string(), "done");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
        assert_eq!(TaskStatus::Interrupted.to_string(), "interrupted");
    }

    #[test]
    fn test_task_status_serde() {
        let status: TaskStatus = serde_yaml::from_str("in_progress").unwrap();
        assert_eq!(status, TaskStatus::InProgress);

        let json = serde_json::to_string(&TaskStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }

    #[test]
    fn test_task_defaults_from_yaml() {
        let yaml = r#"
id: setup
title: "Set up the project"
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.depends_on.is_empty());
        assert!(task.acceptance_criteria.is_empty());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_camel_case_aliases() {
        let json = r#"{
            "id": "b",
            "title": "B",
            "dependsOn": ["a"],
            "acceptanceCriteria": ["compiles"],
            "status": "failed",
            "sessionId": "abc"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.depends_on, vec!["a"]);
        assert_eq!(task.acceptance_criteria, vec!["compiles"]);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_requeue_failed_and_interrupted() {
        let mut failed = Task::new("a", "A", &[]).with_status(TaskStatus::Failed);
        failed.result = Some("boom".to_string());
        let interrupted = Task::new("b", "B", &[]).with_status(TaskStatus::Interrupted);
        let mut plan = Plan::new("p", vec![failed, interrupted]);

        plan.requeue("a").unwrap();
        plan.requeue("b").unwrap();

        assert_eq!(plan.task("a").unwrap().status, TaskStatus::Pending);
        assert!(plan.task("a").unwrap().result.is_none());
        assert_eq!(plan.task("b").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_requeue_rejects_other_statuses() {
        let mut plan = Plan::new(
            "p",
            vec![Task::new("a", "A", &[]).with_status(TaskStatus::Done)],
        );

        assert!(matches!(
            plan.requeue("a"),
            Err(AgentFlowError::NotRequeueable { .. })
        ));
        assert!(matches!(
            plan.requeue("missing"),
            Err(AgentFlowError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_count() {
        let plan = Plan::new(
            "p",
            vec![
                Task::new("a", "A", &[]).with_status(TaskStatus::Done),
                Task::new("b", "B", &["a"]),
                Task::new("c", "C", &["a"]),
            ],
        );
        assert_eq!(plan.count(TaskStatus::Done), 1);
        assert_eq!(plan.count(TaskStatus::Pending), 2);
    }
}
