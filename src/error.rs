//! Error types for agentflow

use thiserror::Error;

/// agentflow error types
#[derive(Error, Debug)]
pub enum AgentFlowError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON (state file) errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Plan file exceeded size limit
    #[error("Plan file exceeds 1MB limit (size: {0} bytes)")]
    PlanSizeExceeded(usize),

    /// Task count exceeded limit
    #[error("Task count {count} exceeds limit of {limit}")]
    TaskCountExceeded { count: usize, limit: usize },

    /// Task id validation error
    #[error("Task id '{id}' exceeds {max} characters")]
    TaskIdTooLong { id: String, max: usize },

    /// Invalid task id format
    #[error("Invalid task id '{id}': only alphanumeric, underscore, and dash allowed")]
    InvalidTaskId { id: String },

    /// The same id used by two tasks
    #[error("Duplicate task id '{0}'")]
    DuplicateTaskId(String),

    /// Dependency graph is not a DAG
    #[error("Cycle detected in task graph: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    /// Missing task dependency
    #[error("Task '{task}' depends on non-existent task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    /// Lookup of a task id that is not in the plan
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// Task cannot be moved back to pending from its current status
    #[error("Task '{task}' is {status} and cannot be requeued")]
    NotRequeueable { task: String, status: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent invocation timeout
    #[error("Task '{task}' timed out after {timeout} seconds")]
    TaskTimeout { task: String, timeout: u64 },

    /// Settings loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The scheduling loop has already exited
    #[error("Scheduler run has already finished")]
    RunFinished,

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias using AgentFlowError
pub type Result<T> = std::result::Result<T, AgentFlowError>;
