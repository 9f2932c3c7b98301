//! Plan file parser with validation
//!
//! Plans are written in YAML; JSON plans parse too since JSON is a YAML
//! subset. Field names may be snake_case or camelCase.

use crate::dag::DependencyGraph;
use crate::error::{AgentFlowError, Result};
use crate::models::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Parse a plan from a YAML or JSON file.
///
/// Enforces the input limits:
/// - file size must be <= 1MB
/// - task count must be <= 1,000
/// - task ids must be alphanumeric + underscore/dash, at most 64 chars
/// - task ids must be unique
///
/// Dependencies on ids that are not in the plan are accepted but logged: such
/// tasks can never become ready.
///
/// # Example
///
/// ```no_run
/// use agentflow::parser::parse_plan_file;
///
/// let plan = parse_plan_file("plan.yaml")?;
/// println!("Loaded plan: {}", plan.name);
/// # Ok::<(), agentflow::error::AgentFlowError>(())
/// ```
pub fn parse_plan_file<P: AsRef<Path>>(path: P) -> Result<Plan> {
    let size = fs::metadata(path.as_ref())?.len() as usize;
    if size > MAX_PLAN_FILE_SIZE {
        return Err(AgentFlowError::PlanSizeExceeded(size));
    }

    let content = fs::read_to_string(path)?;
    parse_plan_str(&content)
}

/// Parse a plan from a YAML (or JSON) string.
///
/// # Example
///
/// ```
/// use agentflow::parser::parse_plan_str;
///
/// let yaml = r#"
/// name: landing-page
/// tasks:
///   - id: copy
///     title: "Write the copy"
///   - id: layout
///     title: "Build the layout"
///     depends_on: [copy]
/// "#;
///
/// let plan = parse_plan_str(yaml)?;
/// assert_eq!(plan.tasks.len(), 2);
/// # Ok::<(), agentflow::error::AgentFlowError>(())
/// ```
pub fn parse_plan_str(content: &str) -> Result<Plan> {
    if content.len() > MAX_PLAN_FILE_SIZE {
        return Err(AgentFlowError::PlanSizeExceeded(content.len()));
    }

    let plan: Plan = serde_yaml::from_str(content)?;

    if plan.tasks.len() > MAX_TASK_COUNT {
        return Err(AgentFlowError::TaskCountExceeded {
            count: plan.tasks.len(),
            limit: MAX_TASK_COUNT,
        });
    }

    let mut seen = HashSet::with_capacity(plan.tasks.len());
    for task in &plan.tasks {
        validate_task_id(&task.id)?;
        if !seen.insert(task.id.as_str()) {
            return Err(AgentFlowError::DuplicateTaskId(task.id.clone()));
        }
    }

    for (task, dep) in DependencyGraph::build(&plan.tasks).unknown_dependencies() {
        warn!(
            "Task '{}' depends on unknown task '{}' and will never run",
            task, dep
        );
    }

    Ok(plan)
}

/// Validate task id format and length
fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(AgentFlowError::InvalidTaskId { id: id.to_string() });
    }

    if id.len() > MAX_TASK_ID_LEN {
        return Err(AgentFlowError::TaskIdTooLong {
            id: id.to_string(),
            max: MAX_TASK_ID_LEN,
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AgentFlowError::InvalidTaskId { id: id.to_string() });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_plan() {
        let yaml = r#"
name: blog
description: "Static blog"
tasks:
  - id: scaffold
    title: "Scaffold the project"
    acceptance_criteria:
      - "cargo build succeeds"
  - id: posts
    title: "Render posts"
    depends_on: [scaffold]
"#;
        let plan = parse_plan_str(yaml).unwrap();
        assert_eq!(plan.name, "blog");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec!["scaffold"]);
        assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_parse_json_plan_with_camel_case() {
        let json = r#"{
            "name": "blog",
            "createdAt": "2026-01-02T03:04:05Z",
            "tasks": [
                {"id": "a", "title": "A", "status": "done", "result": "ok"},
                {"id": "b", "title": "B", "dependsOn": ["a"]}
            ]
        }"#;
        let plan = parse_plan_str(json).unwrap();
        assert_eq!(plan.tasks[0].status, TaskStatus::Done);
        assert_eq!(plan.tasks[0].result.as_deref(), Some("ok"));
        assert_eq!(plan.tasks[1].depends_on, vec!["a"]);
        assert_eq!(plan.created_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_plan_size_limit() {
        let large = "name: test\ntasks:\n".to_string() + &"  - id: x\n".repeat(150_000);
        let result = parse_plan_str(&large);
        assert!(matches!(result, Err(AgentFlowError::PlanSizeExceeded(_))));
    }

    #[test]
    fn test_task_count_limit() {
        let mut yaml = "name: test\ntasks:\n".to_string();
        for i in 0..1001 {
            yaml.push_str(&format!("  - id: task{}\n    title: t\n", i));
        }
        let result = parse_plan_str(&yaml);
        assert!(matches!(
            result,
            Err(AgentFlowError::TaskCountExceeded { count: 1001, .. })
        ));
    }

    #[test]
    fn test_task_id_validation() {
        assert!(validate_task_id("task1").is_ok());
        assert!(validate_task_id("task_1").is_ok());
        assert!(validate_task_id("task-1").is_ok());

        assert!(matches!(
            validate_task_id(""),
            Err(AgentFlowError::InvalidTaskId { .. })
        ));
        assert!(matches!(
            validate_task_id("task 1"),
            Err(AgentFlowError::InvalidTaskId { .. })
        ));
        assert!(matches!(
            validate_task_id("a".repeat(65).as_str()),
            Err(AgentFlowError::TaskIdTooLong { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
name: test
tasks:
  - id: a
    title: first
  - id: a
    title: second
"#;
        assert!(matches!(
            parse_plan_str(yaml),
            Err(AgentFlowError::DuplicateTaskId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_unknown_dependency_is_accepted() {
        let yaml = r#"
name: test
tasks:
  - id: a
    title: A
    depends_on: [ghost]
"#;
        let plan = parse_plan_str(yaml).unwrap();
        assert_eq!(plan.tasks[0].depends_on, vec!["ghost"]);
    }

    #[test]
    fn test_cycles_are_not_a_parse_error() {
        let yaml = r#"
name: test
tasks:
  - id: a
    title: A
    depends_on: [b]
  - id: b
    title: B
    depends_on: [a]
"#;
        assert!(parse_plan_str(yaml).is_ok());
    }

    #[test]
    fn test_parse_plan_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(&path, "name: file-plan\ntasks:\n  - id: a\n    title: A\n").unwrap();

        let plan = parse_plan_file(&path).unwrap();
        assert_eq!(plan.name, "file-plan");

        assert!(matches!(
            parse_plan_file(dir.path().join("missing.yaml")),
            Err(AgentFlowError::Io(_))
        ));
    }
}
