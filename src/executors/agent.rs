//! Agent command runner
//!
//! Spawns the configured agent CLI once per task, writes the rendered task
//! prompt to its stdin and treats stdout as the task result. Each stdout line is
//! forwarded to the progress reporter as it arrives.

use crate::error::AgentFlowError;
use crate::executors::{truncate_output_str, TaskRunner};
use crate::models::{Plan, Task, TaskStatus, MAX_OUTPUT_SIZE};
use crate::observer::ProgressReporter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

/// How to invoke the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Program to execute (looked up on PATH)
    pub program: String,
    /// Arguments passed before any model or session flags
    pub args: Vec<String>,
    pub model: Option<String>,
    pub model_flag: String,
    /// Flag used to pin the agent session id; `None` disables it
    pub session_flag: Option<String>,
    pub timeout_secs: u64,
    pub workdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Prompt for the one-off bootstrap step; no bootstrap when unset
    pub bootstrap_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: None,
            model_flag: "--model".to_string(),
            session_flag: Some("--session-id".to_string()),
            timeout_secs: 1800,
            workdir: None,
            env: HashMap::new(),
            bootstrap_prompt: None,
        }
    }
}

/// Runs tasks by invoking an agent CLI
#[derive(Debug, Clone)]
pub struct AgentRunner {
    settings: AgentSettings,
}

impl AgentRunner {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn command(&self, session_id: Option<&str>) -> Command {
        let settings = &self.settings;
        let mut cmd = Command::new(&settings.program);
        cmd.args(&settings.args);

        if let Some(model) = &settings.model {
            cmd.arg(&settings.model_flag).arg(model);
        }
        if let (Some(flag), Some(id)) = (&settings.session_flag, session_id) {
            cmd.arg(flag).arg(id);
        }
        if let Some(workdir) = &settings.workdir {
            cmd.current_dir(workdir);
        }
        cmd.envs(&settings.env);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Timed-out agents must not outlive the future
        cmd.kill_on_drop(true);
        cmd
    }

    async fn invoke(
        &self,
        label: &str,
        prompt: String,
        session_id: Option<&str>,
        progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        info!("Invoking agent '{}' for '{}'", self.settings.program, label);
        debug!("Agent args: {:?}", self.settings.args);

        let start = std::time::Instant::now();
        let mut child = self.command(session_id).spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // An agent that exits early closes the pipe; nothing to do about it
                let _ = stdin.write_all(prompt.as_bytes()).await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentFlowError::Other("agent stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentFlowError::Other("agent stderr not captured".to_string()))?;

        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut output = String::new();
            while let Some(line) = lines.next_line().await? {
                progress.report(&line);
                if output.len() <= MAX_OUTPUT_SIZE {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((output, status))
        };

        let timeout = self.settings.timeout_secs;
        let outcome = tokio::time::timeout(Duration::from_secs(timeout), collect).await;
        match outcome {
            Ok(Ok((output, status))) => {
                let stderr = stderr_reader.await.unwrap_or_default();
                info!(
                    "Agent for '{}' exited with {} after {:?}",
                    label,
                    status,
                    start.elapsed()
                );

                if !status.success() {
                    let detail = stderr.trim();
                    anyhow::bail!(
                        "agent exited with {}{}",
                        status,
                        if detail.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", tail(detail, 2_000))
                        }
                    );
                }

                let (result, truncated) = truncate_output_str(output.trim_end());
                if truncated {
                    debug!("Agent output truncated to {} bytes", MAX_OUTPUT_SIZE);
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                error!("Agent I/O failed for '{}': {}", label, e);
                Err(AgentFlowError::Io(e).into())
            }
            Err(_) => {
                error!("Agent for '{}' timed out after {} seconds", label, timeout);
                let _ = child.kill().await;
                Err(AgentFlowError::TaskTimeout {
                    task: label.to_string(),
                    timeout,
                }
                .into())
            }
        }
    }
}

#[async_trait]
impl TaskRunner for AgentRunner {
    async fn run(
        &self,
        task: &Task,
        plan: &Plan,
        progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        let prompt = render_prompt(task, plan);
        self.invoke(&task.id, prompt, task.session_id.as_deref(), progress)
            .await
    }

    async fn bootstrap(
        &self,
        plan: &Plan,
        progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        let Some(template) = &self.settings.bootstrap_prompt else {
            return Ok("no bootstrap prompt configured".to_string());
        };

        let mut prompt = format!("# Plan: {}\n", plan.name);
        if !plan.description.is_empty() {
            let _ = writeln!(prompt, "\n{}", plan.description);
        }
        let _ = write!(prompt, "\n{}\n", template);

        self.invoke(progress.task_id(), prompt, None, progress).await
    }
}

/// Render the prompt sent to the agent for one task
pub fn render_prompt(task: &Task, plan: &Plan) -> String {
    let mut prompt = format!("# Plan: {}\n", plan.name);
    if !plan.description.is_empty() {
        let _ = writeln!(prompt, "\n{}", plan.description);
    }

    let _ = writeln!(prompt, "\n## Task {}: {}", task.id, task.title);
    if !task.description.is_empty() {
        let _ = writeln!(prompt, "\n{}", task.description);
    }

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n### Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            let _ = writeln!(prompt, "- {}", criterion);
        }
    }

    let finished: Vec<&Task> = task
        .depends_on
        .iter()
        .filter_map(|dep| plan.task(dep))
        .filter(|dep| dep.status == TaskStatus::Done)
        .collect();
    if !finished.is_empty() {
        prompt.push_str("\n### Already completed\n");
        for dep in finished {
            let _ = writeln!(prompt, "- {}: {}", dep.id, dep.title);
        }
    }

    prompt
}

/// Last `max` bytes of `text`, on a char boundary
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
