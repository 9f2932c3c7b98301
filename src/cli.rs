//! CLI interface for agentflow

use crate::dag::{compute_batches, detect_cycles, BlockReason, BlockedTask, DependencyGraph};
use crate::error::AgentFlowError;
use crate::executors::agent::AgentRunner;
use crate::logging::{init_logging, LogConfig};
use crate::metrics::MetricsObserver;
use crate::models::{Plan, TaskStatus};
use crate::observer::{Observers, TracingObserver};
use crate::parser::parse_plan_file;
use crate::recovery::{
    find_orphaned_tasks, mark_interrupted, DirectorySessionRegistry, OrphanKind, OrphanedTask,
    SessionRegistry,
};
use crate::scheduler::{RunOptions, RunSummary, Scheduler};
use crate::settings::Settings;
use crate::store::{PersistingObserver, PlanStore};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// agentflow - Run a plan of dependent tasks through a coding agent
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware task scheduler for coding agents", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace) [default: info]
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty) [default: json]
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Settings file (TOML, YAML or JSON); defaults to ./agentflow.* if present
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a plan file and its dependency graph
    Validate {
        /// Path to plan YAML/JSON file
        plan: PathBuf,
    },

    /// Show the static dispatch batches of a plan
    Preview {
        /// Path to plan YAML/JSON file
        plan: PathBuf,
    },

    /// Run a plan to completion (or until nothing more can run)
    Run {
        /// Path to plan YAML/JSON file
        plan: PathBuf,

        /// State file [default: <plan>.state.json]
        #[arg(long)]
        state: Option<PathBuf>,

        /// Continue from the state file instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Do not run the bootstrap step
        #[arg(long)]
        skip_bootstrap: bool,

        /// Retry failed tasks up to N times
        #[arg(long, default_value = "0")]
        retry_failed: u32,

        /// Write Prometheus metrics to this file when the run ends
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Show task statuses from a state file
    Status {
        /// Path to state file
        state: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find tasks left in progress by a crashed run
    Recover {
        /// Path to state file
        state: PathBuf,

        /// Mark orphaned tasks as interrupted and save the state file
        #[arg(long)]
        apply: bool,

        /// Also discard live agent sessions of orphaned tasks
        #[arg(long)]
        discard_sessions: bool,

        /// Agent session directory (overrides settings)
        #[arg(long)]
        sessions_dir: Option<PathBuf>,
    },

    /// Move a failed or interrupted task back to pending
    Reset {
        /// Path to state file
        state: PathBuf,

        /// Task id
        task: String,
    },
}

impl Cli {
    /// Initialize logging; CLI flags take precedence over settings
    pub fn init_logging(&self, settings: &Settings) -> anyhow::Result<()> {
        let level = self.log_level.as_deref().unwrap_or(&settings.log.level);
        let format = self.log_format.as_deref().unwrap_or(&settings.log.format);

        init_logging(&LogConfig::new(level, format))
    }

    /// Execute the CLI command
    pub async fn execute(&self, settings: Settings) -> anyhow::Result<()> {
        match &self.command {
            Commands::Validate { plan } => {
                self.validate_plan(plan)?;
            }
            Commands::Preview { plan } => {
                self.preview_plan(plan)?;
            }
            Commands::Run {
                plan,
                state,
                resume,
                skip_bootstrap,
                retry_failed,
                metrics_out,
            } => {
                let state = state.clone().unwrap_or_else(|| default_state_path(plan));
                let options = RunOptions {
                    skip_bootstrap: *skip_bootstrap,
                    ..RunOptions::default()
                };
                self.run_plan(
                    &settings,
                    plan,
                    &state,
                    *resume,
                    options,
                    *retry_failed,
                    metrics_out.as_deref(),
                )
                .await?;
            }
            Commands::Status { state, json } => {
                self.show_status(state, *json)?;
            }
            Commands::Recover {
                state,
                apply,
                discard_sessions,
                sessions_dir,
            } => {
                let dir = sessions_dir.clone().or_else(|| settings.sessions.dir.clone());
                self.recover(&settings, state, dir, *apply, *discard_sessions)
                    .await?;
            }
            Commands::Reset { state, task } => {
                self.reset_task(state, task)?;
            }
        }
        Ok(())
    }

    /// Validate a plan without executing
    fn validate_plan(&self, plan_path: &Path) -> anyhow::Result<()> {
        info!("Validating plan: {:?}", plan_path);

        let plan = load_acyclic_plan(plan_path)?;
        let graph = DependencyGraph::build(&plan.tasks);
        let order = graph.topological_order()?;

        println!("Plan '{}' is valid", plan.name);
        println!("Tasks: {}", plan.tasks.len());
        println!("Execution order: {}", order.join(" -> "));

        for (task, dep) in graph.unknown_dependencies() {
            println!("Warning: task '{}' depends on unknown task '{}'", task, dep);
        }

        Ok(())
    }

    /// Print the batches a plan would run in if every task succeeded
    fn preview_plan(&self, plan_path: &Path) -> anyhow::Result<()> {
        let plan = parse_plan_file(plan_path)?;
        let batches = compute_batches(&plan.tasks)?;

        println!(
            "Plan '{}': {} tasks in {} batches",
            plan.name,
            plan.tasks.len(),
            batches.len()
        );
        for (i, batch) in batches.iter().enumerate() {
            println!("  Batch {}: {}", i + 1, batch.join(", "));
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_plan(
        &self,
        settings: &Settings,
        plan_path: &Path,
        state_path: &Path,
        resume: bool,
        options: RunOptions,
        retry_failed: u32,
        metrics_out: Option<&Path>,
    ) -> anyhow::Result<()> {
        let store = PlanStore::new(state_path);

        let mut plan = if resume && store.exists() {
            info!("Resuming from state file: {:?}", state_path);
            let plan = store.load()?;
            let cycle = detect_cycles(&plan.tasks);
            if !cycle.is_empty() {
                return Err(AgentFlowError::CycleDetected(cycle).into());
            }
            plan
        } else {
            if resume {
                warn!("No state file at {:?}, starting fresh", state_path);
            }
            load_acyclic_plan(plan_path)?
        };
        info!("Plan '{}' loaded with {} tasks", plan.name, plan.tasks.len());

        if plan.count(TaskStatus::InProgress) > 0 {
            let registry = session_registry(settings, settings.sessions.dir.clone());
            let orphans = match &registry {
                Some(registry) => find_orphaned_tasks(&plan, registry).await,
                None => abandoned_tasks(&plan),
            };
            let discard = registry
                .as_ref()
                .filter(|_| settings.sessions.discard_on_interrupt)
                .map(|r| r as &dyn SessionRegistry);
            let relabelled = mark_interrupted(&mut plan, &orphans, discard).await;
            if relabelled > 0 {
                warn!(
                    "{} task(s) from a previous run were interrupted; use `agentflow reset` to requeue them",
                    relabelled
                );
            }
        }

        store.save(&plan)?;

        let metrics = match metrics_out {
            Some(_) => Some(Arc::new(MetricsObserver::new()?)),
            None => None,
        };
        let mut observers = Observers::new()
            .with(Arc::new(TracingObserver))
            .with(Arc::new(PersistingObserver::new(store.clone())));
        if let Some(metrics) = &metrics {
            observers.push(metrics.clone());
        }

        let runner = Arc::new(AgentRunner::new(settings.agent.clone()));
        let scheduler = Scheduler::new(runner);
        let mut handle = scheduler.run(plan, observers, options);

        let mut retries_left = retry_failed;
        loop {
            let quiescence = tokio::select! {
                q = handle.quiescent() => q?,
                _ = tokio::signal::ctrl_c() => {
                    error!(
                        "Interrupted; in-progress tasks stay recorded in {:?}. Run `agentflow recover` or `run --resume`.",
                        state_path
                    );
                    std::process::exit(130);
                }
            };

            let failed: Vec<String> = quiescence
                .plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect();

            if failed.is_empty() || retries_left == 0 {
                break;
            }
            retries_left -= 1;
            info!(
                "Retrying {} failed task(s) ({} retries left): {}",
                failed.len(),
                retries_left,
                failed.join(", ")
            );
            for id in failed {
                handle.retry(id);
            }
        }

        let plan = handle.finish().await?;
        store.save(&plan)?;

        if let (Some(metrics), Some(path)) = (&metrics, metrics_out) {
            std::fs::write(path, metrics.render()?)?;
            info!("Metrics written to {:?}", path);
        }

        let summary = RunSummary::from_plan(&plan);
        print_summary(&plan, &summary);

        if summary.is_complete() {
            info!("Plan completed successfully");
            Ok(())
        } else {
            error!("Plan did not complete");
            std::process::exit(1);
        }
    }

    /// Show task statuses from a state file
    fn show_status(&self, state_path: &Path, json: bool) -> anyhow::Result<()> {
        let plan = PlanStore::new(state_path).load()?;
        let summary = RunSummary::from_plan(&plan);

        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }

        println!("\nPlan: {}", plan.name);
        println!("Updated: {}", plan.updated_at.format("%Y-%m-%d %H:%M:%S"));
        println!();
        println!("{:<24} {:<12} {:<30}", "Task", "Status", "Depends On");
        println!("{:-<70}", "");
        for task in &plan.tasks {
            println!(
                "{:<24} {:<12} {:<30}",
                task.id,
                task.status,
                task.depends_on.join(", ")
            );
        }
        println!();
        print_summary(&plan, &summary);

        Ok(())
    }

    /// Report (and optionally relabel) tasks orphaned by a crashed run
    async fn recover(
        &self,
        settings: &Settings,
        state_path: &Path,
        sessions_dir: Option<PathBuf>,
        apply: bool,
        discard_sessions: bool,
    ) -> anyhow::Result<()> {
        let store = PlanStore::new(state_path);
        let mut plan = store.load()?;

        let registry = session_registry(settings, sessions_dir).ok_or_else(|| {
            anyhow::anyhow!(
                "No agent session directory configured. Pass --sessions-dir or set sessions.dir."
            )
        })?;

        let orphans = find_orphaned_tasks(&plan, &registry).await;
        if orphans.is_empty() {
            println!("No orphaned tasks");
            return Ok(());
        }

        println!("Orphaned tasks:");
        for orphan in &orphans {
            match (&orphan.kind, &orphan.session) {
                (OrphanKind::StillRunning, Some(session)) => println!(
                    "  {:<24} still running (session {}, last active {})",
                    orphan.task_id,
                    session.session_id,
                    session.last_modified.format("%Y-%m-%d %H:%M:%S")
                ),
                _ => println!("  {:<24} abandoned", orphan.task_id),
            }
        }

        if !apply {
            println!("\nRe-run with --apply to mark them as interrupted");
            return Ok(());
        }

        let discard = if discard_sessions {
            Some(&registry as &dyn SessionRegistry)
        } else {
            None
        };
        let relabelled = mark_interrupted(&mut plan, &orphans, discard).await;
        store.save(&plan)?;
        println!("Marked {} task(s) as interrupted", relabelled);

        Ok(())
    }

    /// Requeue a failed or interrupted task in a state file
    fn reset_task(&self, state_path: &Path, task_id: &str) -> anyhow::Result<()> {
        let store = PlanStore::new(state_path);
        let mut plan = store.load()?;

        plan.requeue(task_id)?;
        store.save(&plan)?;

        println!("Task '{}' reset to pending", task_id);
        Ok(())
    }
}

/// `plan.yaml` -> `plan.state.json` in the same directory
pub fn default_state_path(plan_path: &Path) -> PathBuf {
    let stem = plan_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("plan");
    plan_path.with_file_name(format!("{}.state.json", stem))
}

fn load_acyclic_plan(plan_path: &Path) -> anyhow::Result<Plan> {
    let plan = parse_plan_file(plan_path)?;
    info!("Plan '{}' parsed successfully", plan.name);

    let cycle = detect_cycles(&plan.tasks);
    if !cycle.is_empty() {
        return Err(AgentFlowError::CycleDetected(cycle).into());
    }
    Ok(plan)
}

fn session_registry(settings: &Settings, dir: Option<PathBuf>) -> Option<DirectorySessionRegistry> {
    dir.map(|dir| DirectorySessionRegistry::new(dir, settings.sessions.max_idle()))
}

/// Without a session registry every leftover in-progress task counts as abandoned
fn abandoned_tasks(plan: &Plan) -> Vec<OrphanedTask> {
    plan.tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|t| OrphanedTask {
            task_id: t.id.clone(),
            kind: OrphanKind::Abandoned,
            session: None,
        })
        .collect()
}

fn describe_block(blocked: &BlockedTask) -> String {
    match &blocked.reason {
        BlockReason::FailedDependency { failed } => {
            format!("dependency failed: {}", failed.join(", "))
        }
        BlockReason::MissingDependency { missing } => {
            format!("unknown dependency: {}", missing.join(", "))
        }
        BlockReason::Cycle => "dependency cycle".to_string(),
        BlockReason::Waiting => "waiting on dependencies".to_string(),
    }
}

fn print_summary(plan: &Plan, summary: &RunSummary) {
    println!(
        "Plan '{}': {}/{} done, {} failed, {} interrupted, {} pending",
        plan.name, summary.done, summary.total, summary.failed, summary.interrupted, summary.pending
    );

    for task in plan.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
        let reason = task.result.as_deref().unwrap_or("").lines().next().unwrap_or("");
        println!("  failed   {:<24} {}", task.id, reason);
    }
    for blocked in &summary.blocked {
        println!("  blocked  {:<24} {}", blocked.id, describe_block(blocked));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["agentflow", "validate", "plan.yaml"]);
        assert!(matches!(cli.command, Commands::Validate { .. }));
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_cli_run_command() {
        let cli = Cli::parse_from([
            "agentflow",
            "run",
            "plan.yaml",
            "--resume",
            "--retry-failed",
            "2",
            "--metrics-out",
            "metrics.prom",
        ]);
        if let Commands::Run {
            plan,
            state,
            resume,
            skip_bootstrap,
            retry_failed,
            metrics_out,
        } = &cli.command
        {
            assert_eq!(plan, &PathBuf::from("plan.yaml"));
            assert!(state.is_none());
            assert!(*resume);
            assert!(!*skip_bootstrap);
            assert_eq!(*retry_failed, 2);
            assert_eq!(metrics_out.as_ref().unwrap(), &PathBuf::from("metrics.prom"));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_recover_command() {
        let cli = Cli::parse_from(["agentflow", "recover", "plan.state.json", "--apply"]);
        assert!(matches!(
            cli.command,
            Commands::Recover {
                apply: true,
                discard_sessions: false,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_reset_command() {
        let cli = Cli::parse_from(["agentflow", "reset", "plan.state.json", "build"]);
        if let Commands::Reset { task, .. } = &cli.command {
            assert_eq!(task, "build");
        } else {
            panic!("Expected Reset command");
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "agentflow",
            "--log-level",
            "debug",
            "--config",
            "custom.toml",
            "status",
            "s.json",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
    }

    #[test]
    fn test_default_state_path() {
        assert_eq!(
            default_state_path(Path::new("/work/site.yaml")),
            PathBuf::from("/work/site.state.json")
        );
        assert_eq!(
            default_state_path(Path::new("plan")),
            PathBuf::from("plan.state.json")
        );
    }

    #[test]
    fn test_abandoned_tasks() {
        let plan = Plan::new(
            "p",
            vec![
                Task::new("a", "A", &[]).with_status(TaskStatus::InProgress),
                Task::new("b", "B", &[]).with_status(TaskStatus::Done),
            ],
        );
        let orphans = abandoned_tasks(&plan);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].task_id, "a");
        assert_eq!(orphans[0].kind, OrphanKind::Abandoned);
    }

    #[test]
    fn test_describe_block() {
        let blocked = BlockedTask {
            id: "d".to_string(),
            reason: BlockReason::FailedDependency {
                failed: vec!["b".to_string()],
            },
        };
        assert_eq!(describe_block(&blocked), "dependency failed: b");
    }
}
