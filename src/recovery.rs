//! Restart recovery
//!
//! A plan loaded from disk can still carry `in_progress` tasks if the process
//! that ran it died. Those tasks are reconciled against the agent's registry of
//! live sessions: a task whose session is still live has an agent working for
//! nobody, and a task with no live session was abandoned. Either way it is
//! orphaned.
//!
//! Recovery runs at startup, so registry failures never propagate. A registry
//! that cannot be listed simply yields no orphans.

use crate::models::{Plan, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A live agent session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub last_modified: DateTime<Utc>,
}

/// The agent's registry of running sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn list_live_sessions(&self) -> anyhow::Result<Vec<SessionInfo>>;

    async fn discard_session(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Why a task was considered orphaned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    /// Its session is still live but no process controls it
    StillRunning,
    /// No live session was found
    Abandoned,
}

/// An `in_progress` task left behind by a previous run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedTask {
    pub task_id: String,
    pub kind: OrphanKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// List orphaned tasks without modifying the plan
pub async fn find_orphaned_tasks(
    plan: &Plan,
    registry: &dyn SessionRegistry,
) -> Vec<OrphanedTask> {
    let in_progress: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .collect();

    if in_progress.is_empty() {
        return Vec::new();
    }

    let sessions = match registry.list_live_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!("Could not list agent sessions, skipping recovery: {:#}", e);
            return Vec::new();
        }
    };
    let live: HashMap<&str, &SessionInfo> = sessions
        .iter()
        .map(|s| (s.session_id.as_str(), s))
        .collect();

    let orphans: Vec<OrphanedTask> = in_progress
        .into_iter()
        .map(|task| {
            let session = task
                .session_id
                .as_deref()
                .and_then(|id| live.get(id))
                .map(|s| (*s).clone());
            let kind = if session.is_some() {
                OrphanKind::StillRunning
            } else {
                OrphanKind::Abandoned
            };
            OrphanedTask {
                task_id: task.id.clone(),
                kind,
                session,
            }
        })
        .collect();

    info!("Found {} orphaned task(s) in plan '{}'", orphans.len(), plan.name);
    orphans
}

/// Relabel orphans as `interrupted`, optionally discarding their live sessions.
///
/// Returns how many tasks were relabelled. Tasks that are no longer
/// `in_progress` are left alone.
pub async fn mark_interrupted(
    plan: &mut Plan,
    orphans: &[OrphanedTask],
    registry: Option<&dyn SessionRegistry>,
) -> usize {
    let mut relabelled = 0;

    for orphan in orphans {
        let Some(task) = plan.task_mut(&orphan.task_id) else {
            debug!("Orphan '{}' is not in the plan", orphan.task_id);
            continue;
        };
        if task.status != TaskStatus::InProgress {
            continue;
        }

        task.status = TaskStatus::Interrupted;
        task.completed_at = Some(Utc::now());
        task.result = Some(match orphan.kind {
            OrphanKind::StillRunning => {
                "Interrupted: agent session outlived the process that started it".to_string()
            }
            OrphanKind::Abandoned => "Interrupted: no live agent session found".to_string(),
        });
        relabelled += 1;

        if let (Some(registry), Some(session)) = (registry, &orphan.session) {
            if let Err(e) = registry.discard_session(&session.session_id).await {
                warn!(
                    "Could not discard session {} for task '{}': {:#}",
                    session.session_id, orphan.task_id, e
                );
            }
        }
    }

    if relabelled > 0 {
        plan.touch();
        info!("Marked {} task(s) as interrupted", relabelled);
    }
    relabelled
}

/// Session registry backed by a directory of `*.jsonl` transcripts.
///
/// A session is live when its transcript was modified within `max_idle`.
/// Discarding a session deletes its transcript.
#[derive(Debug, Clone)]
pub struct DirectorySessionRegistry {
    dir: PathBuf,
    max_idle: Duration,
}

impl DirectorySessionRegistry {
    pub fn new(dir: impl Into<PathBuf>, max_idle: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_idle,
        }
    }

    fn transcript(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }
}

#[async_trait]
impl SessionRegistry for DirectorySessionRegistry {
    async fn list_live_sessions(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.max_idle)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut sessions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
            if modified >= cutoff {
                sessions.push(SessionInfo {
                    session_id: session_id.to_string(),
                    last_modified: modified,
                });
            }
        }

        sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(sessions)
    }

    async fn discard_session(&self, session_id: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.transcript(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
