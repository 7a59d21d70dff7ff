use std::path::PathBuf;

use chrono::Utc;
use db::{
    DBService,
    models::{
        audit_event::AuditEventType,
        cycle::is_unique_violation,
        learning::{CreateLearning, Learning, LearningSource},
        session_branch::{BranchStatus, CreateSessionBranch, SessionBranch},
        task::{Task, TaskStatus},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::services::{
    audit::AuditLog,
    git::{GitService, GitServiceError},
};

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("task {0} already has an active branch")]
    ActiveBranchExists(Uuid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// What to carry into the fork besides the work summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotOptions {
    #[serde(default)]
    pub recent_errors: Vec<String>,
    #[serde(default)]
    pub include_full_history: bool,
}

/// Experimental forks of a running session. At most one is active per task.
#[derive(Clone)]
pub struct BranchManager {
    db: DBService,
    git: GitService,
}

impl BranchManager {
    pub fn new(db: DBService) -> Self {
        Self {
            db,
            git: GitService::new(),
        }
    }

    pub async fn create(
        &self,
        task_id: Uuid,
        work_summary: &str,
        options: SnapshotOptions,
    ) -> Result<SessionBranch, BranchError> {
        let work_summary = work_summary.trim();
        if work_summary.is_empty() {
            return Err(BranchError::Validation("work summary must not be empty".into()));
        }
        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(BranchError::NotFound("task", task_id))?;
        let Some(session_id) = task.session_id.clone().filter(|_| task.status == TaskStatus::InProgress)
        else {
            return Err(BranchError::Conflict(format!(
                "task {} has no running session to branch from",
                task.id
            )));
        };
        if SessionBranch::find_active_for_task(&self.db.pool, task_id)
            .await?
            .is_some()
        {
            return Err(BranchError::ActiveBranchExists(task_id));
        }

        let (head, changed_paths) = self.worktree_state(task.worktree_path.as_deref()).await;
        let snapshot = json!({
            "session_id": session_id,
            "branch_name": task.branch_name,
            "worktree_path": task.worktree_path,
            "head": head,
            "changed_paths": changed_paths,
            "recent_errors": options.recent_errors,
            "include_full_history": options.include_full_history,
            "captured_at": Utc::now(),
        });

        let mut tx = self.db.pool.begin().await?;
        let branch = SessionBranch::create(
            &mut *tx,
            &CreateSessionBranch {
                task_id,
                session_id: Some(session_id.clone()),
                work_summary: work_summary.to_string(),
                snapshot: snapshot.to_string(),
            },
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BranchError::ActiveBranchExists(task_id)
            } else {
                e.into()
            }
        })?;
        AuditLog::record_with(
            &mut *tx,
            Some(task.project_id),
            Some(task_id),
            AuditEventType::BranchSessionStarted,
            json!({
                "branch_id": branch.id,
                "session_id": session_id,
                "work_summary": branch.work_summary,
                "include_full_history": options.include_full_history,
            }),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(task_id = %task_id, branch_id = %branch.id, "Branch session started");
        Ok(branch)
    }

    /// HEAD and uncommitted paths of the task's checkout. Missing or broken
    /// worktrees yield an empty state rather than blocking the fork.
    async fn worktree_state(&self, worktree_path: Option<&str>) -> (Option<String>, Vec<String>) {
        let Some(path) = worktree_path.map(PathBuf::from) else {
            return (None, Vec::new());
        };
        let git = self.git.clone();
        let state = tokio::task::spawn_blocking(move || {
            let head = git.head_sha(&path)?;
            let changed = git.changed_paths(&path)?;
            Ok::<_, GitServiceError>((Some(head), changed))
        })
        .await;
        match state {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                tracing::debug!("Worktree state unavailable for snapshot: {}", e);
                (None, Vec::new())
            }
            Err(e) => {
                tracing::warn!("Worktree snapshot task failed: {}", e);
                (None, Vec::new())
            }
        }
    }

    /// Resolve as merged; `summary` becomes a learning on the task and its cycle.
    pub async fn merge(&self, branch_id: Uuid, summary: &str) -> Result<SessionBranch, BranchError> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(BranchError::Validation("merge summary must not be empty".into()));
        }
        self.close(branch_id, BranchStatus::Merged, summary).await
    }

    pub async fn discard(&self, branch_id: Uuid, reason: &str) -> Result<SessionBranch, BranchError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BranchError::Validation("discard reason must not be empty".into()));
        }
        self.close(branch_id, BranchStatus::Discarded, reason).await
    }

    async fn close(
        &self,
        branch_id: Uuid,
        status: BranchStatus,
        resolution: &str,
    ) -> Result<SessionBranch, BranchError> {
        let existing = self.find(branch_id).await?;
        if existing.status != BranchStatus::Active {
            return Err(BranchError::Conflict(format!(
                "branch {} is already {}",
                branch_id, existing.status
            )));
        }
        let task = Task::find_by_id(&self.db.pool, existing.task_id)
            .await?
            .ok_or(BranchError::NotFound("task", existing.task_id))?;

        let mut tx = self.db.pool.begin().await?;
        let Some(branch) = SessionBranch::resolve(&mut *tx, branch_id, status, resolution).await?
        else {
            return Err(BranchError::Conflict(format!(
                "branch {branch_id} was resolved concurrently"
            )));
        };

        let (event_type, mut details) = match status {
            BranchStatus::Merged => {
                Learning::create(
                    &mut *tx,
                    &CreateLearning {
                        project_id: task.project_id,
                        cycle_id: task.cycle_id,
                        task_id: Some(task.id),
                        content: resolution.to_string(),
                        source: LearningSource::BranchMerge,
                    },
                )
                .await?;
                (AuditEventType::BranchSessionMerged, json!({ "summary": resolution }))
            }
            _ => (AuditEventType::BranchSessionDiscarded, json!({ "reason": resolution })),
        };
        details["branch_id"] = json!(branch.id);
        details["session_id"] = json!(branch.session_id);
        AuditLog::record_with(&mut *tx, Some(task.project_id), Some(task.id), event_type, details)
            .await?;
        tx.commit().await?;
        tracing::info!(branch_id = %branch.id, status = %branch.status, "Branch session resolved");
        Ok(branch)
    }

    pub async fn find(&self, branch_id: Uuid) -> Result<SessionBranch, BranchError> {
        SessionBranch::find_by_id(&self.db.pool, branch_id)
            .await?
            .ok_or(BranchError::NotFound("branch", branch_id))
    }

    pub async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<SessionBranch>, BranchError> {
        Ok(SessionBranch::find_by_task_id(&self.db.pool, task_id).await?)
    }

    pub async fn active_for_task(&self, task_id: Uuid) -> Result<Option<SessionBranch>, BranchError> {
        Ok(SessionBranch::find_active_for_task(&self.db.pool, task_id).await?)
    }
}
