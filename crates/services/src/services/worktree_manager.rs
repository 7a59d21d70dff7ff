use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use db::models::{repo::Repo, task::Task};
use thiserror::Error;
use tokio::sync::Mutex;
use utils::text::{git_branch_id, short_uuid};

use crate::services::git::{GitService, GitServiceError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitServiceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),
    #[error("worktree path already in use: {0}")]
    PathInUse(PathBuf),
    #[error("git task failed: {0}")]
    TaskJoin(String),
}

/// A task's isolated checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub branch: String,
    pub path: PathBuf,
}

/// Creates and reclaims one worktree per task under
/// `<root>/<repo-dir>/<task-dir>`, on a branch under the configured prefix.
#[derive(Clone)]
pub struct WorktreeManager {
    git: GitService,
    root: PathBuf,
    branch_prefix: String,
    repo_locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new(git: GitService, root: PathBuf, branch_prefix: impl Into<String>) -> Self {
        Self {
            git,
            root,
            branch_prefix: branch_prefix.into(),
            repo_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch_prefix(&self) -> &str {
        &self.branch_prefix
    }

    pub fn branch_name(&self, task: &Task) -> String {
        format!("{}/{}", self.branch_prefix, task_dir_name(task))
    }

    pub fn repo_dir(&self, repo: &Repo) -> PathBuf {
        let slug = git_branch_id(&repo.name);
        let name = if slug.is_empty() {
            format!("repo-{}", short_uuid(&repo.id))
        } else {
            format!("{}-{}", slug, short_uuid(&repo.id))
        };
        self.root.join(name)
    }

    pub fn worktree_path(&self, repo: &Repo, task: &Task) -> PathBuf {
        self.repo_dir(repo).join(task_dir_name(task))
    }

    fn repo_lock(&self, repo_path: &Path) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repo_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Check out a fresh branch for `task` from the repo's current HEAD.
    #[tracing::instrument(skip(self, repo, task), fields(task_id = %task.id, repo = %repo.name))]
    pub async fn create_worktree(&self, repo: &Repo, task: &Task) -> Result<Worktree, WorktreeError> {
        let branch = self.branch_name(task);
        if !self.git.is_branch_name_valid(&branch) {
            return Err(WorktreeError::InvalidBranchName(branch));
        }
        let path = self.worktree_path(repo, task);
        let repo_path = repo.path_buf();
        let lock = self.repo_lock(&repo_path);
        let _guard = lock.lock().await;

        if path.exists() {
            return Err(WorktreeError::PathInUse(path));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let git = self.git.clone();
        let (wt_path, wt_branch) = (path.clone(), branch.clone());
        tokio::task::spawn_blocking(move || -> Result<(), GitServiceError> {
            git.ensure_repository(&repo_path)?;
            let create_branch = !git.check_branch_exists(&repo_path, &wt_branch)?;
            git.add_worktree(&repo_path, &wt_path, &wt_branch, create_branch)
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))??;

        tracing::info!(branch = %branch, path = %path.display(), "Created worktree");
        Ok(Worktree { branch, path })
    }

    /// Re-attach a task's persisted worktree, recreating the checkout from its
    /// existing branch when the directory has vanished.
    #[tracing::instrument(skip(self, repo, task), fields(task_id = %task.id))]
    pub async fn ensure_worktree(&self, repo: &Repo, task: &Task) -> Result<Worktree, WorktreeError> {
        let path = task
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.worktree_path(repo, task));
        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| self.branch_name(task));

        if path.join(".git").exists() {
            return Ok(Worktree { branch, path });
        }

        let repo_path = repo.path_buf();
        let lock = self.repo_lock(&repo_path);
        let _guard = lock.lock().await;
        // Another caller may have recreated it while we waited.
        if path.join(".git").exists() {
            return Ok(Worktree { branch, path });
        }

        tracing::warn!(path = %path.display(), "Worktree missing, recreating from branch");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let git = self.git.clone();
        let (wt_path, wt_branch) = (path.clone(), branch.clone());
        tokio::task::spawn_blocking(move || -> Result<(), GitServiceError> {
            // Stale metadata for the vanished directory blocks re-adding it.
            git.prune_worktrees(&repo_path)?;
            if wt_path.exists() {
                std::fs::remove_dir_all(&wt_path)?;
            }
            let create_branch = !git.check_branch_exists(&repo_path, &wt_branch)?;
            git.add_worktree(&repo_path, &wt_path, &wt_branch, create_branch)
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))??;

        Ok(Worktree { branch, path })
    }

    /// Detach and delete a worktree, then prune stale metadata. The branch is kept.
    pub async fn remove_worktree(&self, repo_path: &Path, worktree_path: &Path) -> Result<(), WorktreeError> {
        let lock = self.repo_lock(repo_path);
        let _guard = lock.lock().await;

        let git = self.git.clone();
        let (repo_path, worktree_path) = (repo_path.to_path_buf(), worktree_path.to_path_buf());
        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            if let Err(e) = git.remove_worktree(&repo_path, &worktree_path, true) {
                tracing::debug!("git worktree remove failed, deleting directory: {}", e);
                if worktree_path.exists() {
                    std::fs::remove_dir_all(&worktree_path)?;
                }
            }
            git.prune_worktrees(&repo_path)?;
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    /// Cleanup variant for callers that must not fail.
    pub async fn remove_worktree_best_effort(&self, repo_path: &Path, worktree_path: &Path) {
        if let Err(e) = self.remove_worktree(repo_path, worktree_path).await {
            tracing::warn!(
                path = %worktree_path.display(),
                "Failed to remove worktree: {}",
                e
            );
        }
    }

    /// Remove worktree directories under each repo's dir that no task
    /// references. Returns how many were removed.
    pub async fn cleanup_orphans(&self, repos: &[Repo], active: &HashSet<PathBuf>) -> usize {
        let mut removed = 0;
        for repo in repos {
            let dir = self.repo_dir(repo);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!("Cannot scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.is_dir() || active.contains(&path) {
                    continue;
                }
                tracing::info!(path = %path.display(), "Removing orphaned worktree");
                self.remove_worktree_best_effort(&repo.path_buf(), &path).await;
                removed += 1;
            }
        }
        removed
    }
}

fn task_dir_name(task: &Task) -> String {
    let slug = git_branch_id(&task.title);
    if slug.is_empty() {
        short_uuid(&task.id)
    } else {
        format!("{}-{}", short_uuid(&task.id), slug)
    }
}
