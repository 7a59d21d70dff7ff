use std::path::Path;

use git2::{Error as GitError, Repository};
use thiserror::Error;

mod cli;

pub use cli::{GitCli, GitCliError, WorktreeEntry};

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    GitCLI(#[from] GitCliError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid repository: {0}")]
    InvalidRepository(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("Branch already exists: {0}")]
    BranchExists(String),
}

/// Version-control capability used by the worktree manager: create and
/// remove isolated checkouts, plus branch naming and current-branch queries.
#[derive(Clone, Default)]
pub struct GitService {}

impl GitService {
    pub fn new() -> Self {
        Self {}
    }

    pub fn is_branch_name_valid(&self, name: &str) -> bool {
        git2::Branch::name_is_valid(name).unwrap_or(false)
    }

    /// Fails unless `repo_path` is a non-bare repository with at least one commit.
    pub fn ensure_repository(&self, repo_path: &Path) -> Result<(), GitServiceError> {
        let repo = Repository::open(repo_path)
            .map_err(|e| GitServiceError::InvalidRepository(format!("{}: {e}", repo_path.display())))?;
        if repo.is_bare() {
            return Err(GitServiceError::InvalidRepository(format!(
                "{} is a bare repository",
                repo_path.display()
            )));
        }
        repo.head().map_err(|e| {
            GitServiceError::InvalidRepository(format!("{} has no HEAD: {e}", repo_path.display()))
        })?;
        Ok(())
    }

    pub fn get_current_branch(&self, repo_path: &Path) -> Result<String, GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let head = repo.head()?;
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            Ok("HEAD".to_string())
        }
    }

    pub fn check_branch_exists(
        &self,
        repo_path: &Path,
        branch_name: &str,
    ) -> Result<bool, GitServiceError> {
        Ok(GitCli::new().branch_exists(repo_path, branch_name)?)
    }

    /// Add a worktree for a branch, optionally creating the branch
    pub fn add_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        create_branch: bool,
    ) -> Result<(), GitServiceError> {
        let git = GitCli::new();
        git.worktree_add(repo_path, worktree_path, branch, create_branch)
            .map_err(|e| match e {
                GitCliError::InvalidReference(_) => {
                    GitServiceError::BranchNotFound(branch.to_string())
                }
                GitCliError::AlreadyExists(_) if create_branch => {
                    GitServiceError::BranchExists(branch.to_string())
                }
                _ => GitServiceError::InvalidRepository(e.to_string()),
            })?;
        Ok(())
    }

    /// Remove a worktree
    pub fn remove_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitServiceError> {
        let git = GitCli::new();
        git.worktree_remove(repo_path, worktree_path, force)
            .map_err(|e| GitServiceError::InvalidRepository(e.to_string()))?;
        Ok(())
    }

    pub fn prune_worktrees(&self, repo_path: &Path) -> Result<(), GitServiceError> {
        let git = GitCli::new();
        git.worktree_prune(repo_path)
            .map_err(|e| GitServiceError::InvalidRepository(e.to_string()))?;
        Ok(())
    }

    pub fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<WorktreeEntry>, GitServiceError> {
        Ok(GitCli::new().list_worktrees(repo_path)?)
    }

    /// Changed paths in a checkout, as `git status --porcelain` lines.
    pub fn changed_paths(&self, worktree_path: &Path) -> Result<Vec<String>, GitServiceError> {
        Ok(GitCli::new().status_porcelain(worktree_path)?)
    }

    pub fn head_sha(&self, repo_path: &Path) -> Result<String, GitServiceError> {
        Ok(GitCli::new().head_sha(repo_path)?)
    }
}
