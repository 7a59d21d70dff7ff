//! Worktree and branch mutations go through the `git` CLI: it refuses to
//! clobber uncommitted work and keeps `.git/worktrees` metadata consistent the
//! same way an operator's own `git` would. libgit2 is kept for read-only
//! queries in the parent module.
use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;
use utils::shell::resolve_executable_path_blocking;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("branch or reference not found: {0}")]
    InvalidReference(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

#[derive(Clone, Default)]
pub struct GitCli;

/// Parsed worktree entry from `git worktree list --porcelain`
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    /// True if this is the main repository (not a linked worktree)
    pub is_main: bool,
}

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// Run `git -C <repo> worktree add <path> <branch>`, creating the branch
    /// from the current HEAD with `-b` when `create_branch` is set.
    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        create_branch: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "add".into()];
        if create_branch {
            args.push("-b".into());
            args.push(OsString::from(branch));
            args.push(worktree_path.as_os_str().into());
        } else {
            args.push(worktree_path.as_os_str().into());
            args.push(OsString::from(branch));
        }
        self.git(repo_path, args)?;
        Ok(())
    }

    /// Run `git -C <repo> worktree remove <path>`
    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    /// Prune stale worktree metadata
    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    /// List all worktrees of the repository; the first non-bare entry is the
    /// main checkout. Detached worktrees have `branch: None`.
    pub fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<WorktreeEntry>, GitCliError> {
        let out = self.git(repo_path, ["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    pub fn branch_exists(&self, repo_path: &Path, branch: &str) -> Result<bool, GitCliError> {
        let reference = format!("refs/heads/{branch}");
        match self.git(repo_path, ["rev-parse", "--verify", "--quiet", reference.as_str()]) {
            Ok(_) => Ok(true),
            Err(GitCliError::CommandFailed(_)) | Err(GitCliError::InvalidReference(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Short porcelain status, one line per changed path.
    pub fn status_porcelain(&self, worktree_path: &Path) -> Result<Vec<String>, GitCliError> {
        let out = self.git(worktree_path, ["status", "--porcelain"])?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn head_sha(&self, repo_path: &Path) -> Result<String, GitCliError> {
        Ok(self.git(repo_path, ["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.git_impl(repo_path, args)?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }
}

// Private methods
impl GitCli {
    fn git_impl<I, S>(&self, repo_path: &Path, args: I) -> Result<Vec<u8>, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let git = resolve_executable_path_blocking("git").ok_or(GitCliError::NotAvailable)?;
        let mut cmd = Command::new(&git);
        cmd.arg("-C").arg(repo_path);
        for a in args {
            cmd.arg(a);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::trace!(repo = ?repo_path, "Running git command: {:?}", cmd);

        let out = cmd
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (true, true) => "Command failed with no output".to_string(),
                (false, false) => format!("--- stderr\n{stderr}\n--- stdout\n{stdout}"),
                (true, false) => stderr,
                (false, true) => stdout,
            };
            return Err(classify_cli_error(combined));
        }
        Ok(out.stdout)
    }
}

fn classify_cli_error(msg: String) -> GitCliError {
    if msg.contains("invalid reference:")
        || msg.contains("not a valid ref")
        || msg.contains("unknown revision")
    {
        GitCliError::InvalidReference(msg)
    } else if msg.contains("already exists") || msg.contains("is already checked out") {
        GitCliError::AlreadyExists(msg)
    } else {
        GitCliError::CommandFailed(msg)
    }
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut is_bare = false;

    let mut flush = |path: Option<PathBuf>, branch: Option<String>, bare: bool| {
        if let Some(path) = path
            && !bare
        {
            let is_main = entries.is_empty();
            entries.push(WorktreeEntry {
                path,
                branch,
                is_main,
            });
        }
    };

    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(current_path.take(), current_branch.take(), is_bare);
            is_bare = false;
        } else if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(path));
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            current_branch = branch_ref.strip_prefix("refs/heads/").map(str::to_string);
        } else if line == "bare" {
            is_bare = true;
        }
    }
    flush(current_path, current_branch, is_bare);
    entries
}
