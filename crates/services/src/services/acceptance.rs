use std::{path::Path, process::Stdio, time::Duration};

use db::{
    DBService,
    models::acceptance_criterion::{
        AcceptanceCriterion, CreateAcceptanceCriterion, CriterionStatus, VerifierKind,
    },
    models::task::Task,
};
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(300);
/// Stored output is cut to its tail; failures usually print last.
const MAX_STORED_OUTPUT: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum AcceptanceError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("task {0} has no worktree to verify in")]
    NoWorktree(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Verdict {
    passed: bool,
    output: String,
}

impl Verdict {
    fn new(passed: bool, output: impl Into<String>) -> Self {
        Self {
            passed,
            output: output.into(),
        }
    }
}

/// Runs a task's acceptance criteria inside its worktree and stores the result.
#[derive(Clone)]
pub struct AcceptanceVerifier {
    db: DBService,
    timeout: Duration,
}

impl AcceptanceVerifier {
    pub fn new(db: DBService) -> Self {
        Self {
            db,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn add(
        &self,
        data: &CreateAcceptanceCriterion,
    ) -> Result<AcceptanceCriterion, AcceptanceError> {
        if data.description.trim().is_empty() {
            return Err(AcceptanceError::Validation("description must not be empty".into()));
        }
        validate_verifier(&data.verifier)?;
        Task::find_by_id(&self.db.pool, data.task_id)
            .await?
            .ok_or(AcceptanceError::NotFound("task", data.task_id))?;
        Ok(AcceptanceCriterion::create(&self.db.pool, data).await?)
    }

    pub async fn find(&self, id: Uuid) -> Result<AcceptanceCriterion, AcceptanceError> {
        AcceptanceCriterion::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(AcceptanceError::NotFound("criterion", id))
    }

    pub async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<AcceptanceCriterion>, AcceptanceError> {
        Ok(AcceptanceCriterion::find_by_task_id(&self.db.pool, task_id).await?)
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), AcceptanceError> {
        if AcceptanceCriterion::delete(&self.db.pool, id).await? == 0 {
            return Err(AcceptanceError::NotFound("criterion", id));
        }
        Ok(())
    }

    /// Tick or untick a manual checklist item.
    pub async fn mark_checklist(&self, id: Uuid, done: bool) -> Result<AcceptanceCriterion, AcceptanceError> {
        let criterion = self.find(id).await?;
        if !criterion.verifier.is_manual() {
            return Err(AcceptanceError::Validation(format!(
                "criterion {id} is checked automatically"
            )));
        }
        let status = if done { CriterionStatus::Pass } else { CriterionStatus::Pending };
        AcceptanceCriterion::set_result(&self.db.pool, id, status, None)
            .await?
            .ok_or(AcceptanceError::NotFound("criterion", id))
    }

    /// Evaluate one criterion against `worktree`. Checklist items are left as
    /// they are.
    #[tracing::instrument(skip(self, criterion, worktree), fields(criterion_id = %criterion.id))]
    pub async fn run(
        &self,
        criterion: &AcceptanceCriterion,
        worktree: &Path,
    ) -> Result<AcceptanceCriterion, AcceptanceError> {
        if criterion.verifier.is_manual() {
            return Ok(criterion.clone());
        }
        let verdict = self.evaluate(&criterion.verifier, worktree).await;
        let status = if verdict.passed {
            CriterionStatus::Pass
        } else {
            CriterionStatus::Fail
        };
        tracing::debug!(status = %status, "Acceptance criterion evaluated");
        AcceptanceCriterion::set_result(
            &self.db.pool,
            criterion.id,
            status,
            Some(tail(&verdict.output, MAX_STORED_OUTPUT)),
        )
        .await?
        .ok_or(AcceptanceError::NotFound("criterion", criterion.id))
    }

    /// Re-run every automatic criterion of the task in its worktree, in order.
    pub async fn run_all_for_task(&self, task_id: Uuid) -> Result<Vec<AcceptanceCriterion>, AcceptanceError> {
        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(AcceptanceError::NotFound("task", task_id))?;
        let worktree = task
            .worktree_path
            .as_deref()
            .map(Path::new)
            .filter(|p| p.is_dir())
            .ok_or(AcceptanceError::NoWorktree(task_id))?;

        let criteria = self.list_for_task(task_id).await?;
        let mut results = Vec::with_capacity(criteria.len());
        for criterion in &criteria {
            results.push(self.run(criterion, worktree).await?);
        }
        Ok(results)
    }

    async fn evaluate(&self, verifier: &VerifierKind, worktree: &Path) -> Verdict {
        match verifier {
            VerifierKind::CommandExitCode { command, expected } => {
                match self.run_command(command, worktree).await {
                    Ok((code, output)) => Verdict::new(code == Some(*expected), output),
                    Err(message) => Verdict::new(false, message),
                }
            }
            VerifierKind::TestSuitePass { command } => match self.run_command(command, worktree).await {
                Ok((code, output)) => Verdict::new(code == Some(0), output),
                Err(message) => Verdict::new(false, message),
            },
            VerifierKind::OutputMatch { command, pattern } => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => return Verdict::new(false, format!("invalid pattern: {e}")),
                };
                match self.run_command(command, worktree).await {
                    Ok((_, output)) => Verdict::new(re.is_match(&output), output),
                    Err(message) => Verdict::new(false, message),
                }
            }
            VerifierKind::FileExists { path } => {
                let target = worktree.join(path);
                let exists = tokio::fs::try_exists(&target).await.unwrap_or(false);
                Verdict::new(exists, target.display().to_string())
            }
            VerifierKind::PatternGrep { path, pattern } => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => return Verdict::new(false, format!("invalid pattern: {e}")),
                };
                match tokio::fs::read_to_string(worktree.join(path)).await {
                    Ok(content) => match content.lines().find(|line| re.is_match(line)) {
                        Some(line) => Verdict::new(true, line),
                        None => Verdict::new(false, format!("no line in {path} matches {pattern}")),
                    },
                    Err(e) => Verdict::new(false, format!("cannot read {path}: {e}")),
                }
            }
            VerifierKind::Checklist { .. } => Verdict::new(false, String::new()),
        }
    }

    /// Run `command` through the shell in `cwd`. Returns the exit code (None
    /// when killed by a signal) and combined output, or an error message on
    /// spawn failure or timeout.
    async fn run_command(&self, command: &str, cwd: &Path) -> Result<(Option<i32>, String), String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn `{command}`: {e}"))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("`{command}` failed: {e}")),
            Err(_) => {
                tracing::warn!(command, timeout = ?self.timeout, "Verifier command timed out");
                return Err(format!("`{command}` timed out after {:?}", self.timeout));
            }
        };
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok((output.status.code(), combined))
    }
}

fn validate_verifier(verifier: &VerifierKind) -> Result<(), AcceptanceError> {
    let blank = |s: &str| s.trim().is_empty();
    let invalid = match verifier {
        VerifierKind::CommandExitCode { command, .. } | VerifierKind::TestSuitePass { command } => {
            blank(command)
        }
        VerifierKind::OutputMatch { command, pattern } => {
            if let Err(e) = Regex::new(pattern) {
                return Err(AcceptanceError::Validation(format!("invalid pattern: {e}")));
            }
            blank(command)
        }
        VerifierKind::PatternGrep { path, pattern } => {
            if let Err(e) = Regex::new(pattern) {
                return Err(AcceptanceError::Validation(format!("invalid pattern: {e}")));
            }
            blank(path)
        }
        VerifierKind::FileExists { path } => blank(path),
        VerifierKind::Checklist { item } => blank(item),
    };
    if invalid {
        return Err(AcceptanceError::Validation("verifier fields must not be empty".into()));
    }
    Ok(())
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use db::models::{
        project::{CreateProject, Project},
        task::CreateTask,
    };
    use tempfile::TempDir;

    use super::*;

    async fn setup() -> (AcceptanceVerifier, Uuid, TempDir) {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "acceptance".into(),
                goal: None,
                agent_config: None,
            },
        )
        .await
        .unwrap();
        let task = Task::create(&db.pool, &CreateTask::from_title(project.id, "verify"), Uuid::new_v4())
            .await
            .unwrap();
        let dir = TempDir::new().unwrap();
        Task::set_workspace(&db.pool, task.id, "b", &dir.path().to_string_lossy())
            .await
            .unwrap();
        (AcceptanceVerifier::new(db), task.id, dir)
    }

    fn criterion(task_id: Uuid, verifier: VerifierKind) -> CreateAcceptanceCriterion {
        CreateAcceptanceCriterion {
            task_id,
            description: "check".into(),
            verifier,
        }
    }

    #[tokio::test]
    async fn automatic_verifiers_pass_and_fail() {
        let (verifier, task_id, dir) = setup().await;
        std::fs::write(dir.path().join("README.md"), "# title\nstatus: green\n").unwrap();

        let cases = [
            (VerifierKind::CommandExitCode { command: "exit 3".into(), expected: 3 }, CriterionStatus::Pass),
            (VerifierKind::TestSuitePass { command: "false".into() }, CriterionStatus::Fail),
            (
                VerifierKind::OutputMatch { command: "echo build ok".into(), pattern: r"build\s+ok".into() },
                CriterionStatus::Pass,
            ),
            (VerifierKind::FileExists { path: "README.md".into() }, CriterionStatus::Pass),
            (VerifierKind::FileExists { path: "missing.txt".into() }, CriterionStatus::Fail),
            (
                VerifierKind::PatternGrep { path: "README.md".into(), pattern: "^status: (green|yellow)$".into() },
                CriterionStatus::Pass,
            ),
        ];
        for (kind, _) in &cases {
            verifier.add(&criterion(task_id, kind.clone())).await.unwrap();
        }

        let results = verifier.run_all_for_task(task_id).await.unwrap();
        let statuses: Vec<_> = results.iter().map(|c| c.status).collect();
        let expected: Vec<_> = cases.iter().map(|(_, s)| *s).collect();
        assert_eq!(statuses, expected);
        assert!(results[2].last_output.as_deref().unwrap().contains("build ok"));
    }

    #[tokio::test]
    async fn slow_commands_time_out_as_failures() {
        let (verifier, task_id, dir) = setup().await;
        let verifier = verifier.with_timeout(Duration::from_millis(100));
        let c = verifier
            .add(&criterion(task_id, VerifierKind::TestSuitePass { command: "sleep 5".into() }))
            .await
            .unwrap();
        let result = verifier.run(&c, dir.path()).await.unwrap();
        assert_eq!(result.status, CriterionStatus::Fail);
        assert!(result.last_output.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn checklist_items_are_manual() {
        let (verifier, task_id, dir) = setup().await;
        let item = verifier
            .add(&criterion(task_id, VerifierKind::Checklist { item: "docs updated".into() }))
            .await
            .unwrap();
        assert_eq!(verifier.run(&item, dir.path()).await.unwrap().status, CriterionStatus::Pending);
        assert_eq!(verifier.mark_checklist(item.id, true).await.unwrap().status, CriterionStatus::Pass);

        let auto = verifier
            .add(&criterion(task_id, VerifierKind::FileExists { path: "x".into() }))
            .await
            .unwrap();
        assert!(matches!(
            verifier.mark_checklist(auto.id, true).await,
            Err(AcceptanceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn invalid_verifiers_are_rejected() {
        let (verifier, task_id, _dir) = setup().await;
        assert!(matches!(
            verifier
                .add(&criterion(task_id, VerifierKind::OutputMatch { command: "ls".into(), pattern: "(".into() }))
                .await,
            Err(AcceptanceError::Validation(_))
        ));
        assert!(matches!(
            verifier
                .add(&criterion(Uuid::new_v4(), VerifierKind::FileExists { path: "x".into() }))
                .await,
            Err(AcceptanceError::NotFound("task", _))
        ));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 4), "llo");
        assert_eq!(tail("short", 10), "short");
    }
}
