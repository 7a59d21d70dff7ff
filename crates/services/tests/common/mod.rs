//! Shared fixtures: an in-memory database, a throwaway git repository and a
//! fully wired engine driven by a scripted agent.
#![allow(dead_code)]

use std::{path::Path, process::Command, sync::Arc, time::Duration};

use db::{
    DBService,
    models::{
        project::{CreateProject, Project, ProjectContext},
        repo::{CreateRepo, Repo},
        task::{Task, TaskStatus},
    },
};
use executors::executors::scripted::ScriptedAgent;
use services::services::{
    audit::AuditLog,
    git::GitService,
    permissions::PermissionGate,
    recovery::{MonitorSettings, RecoveryMonitor},
    tasks::TaskRegistry,
    worktree_manager::WorktreeManager,
};
use tempfile::TempDir;
use uuid::Uuid;

pub fn init_git_repo(dir: &Path) {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
        vec!["commit", "--allow-empty", "-m", "initial"],
    ] {
        let out = Command::new("git")
            .args(&args)
            .current_dir(dir)
            .output()
            .expect("git must be installed");
        assert!(out.status.success(), "git {:?} failed: {:?}", args, out);
    }
}

pub struct Engine {
    pub db: DBService,
    pub audit: AuditLog,
    pub gate: PermissionGate,
    pub monitor: RecoveryMonitor,
    pub worktrees: WorktreeManager,
    pub tasks: TaskRegistry,
    pub agent: Arc<ScriptedAgent>,
    pub project: Project,
    pub repo: Repo,
    pub ctx: ProjectContext,
    // Dropped last: owns the repository and worktree directories.
    pub repo_dir: TempDir,
    pub worktree_dir: TempDir,
}

impl Engine {
    pub async fn new(agent: Arc<ScriptedAgent>) -> Self {
        Self::with_settings(agent, MonitorSettings::default(), 3600).await
    }

    pub async fn with_settings(
        agent: Arc<ScriptedAgent>,
        settings: MonitorSettings,
        permission_timeout_secs: i64,
    ) -> Self {
        let db = DBService::new_in_memory().await.unwrap();
        let repo_dir = TempDir::new().unwrap();
        init_git_repo(repo_dir.path());
        let worktree_dir = TempDir::new().unwrap();

        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "engine".into(),
                goal: Some("exercise the engine".into()),
                agent_config: None,
            },
        )
        .await
        .unwrap();
        let repo = Repo::create(
            &db.pool,
            &CreateRepo {
                project_id: project.id,
                name: "main-repo".into(),
                path: repo_dir.path().to_string_lossy().to_string(),
                tech_stack: None,
            },
        )
        .await
        .unwrap();

        let audit = AuditLog::new(db.clone());
        let gate = PermissionGate::new(db.clone(), audit.clone(), permission_timeout_secs);
        let monitor = RecoveryMonitor::new(audit.clone(), settings);
        let worktrees = WorktreeManager::new(
            GitService::new(),
            worktree_dir.path().join("worktrees"),
            "taskloom",
        );
        let tasks = TaskRegistry::new(
            db.clone(),
            audit.clone(),
            worktrees.clone(),
            gate.clone(),
            monitor.clone(),
            agent.clone(),
        );
        let ctx = ProjectContext::new(project.id);

        Self {
            db,
            audit,
            gate,
            monitor,
            worktrees,
            tasks,
            agent,
            project,
            repo,
            ctx,
            repo_dir,
            worktree_dir,
        }
    }

    /// Poll until the task reaches `status` or two seconds pass.
    pub async fn wait_for_status(&self, task_id: Uuid, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let task = self.tasks.find(task_id).await.unwrap();
            if task.status == status && !self.tasks.is_running(task_id) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("task {task_id} stuck in {} (wanted {status})", task.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
