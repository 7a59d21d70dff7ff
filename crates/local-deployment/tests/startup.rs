use std::{process::Command, sync::Arc};

use db::{
    DBService,
    models::{
        permission_rule::RuleKind,
        project::{CreateProject, Project, ProjectContext},
        repo::{CreateRepo, Repo},
        task::{CreateTask, Task, TaskStatus},
    },
};
use executors::executors::{claude::ClaudeCode, scripted::ScriptedAgent};
use local_deployment::LocalDeployment;
use services::services::config::{Config, PermissionSeed};
use tempfile::TempDir;

fn init_git_repo(dir: &std::path::Path) {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
        vec!["commit", "--allow-empty", "-m", "initial"],
    ] {
        let out = Command::new("git").args(&args).current_dir(dir).output().unwrap();
        assert!(out.status.success(), "git {:?} failed", args);
    }
}

struct Fixture {
    deployment: LocalDeployment,
    ctx: ProjectContext,
    repo: Repo,
    _repo_dir: TempDir,
    _worktrees: TempDir,
}

async fn fixture() -> Fixture {
    let repo_dir = TempDir::new().unwrap();
    init_git_repo(repo_dir.path());
    let worktrees = TempDir::new().unwrap();

    let db = DBService::new_in_memory().await.unwrap();
    let project = Project::create(
        &db.pool,
        &CreateProject {
            name: "local".into(),
            goal: None,
            agent_config: None,
        },
    )
    .await
    .unwrap();
    let repo = Repo::create(
        &db.pool,
        &CreateRepo {
            project_id: project.id,
            name: "app".into(),
            path: repo_dir.path().to_string_lossy().to_string(),
            tech_stack: None,
        },
    )
    .await
    .unwrap();

    let config = Config {
        worktrees_dir: Some(worktrees.path().to_string_lossy().to_string()),
        permissions: PermissionSeed {
            allow: vec!["Read".into(), "Glob".into()],
            deny: vec!["Bash(rm -rf*)".into()],
        },
        ..Config::default()
    };
    let deployment = LocalDeployment::from_parts(config, db, ScriptedAgent::hanging()).unwrap();

    Fixture {
        deployment,
        ctx: ProjectContext::new(project.id),
        repo,
        _repo_dir: repo_dir,
        _worktrees: worktrees,
    }
}

#[tokio::test]
async fn startup_recovers_and_cleans_up() {
    let f = fixture().await;
    let d = &f.deployment;

    // Left in progress by a process that no longer exists.
    let orphan = d
        .tasks()
        .create(&f.ctx, CreateTask::from_title(f.ctx.project_id, "orphan"))
        .await
        .unwrap();
    Task::transition(&d.db().pool, orphan.id, TaskStatus::Todo, TaskStatus::InProgress)
        .await
        .unwrap();
    let stray = d.worktrees().repo_dir(&f.repo).join("stray-checkout");
    std::fs::create_dir_all(&stray).unwrap();

    let report = d.startup().await.unwrap();
    assert_eq!(report.rules_seeded, 3);
    assert_eq!(report.recoverable_tasks.len(), 1);
    assert_eq!(report.recoverable_tasks[0].id, orphan.id);
    assert_eq!(report.recoverable_tasks[0].status, TaskStatus::Interrupted);
    assert_eq!(report.orphaned_worktrees_removed, 1);
    assert!(!stray.exists());
    assert!(report.integrity.has_interrupted_tasks);

    assert_eq!(d.permissions().rules(RuleKind::Deny).await.unwrap(), vec!["Bash(rm -rf*)"]);
    // Seeding again adds nothing.
    assert_eq!(d.startup().await.unwrap().rules_seeded, 0);
}

#[tokio::test]
async fn shutdown_interrupts_running_tasks_and_keeps_worktrees() {
    let f = fixture().await;
    let d = &f.deployment;
    let task = d
        .tasks()
        .create(&f.ctx, CreateTask::from_title(f.ctx.project_id, "long job"))
        .await
        .unwrap();
    let started = d.tasks().start(task.id, None).await.unwrap();
    let worktree = std::path::PathBuf::from(started.worktree_path.unwrap());
    assert!(worktree.starts_with(f._worktrees.path()));

    d.shutdown().await;
    let task = d.tasks().find(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Interrupted);
    assert!(d.tasks().running_tasks().is_empty());
    assert!(worktree.exists());

    // The next start offers it for recovery and leaves its worktree alone.
    let report = d.startup().await.unwrap();
    assert_eq!(report.orphaned_worktrees_removed, 0);
    assert_eq!(report.recoverable_tasks.len(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = Config {
        loop_threshold: 1,
        ..Config::default()
    };
    let db = DBService::new_in_memory().await.unwrap();
    let agent = Arc::new(ClaudeCode::default());
    assert!(LocalDeployment::from_parts(config, db, agent).is_err());
}
