//! End-to-end task lifecycle against a real git repository and a scripted agent.

mod common;

use std::{collections::HashSet, path::PathBuf};

use common::{Engine, init_git_repo};
use db::models::{
    audit_event::{AuditEvent, AuditEventType},
    repo::{CreateRepo, Repo},
    task::{CreateTask, Task, TaskStatus, TaskType, UpdateTask},
};
use executors::{
    events::AgentEvent,
    executors::scripted::{ScriptStep, ScriptedAgent},
};
use futures::future::join_all;
use services::services::{cycles::CycleManager, tasks::TaskError};
use tempfile::TempDir;
use uuid::Uuid;

async fn new_task(engine: &Engine, title: &str) -> Task {
    engine
        .tasks
        .create(&engine.ctx, CreateTask::from_title(engine.project.id, title))
        .await
        .unwrap()
}

async fn status_changes(engine: &Engine, task_id: Uuid) -> Vec<(String, String, String)> {
    let mut events = AuditEvent::find_by_task_id(&engine.db.pool, task_id, 100).await.unwrap();
    events.reverse();
    events
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::TaskStatusChanged)
        .map(|e| {
            let d = e.details_json();
            (
                d["from"].as_str().unwrap_or_default().to_string(),
                d["to"].as_str().unwrap_or_default().to_string(),
                d["reason"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Drive a fresh task into `status` with a hanging agent behind it.
async fn task_in(engine: &Engine, status: TaskStatus) -> Uuid {
    let task = new_task(engine, &format!("task in {status}")).await;
    let id = task.id;
    match status {
        TaskStatus::Todo => {}
        TaskStatus::InProgress => {
            engine.tasks.start(id, None).await.unwrap();
        }
        TaskStatus::Review => {
            engine.tasks.start(id, None).await.unwrap();
            engine.tasks.complete(id).await.unwrap();
        }
        TaskStatus::Done => {
            engine.tasks.start(id, None).await.unwrap();
            engine.tasks.complete(id).await.unwrap();
            engine.tasks.approve(id).await.unwrap();
        }
        TaskStatus::Interrupted => {
            engine.tasks.start(id, None).await.unwrap();
            engine.tasks.stop(id).await.unwrap();
        }
    }
    assert_eq!(engine.tasks.find(id).await.unwrap().status, status);
    id
}

#[tokio::test]
async fn happy_path_reaches_done() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    let task = new_task(&engine, "Add login page").await;
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.repo_id, Some(engine.repo.id));

    let started = engine.tasks.start(task.id, None).await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    let worktree = PathBuf::from(started.worktree_path.clone().unwrap());
    assert!(worktree.join(".git").exists());
    assert!(started.branch_name.as_deref().unwrap().starts_with("taskloom/"));

    // The scripted agent completes on its own.
    let reviewed = engine.wait_for_status(task.id, TaskStatus::Review).await;
    assert!(reviewed.completed_at.is_none());

    let done = engine.tasks.approve(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.completed_at.is_some());

    let changes = status_changes(&engine, task.id).await;
    let edges: Vec<_> = changes.iter().map(|(f, t, _)| (f.as_str(), t.as_str())).collect();
    assert_eq!(
        edges,
        vec![("todo", "in_progress"), ("in_progress", "review"), ("review", "done")]
    );
    assert_eq!(changes[1].2, "agent_completed");

    let requests = engine.agent.spawn_requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].resume);
    assert_eq!(requests[0].working_dir, worktree);
    assert!(requests[0].prompt.contains("Add login page"));
}

#[tokio::test]
async fn every_disallowed_transition_is_rejected() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            if from.can_transition_to(to) {
                continue;
            }
            let id = task_in(&engine, from).await;
            match engine.tasks.transition(id, to).await {
                Err(TaskError::InvalidTransition { from: f, to: t }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("{from} -> {to} should be rejected, got {other:?}"),
            }
            assert_eq!(engine.tasks.find(id).await.unwrap().status, from);
        }
    }
}

#[tokio::test]
async fn every_allowed_transition_succeeds() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            if !from.can_transition_to(to) {
                continue;
            }
            let id = task_in(&engine, from).await;
            let task = engine.tasks.transition(id, to).await.unwrap();
            assert_eq!(task.status, to, "{from} -> {to}");
            assert_eq!(engine.tasks.is_running(id), to == TaskStatus::InProgress);
            let last = status_changes(&engine, id).await.pop().unwrap();
            assert_eq!((last.0, last.1), (from.to_string(), to.to_string()));
        }
    }
}

#[tokio::test]
async fn stop_then_resume_continues_the_same_session() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let task = new_task(&engine, "long refactor").await;
    let started = engine.tasks.start(task.id, None).await.unwrap();
    let session_id = started.session_id.clone().unwrap();
    assert_eq!(engine.tasks.running_session(task.id).as_deref(), Some(session_id.as_str()));
    assert!(engine.monitor.is_monitoring(&session_id));

    let stopped = engine.tasks.stop(task.id).await.unwrap();
    assert_eq!(stopped.status, TaskStatus::Interrupted);
    assert!(!engine.tasks.is_running(task.id));
    assert!(!engine.monitor.is_monitoring(&session_id));
    // The worktree survives the stop.
    let worktree = PathBuf::from(stopped.worktree_path.clone().unwrap());
    assert!(worktree.join(".git").exists());

    let resumed = engine
        .tasks
        .resume(task.id, Some("pick up where you left off".into()))
        .await
        .unwrap();
    assert_eq!(resumed.status, TaskStatus::InProgress);
    assert_eq!(resumed.session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(resumed.worktree_path, stopped.worktree_path);

    let requests = engine.agent.spawn_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].resume);
    assert_eq!(requests[1].session_id, session_id);
    assert_eq!(requests[1].working_dir, worktree);
    assert_eq!(requests[1].prompt, "pick up where you left off");

    assert!(matches!(
        engine.tasks.resume(task.id, None).await,
        Err(TaskError::InvalidTransition { .. }) | Err(TaskError::SessionRunning(_))
    ));
}

#[tokio::test]
async fn resume_recreates_a_vanished_worktree() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let id = task_in(&engine, TaskStatus::Interrupted).await;
    let task = engine.tasks.find(id).await.unwrap();
    let worktree = PathBuf::from(task.worktree_path.unwrap());
    std::fs::remove_dir_all(&worktree).unwrap();

    engine.tasks.resume(id, None).await.unwrap();
    assert!(worktree.join(".git").exists());
}

#[tokio::test]
async fn request_changes_feeds_feedback_to_the_session() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    let task = new_task(&engine, "write docs").await;
    engine.tasks.start(task.id, None).await.unwrap();
    engine.wait_for_status(task.id, TaskStatus::Review).await;

    engine
        .tasks
        .request_changes(task.id, Some("cover the error cases".into()))
        .await
        .unwrap();
    engine.wait_for_status(task.id, TaskStatus::Review).await;

    let requests = engine.agent.spawn_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].resume);
    assert_eq!(requests[1].session_id, requests[0].session_id);
    assert_eq!(requests[1].prompt, "cover the error cases");
}

#[tokio::test]
async fn agent_failures_interrupt_the_task() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    engine.agent.push_script(vec![ScriptStep::Emit(AgentEvent::Completed {
        result: Some("boom".into()),
        is_error: true,
        cost_usd: None,
        num_turns: None,
    })]);
    engine.agent.push_script(vec![ScriptStep::Crash]);
    engine.agent.push_script(vec![ScriptStep::Emit(AgentEvent::Error {
        message: "bad credentials".into(),
    })]);

    for expected_reason in ["agent_error", "process_exited", "agent_failed"] {
        let task = new_task(&engine, expected_reason).await;
        engine.tasks.start(task.id, None).await.unwrap();
        engine.wait_for_status(task.id, TaskStatus::Interrupted).await;
        let (_, to, reason) = status_changes(&engine, task.id).await.pop().unwrap();
        assert_eq!(to, "interrupted");
        assert_eq!(reason, expected_reason);
    }
}

#[tokio::test]
async fn spawn_failure_interrupts_the_task() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    let task = new_task(&engine, "unlucky").await;
    engine.agent.fail_next_spawn();

    assert!(matches!(
        engine.tasks.start(task.id, None).await,
        Err(TaskError::ExternalProcess(_))
    ));
    let task = engine.tasks.find(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Interrupted);
    assert!(!engine.tasks.is_running(task.id));
    let (_, _, reason) = status_changes(&engine, task.id).await.pop().unwrap();
    assert_eq!(reason, "spawn_failed");

    // The retained worktree lets the task be resumed.
    engine.tasks.resume(task.id, None).await.unwrap();
    engine.wait_for_status(task.id, TaskStatus::Review).await;
}

#[tokio::test]
async fn worktree_failure_leaves_the_task_in_todo() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    let not_a_repo = TempDir::new().unwrap();
    let broken = Repo::create(
        &engine.db.pool,
        &CreateRepo {
            project_id: engine.project.id,
            name: "broken".into(),
            path: not_a_repo.path().to_string_lossy().to_string(),
            tech_stack: None,
        },
    )
    .await
    .unwrap();
    let task = engine
        .tasks
        .create(
            &engine.ctx,
            CreateTask {
                repo_id: Some(broken.id),
                ..CreateTask::from_title(engine.project.id, "doomed")
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        engine.tasks.start(task.id, None).await,
        Err(TaskError::Workspace(_))
    ));
    let task = engine.tasks.find(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert!(task.worktree_path.is_none());
    assert!(task.session_id.is_none());
    assert!(!engine.tasks.is_running(task.id));
    assert!(engine.agent.spawn_requests().is_empty());
}

#[tokio::test]
async fn concurrent_starts_get_isolated_workspaces() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(new_task(&engine, "same title").await.id);
    }

    let results = join_all(ids.iter().map(|id| engine.tasks.start(*id, None))).await;
    let started: Vec<Task> = results.into_iter().map(|r| r.unwrap()).collect();

    let paths: HashSet<_> = started.iter().map(|t| t.worktree_path.clone().unwrap()).collect();
    let branches: HashSet<_> = started.iter().map(|t| t.branch_name.clone().unwrap()).collect();
    let sessions: HashSet<_> = started.iter().map(|t| t.session_id.clone().unwrap()).collect();
    assert_eq!(paths.len(), ids.len());
    assert_eq!(branches.len(), ids.len());
    assert_eq!(sessions.len(), ids.len());
    for path in &paths {
        assert!(PathBuf::from(path).join(".git").exists());
    }
    assert_eq!(engine.monitor.monitored_sessions().len(), ids.len());

    // A second start of a running task is refused.
    assert!(engine.tasks.start(ids[0], None).await.is_err());
}

#[tokio::test]
async fn restart_recovery_marks_orphaned_tasks_interrupted() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let orphan = new_task(&engine, "left running").await;
    // Simulate a previous process that died mid-session.
    Task::transition(&engine.db.pool, orphan.id, TaskStatus::Todo, TaskStatus::InProgress)
        .await
        .unwrap()
        .unwrap();
    Task::set_session_id(&engine.db.pool, orphan.id, "old-session").await.unwrap();
    let interrupted = task_in(&engine, TaskStatus::Interrupted).await;
    let live = task_in(&engine, TaskStatus::InProgress).await;
    let _untouched = new_task(&engine, "still todo").await;

    let recoverable = engine.tasks.recover_after_restart().await.unwrap();
    let ids: HashSet<Uuid> = recoverable.iter().map(|t| t.id).collect();
    assert_eq!(ids, HashSet::from([orphan.id, interrupted, live]));

    let orphan = engine.tasks.find(orphan.id).await.unwrap();
    assert_eq!(orphan.status, TaskStatus::Interrupted);
    assert_eq!(orphan.session_id.as_deref(), Some("old-session"));
    let (_, _, reason) = status_changes(&engine, orphan.id).await.pop().unwrap();
    assert_eq!(reason, "restart");
    // A session this process is running is left alone.
    assert_eq!(engine.tasks.find(live).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn deleting_a_task_reclaims_its_worktree() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let id = task_in(&engine, TaskStatus::InProgress).await;
    let path = PathBuf::from(engine.tasks.find(id).await.unwrap().worktree_path.unwrap());
    assert!(path.exists());

    engine.tasks.delete(id).await.unwrap();
    assert!(!path.exists());
    assert!(!engine.tasks.is_running(id));
    assert!(matches!(engine.tasks.find(id).await, Err(TaskError::NotFound("task", _))));
    let events = AuditEvent::find_by_task_id(&engine.db.pool, id, 1).await.unwrap();
    assert_eq!(events[0].event_type, AuditEventType::TaskDeleted);
}

#[tokio::test]
async fn orphaned_worktrees_are_cleaned_up() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let kept = task_in(&engine, TaskStatus::Interrupted).await;
    let stray = engine.worktrees.repo_dir(&engine.repo).join("stray");
    std::fs::create_dir_all(&stray).unwrap();

    let active = engine.tasks.active_worktrees().await.unwrap();
    let removed = engine
        .worktrees
        .cleanup_orphans(std::slice::from_ref(&engine.repo), &active)
        .await;
    assert_eq!(removed, 1);
    assert!(!stray.exists());
    let kept_path = engine.tasks.find(kept).await.unwrap().worktree_path.unwrap();
    assert!(PathBuf::from(kept_path).exists());
}

#[tokio::test]
async fn tasks_can_target_a_second_repository() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let other_dir = TempDir::new().unwrap();
    init_git_repo(other_dir.path());
    let other = Repo::create(
        &engine.db.pool,
        &CreateRepo {
            project_id: engine.project.id,
            name: "other".into(),
            path: other_dir.path().to_string_lossy().to_string(),
            tech_stack: Some("rust".into()),
        },
    )
    .await
    .unwrap();
    let task = engine
        .tasks
        .create(
            &engine.ctx,
            CreateTask {
                repo_id: Some(other.id),
                ..CreateTask::from_title(engine.project.id, "cross repo")
            },
        )
        .await
        .unwrap();
    let started = engine.tasks.start(task.id, None).await.unwrap();
    assert!(
        PathBuf::from(started.worktree_path.unwrap()).starts_with(engine.worktrees.repo_dir(&other))
    );
}

#[tokio::test]
async fn tasks_can_be_listed_and_edited() {
    let engine = Engine::new(ScriptedAgent::hanging()).await;
    let cycle = CycleManager::new(engine.db.clone(), engine.audit.clone(), 3)
        .start(engine.project.id, "polish")
        .await
        .unwrap();
    let loose = new_task(&engine, "loose").await;
    let in_cycle = engine
        .tasks
        .create(
            &engine.ctx.with_cycle(cycle.id),
            CreateTask::from_title(engine.project.id, "in cycle"),
        )
        .await
        .unwrap();
    engine.tasks.start(in_cycle.id, None).await.unwrap();

    assert_eq!(engine.tasks.list_for_project(engine.project.id).await.unwrap().len(), 2);
    let cycle_tasks = engine.tasks.list_for_cycle(cycle.id).await.unwrap();
    assert_eq!(cycle_tasks.len(), 1);
    assert_eq!(cycle_tasks[0].id, in_cycle.id);
    let running = engine.tasks.list_by_status(&[TaskStatus::InProgress]).await.unwrap();
    assert_eq!(running.iter().map(|t| t.id).collect::<Vec<_>>(), vec![in_cycle.id]);

    let updated = engine
        .tasks
        .update(
            loose.id,
            &UpdateTask {
                title: Some("renamed".into()),
                description: Some("with detail".into()),
                task_type: Some(TaskType::Research),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "renamed");
    assert_eq!(updated.task_type, TaskType::Research);
    assert!(matches!(
        engine
            .tasks
            .update(
                loose.id,
                &UpdateTask {
                    title: Some("  ".into()),
                    description: None,
                    task_type: None,
                },
            )
            .await,
        Err(TaskError::Validation(_))
    ));
    assert!(matches!(
        engine.tasks.create(&engine.ctx, CreateTask::from_title(engine.project.id, "")).await,
        Err(TaskError::Validation(_))
    ));
}
