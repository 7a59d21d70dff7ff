//! Tool calls from a running session pass through the permission gate.

mod common;

use std::time::Duration;

use common::{Engine, eventually};
use db::models::{
    audit_event::{AuditEvent, AuditEventType},
    permission_rule::RuleKind,
    task::{CreateTask, TaskStatus},
};
use executors::executors::scripted::{ScriptStep, ScriptedAgent};
use serde_json::json;
use services::services::{
    config::PermissionSeed,
    permissions::{PermissionError, PermissionEvent},
};
use utils::approvals::{PermissionDecision, PermissionStatus};

fn bash(command: &str) -> ScriptStep {
    ScriptStep::tool("Bash", json!({ "command": command }))
}

async fn start(engine: &Engine, title: &str) -> uuid::Uuid {
    let task = engine
        .tasks
        .create(&engine.ctx, CreateTask::from_title(engine.project.id, title))
        .await
        .unwrap();
    engine.tasks.start(task.id, None).await.unwrap();
    task.id
}

#[tokio::test]
async fn unmatched_call_blocks_until_the_operator_answers() {
    let agent = ScriptedAgent::new(vec![bash("cargo test"), ScriptStep::complete("ok")]);
    let engine = Engine::new(agent).await;
    let mut events = engine.gate.subscribe();
    let task_id = start(&engine, "needs approval").await;

    let request = match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Ok(PermissionEvent::Requested { request })) => request,
        other => panic!("expected a permission request, got {other:?}"),
    };
    assert_eq!(request.task_id, task_id);
    assert_eq!(request.signature.to_string(), "Bash(cargo test)");
    // The session is parked on the request.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.tasks.find(task_id).await.unwrap().status, TaskStatus::InProgress);
    assert_eq!(engine.gate.pending_for_session(&request.session_id).len(), 1);

    let status = engine
        .gate
        .respond(&request.id, PermissionDecision::AllowOnce)
        .await
        .unwrap();
    assert_eq!(status, PermissionStatus::Approved);
    engine.wait_for_status(task_id, TaskStatus::Review).await;

    assert!(matches!(
        engine.gate.respond(&request.id, PermissionDecision::AllowOnce).await,
        Err(PermissionError::AlreadyCompleted(_))
    ));
    // AllowOnce leaves no rule behind.
    assert!(engine.gate.rules(RuleKind::Allow).await.unwrap().is_empty());
}

#[tokio::test]
async fn always_deny_is_remembered_for_later_sessions() {
    let agent = ScriptedAgent::new(vec![bash("rm -rf target"), ScriptStep::complete("ok")]);
    let engine = Engine::new(agent).await;
    let mut events = engine.gate.subscribe();

    let first = start(&engine, "first").await;
    let Ok(PermissionEvent::Requested { request }) = events.recv().await else {
        panic!("expected a request");
    };
    engine
        .gate
        .respond(
            &request.id,
            PermissionDecision::AlwaysDeny {
                reason: Some("destructive".into()),
            },
        )
        .await
        .unwrap();
    engine.wait_for_status(first, TaskStatus::Review).await;
    assert_eq!(
        engine.gate.rules(RuleKind::Deny).await.unwrap(),
        vec!["Bash(rm -rf target)".to_string()]
    );

    // The same call from another task is denied without asking.
    let second = start(&engine, "second").await;
    engine.wait_for_status(second, TaskStatus::Review).await;
    assert!(engine.gate.pending().is_empty());

    let decisions: Vec<_> = AuditEvent::find_by_task_id(&engine.db.pool, second, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::PermissionDecision)
        .collect();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].details_json()["status"]["status"], "denied");
}

#[tokio::test]
async fn deny_rules_win_over_allow_rules() {
    let agent = ScriptedAgent::new(vec![bash("git push --force"), ScriptStep::complete("ok")]);
    let engine = Engine::new(agent).await;
    engine.gate.add_rule(RuleKind::Allow, "Bash").await.unwrap();
    engine.gate.add_rule(RuleKind::Deny, "Bash(git push*)").await.unwrap();

    let task_id = start(&engine, "push").await;
    engine.wait_for_status(task_id, TaskStatus::Review).await;

    let decision = AuditEvent::find_by_task_id(&engine.db.pool, task_id, 50)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == AuditEventType::PermissionDecision)
        .unwrap();
    assert_eq!(decision.details_json()["status"]["status"], "denied");
}

#[tokio::test]
async fn stopping_a_task_denies_its_pending_request() {
    let agent = ScriptedAgent::new(vec![bash("make deploy"), ScriptStep::Hang]);
    let engine = Engine::new(agent).await;
    let mut events = engine.gate.subscribe();
    let task_id = start(&engine, "stop me").await;
    let Ok(PermissionEvent::Requested { request }) = events.recv().await else {
        panic!("expected a request");
    };

    engine.tasks.stop(task_id).await.unwrap();
    assert!(engine.gate.pending().is_empty());
    assert!(matches!(
        engine.gate.status(&request.id),
        Some(PermissionStatus::Denied { .. })
    ));
    assert!(matches!(
        engine.gate.respond(&request.id, PermissionDecision::AllowOnce).await,
        Err(PermissionError::AlreadyCompleted(_))
    ));
}

#[tokio::test]
async fn unanswered_requests_time_out() {
    let agent = ScriptedAgent::new(vec![bash("sleep 1000"), ScriptStep::complete("ok")]);
    let engine = Engine::with_settings(agent, Default::default(), 0).await;
    let task_id = start(&engine, "impatient").await;
    engine.wait_for_status(task_id, TaskStatus::Review).await;

    let timed_out = AuditEvent::find_by_task_id(&engine.db.pool, task_id, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::PermissionDecision)
        .any(|e| e.details_json()["status"]["status"] == "timed_out");
    assert!(timed_out);
}

#[tokio::test]
async fn seeded_and_added_rules_are_idempotent() {
    let engine = Engine::new(ScriptedAgent::completing()).await;
    let seed = PermissionSeed {
        allow: vec!["Read".into(), "Bash(cargo *)".into(), "Bash(".into()],
        deny: vec!["Bash(rm -rf /*)".into()],
    };
    assert_eq!(engine.gate.seed_rules(&seed).await.unwrap(), 3);
    assert_eq!(engine.gate.seed_rules(&seed).await.unwrap(), 0);
    assert!(!engine.gate.add_rule(RuleKind::Allow, "Read").await.unwrap());
    assert_eq!(engine.gate.rules(RuleKind::Allow).await.unwrap().len(), 2);

    assert!(engine.gate.remove_rule(RuleKind::Allow, "Read").await.unwrap());
    assert!(!engine.gate.remove_rule(RuleKind::Allow, "Read").await.unwrap());
    assert!(matches!(
        engine.gate.add_rule(RuleKind::Deny, "").await,
        Err(PermissionError::Validation(_))
    ));
}

#[tokio::test]
async fn sessions_queue_independently() {
    let agent = ScriptedAgent::new(vec![bash("npm test"), ScriptStep::complete("ok")]);
    let engine = Engine::new(agent).await;
    let a = start(&engine, "a").await;
    let b = start(&engine, "b").await;

    eventually(|| engine.gate.pending().len() == 2).await;
    let pending = engine.gate.pending();
    assert_ne!(pending[0].session_id, pending[1].session_id);

    // Answering b first does not depend on a.
    let b_request = pending.iter().find(|r| r.task_id == b).unwrap();
    engine
        .gate
        .respond(&b_request.id, PermissionDecision::AllowOnce)
        .await
        .unwrap();
    engine.wait_for_status(b, TaskStatus::Review).await;
    assert_eq!(engine.tasks.find(a).await.unwrap().status, TaskStatus::InProgress);
}
