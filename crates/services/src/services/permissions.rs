pub mod pattern;
pub mod session_bridge;

use std::{collections::VecDeque, sync::Arc, time::Duration as StdDuration};

use dashmap::DashMap;
use db::{
    DBService,
    models::{
        audit_event::AuditEventType,
        permission_rule::{PermissionRule, RuleKind},
    },
};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, oneshot};
use utils::{
    approvals::{
        CreatePermissionRequest, DecisionSource, PermissionDecision, PermissionRequest,
        PermissionStatus,
    },
    tool_signature::ActionSignature,
};
use uuid::Uuid;

pub use pattern::RulePattern;
pub use session_bridge::SessionApprovalBridge;

use crate::services::{audit::AuditLog, config::PermissionSeed};

type PermissionWaiter = Shared<BoxFuture<'static, PermissionStatus>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Decided requests remembered for `status` and duplicate-response checks.
const COMPLETED_CAPACITY: usize = 1024;

/// The session and task a tool call originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionScope {
    pub session_id: String,
    pub task_id: Uuid,
    pub project_id: Uuid,
}

#[derive(Debug)]
struct PendingPermission {
    request: PermissionRequest,
    project_id: Uuid,
    response_tx: oneshot::Sender<PermissionStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionEvent {
    Requested { request: PermissionRequest },
    Resolved { request_id: String, session_id: String, status: PermissionStatus },
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("permission request not found: {0}")]
    NotFound(String),
    #[error("permission request already completed: {0}")]
    AlreadyCompleted(String),
    #[error("invalid rule pattern: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Final statuses of decided requests, oldest evicted first once full.
#[derive(Debug)]
struct CompletedLog {
    statuses: DashMap<String, PermissionStatus>,
    order: parking_lot::Mutex<VecDeque<String>>,
    capacity: usize,
}

impl CompletedLog {
    fn new(capacity: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            order: parking_lot::Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn insert(&self, id: String, status: PermissionStatus) {
        let mut order = self.order.lock();
        if self.statuses.insert(id.clone(), status).is_none() {
            order.push_back(id);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.statuses.contains_key(id)
    }

    fn get(&self, id: &str) -> Option<PermissionStatus> {
        self.statuses.get(id).map(|s| s.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.statuses.len()
    }
}

/// Decides every tool call before it runs: deny rules, then allow rules,
/// then a human decision that the calling session blocks on.
#[derive(Clone)]
pub struct PermissionGate {
    db: DBService,
    audit: AuditLog,
    pending: Arc<DashMap<String, PendingPermission>>,
    completed: Arc<CompletedLog>,
    session_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<PermissionEvent>,
    timeout_seconds: i64,
}

impl PermissionGate {
    pub fn new(db: DBService, audit: AuditLog, timeout_seconds: i64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            audit,
            pending: Arc::new(DashMap::new()),
            completed: Arc::new(CompletedLog::new(COMPLETED_CAPACITY)),
            session_locks: Arc::new(DashMap::new()),
            events,
            timeout_seconds,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve one tool call. Returns only once a final status exists; calls
    /// from the same session are decided strictly one at a time.
    #[tracing::instrument(skip(self, create), fields(session_id = %scope.session_id, task_id = %scope.task_id, tool = %create.tool_name))]
    pub async fn evaluate(
        &self,
        scope: &SessionScope,
        create: CreatePermissionRequest,
    ) -> Result<PermissionStatus, PermissionError> {
        let lock = self.session_lock(&scope.session_id);
        let _guard = lock.lock().await;

        let request = PermissionRequest::from_create(
            create,
            &scope.session_id,
            scope.task_id,
            self.timeout_seconds,
        );

        if let Some(pattern) = self.first_match(RuleKind::Deny, &request.signature).await? {
            let status = PermissionStatus::Denied {
                reason: Some(format!("blocked by deny rule '{pattern}'")),
            };
            self.record_decision(scope.project_id, &request, &status, DecisionSource::DenyRule { pattern })
                .await?;
            return Ok(status);
        }

        if let Some(pattern) = self.first_match(RuleKind::Allow, &request.signature).await? {
            let status = PermissionStatus::Approved;
            self.record_decision(scope.project_id, &request, &status, DecisionSource::AllowRule { pattern })
                .await?;
            return Ok(status);
        }

        let waiter = self.create_with_waiter(scope.project_id, request);
        Ok(waiter.await)
    }

    fn create_with_waiter(&self, project_id: Uuid, request: PermissionRequest) -> PermissionWaiter {
        let (tx, rx) = oneshot::channel();
        let waiter: PermissionWaiter = rx
            .map(|result| result.unwrap_or(PermissionStatus::TimedOut))
            .boxed()
            .shared();
        let req_id = request.id.clone();
        let timeout_at = request.timeout_at;

        tracing::info!(
            request_id = %req_id,
            signature = %request.signature,
            "Tool call awaiting operator decision"
        );
        self.pending.insert(
            req_id.clone(),
            PendingPermission {
                request: request.clone(),
                project_id,
                response_tx: tx,
            },
        );
        let _ = self.events.send(PermissionEvent::Requested { request });

        self.spawn_timeout_watcher(req_id, timeout_at, waiter.clone());
        waiter
    }

    /// Apply an operator decision to a pending request. `Always*` decisions
    /// persist a rule for the request's signature before the session resumes.
    #[tracing::instrument(skip(self, decision))]
    pub async fn respond(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<PermissionStatus, PermissionError> {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            if self.completed.contains(request_id) {
                return Err(PermissionError::AlreadyCompleted(request_id.to_string()));
            }
            return Err(PermissionError::NotFound(request_id.to_string()));
        };

        let status = PermissionStatus::from(&decision);
        let rule_kind = match decision {
            PermissionDecision::AlwaysAllow => Some(RuleKind::Allow),
            PermissionDecision::AlwaysDeny { .. } => Some(RuleKind::Deny),
            _ => None,
        };

        // Always* rules cover this exact call only; globs in the command stay literal.
        let rule = match rule_kind {
            Some(kind) => match RulePattern::exact(&pending.request.signature) {
                Ok(pattern) => Some((kind, pattern)),
                Err(e) => {
                    self.pending.insert(request_id.to_string(), pending);
                    return Err(PermissionError::Validation(e));
                }
            },
            None => None,
        };

        let persisted = async {
            let mut tx = self.db.pool.begin().await?;
            if let Some((kind, pattern)) = &rule {
                PermissionRule::add(&mut *tx, *kind, pattern.as_str()).await?;
            }
            AuditLog::record_with(
                &mut *tx,
                Some(pending.project_id),
                Some(pending.request.task_id),
                AuditEventType::PermissionDecision,
                decision_details(
                    &pending.request,
                    &status,
                    &DecisionSource::Operator {
                        decision: decision.clone(),
                    },
                ),
            )
            .await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = persisted {
            // Put the request back so the operator can retry.
            self.pending.insert(request_id.to_string(), pending);
            return Err(e.into());
        }

        self.completed.insert(request_id.to_string(), status.clone());
        let session_id = pending.request.session_id.clone();
        if pending.response_tx.send(status.clone()).is_err() {
            tracing::debug!("permission '{}' waiter dropped before decision", request_id);
        }
        let _ = self.events.send(PermissionEvent::Resolved {
            request_id: request_id.to_string(),
            session_id,
            status: status.clone(),
        });
        Ok(status)
    }

    fn spawn_timeout_watcher(
        &self,
        id: String,
        timeout_at: chrono::DateTime<chrono::Utc>,
        waiter: PermissionWaiter,
    ) {
        let pending = self.pending.clone();
        let completed = self.completed.clone();
        let audit = self.audit.clone();
        let events = self.events.clone();

        let to_wait = (timeout_at - chrono::Utc::now())
            .to_std()
            .unwrap_or_else(|_| StdDuration::from_secs(0));
        let deadline = tokio::time::Instant::now() + to_wait;

        tokio::spawn(async move {
            let status = tokio::select! {
                biased;

                resolved = waiter.clone() => resolved,
                _ = tokio::time::sleep_until(deadline) => PermissionStatus::TimedOut,
            };

            if !matches!(status, PermissionStatus::TimedOut) {
                return;
            }
            let Some((_, expired)) = pending.remove(&id) else {
                return;
            };
            completed.insert(id.clone(), status.clone());
            tracing::warn!(
                request_id = %id,
                session_id = %expired.request.session_id,
                "Permission request timed out, denying tool call"
            );
            audit
                .record_best_effort(
                    Some(expired.project_id),
                    Some(expired.request.task_id),
                    AuditEventType::PermissionDecision,
                    decision_details(&expired.request, &status, &DecisionSource::Timeout),
                )
                .await;
            let session_id = expired.request.session_id.clone();
            if expired.response_tx.send(status.clone()).is_err() {
                tracing::debug!("permission '{}' timeout receiver dropped", id);
            }
            let _ = events.send(PermissionEvent::Resolved {
                request_id: id,
                session_id,
                status,
            });
        });
    }

    /// Deny everything still pending for a session, e.g. when it is stopped.
    pub fn cancel_session(&self, session_id: &str) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.request.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, p)) = self.pending.remove(&id) {
                let status = PermissionStatus::Denied {
                    reason: Some("session stopped".to_string()),
                };
                self.completed.insert(id.clone(), status.clone());
                let _ = p.response_tx.send(status.clone());
                let _ = self.events.send(PermissionEvent::Resolved {
                    request_id: id,
                    session_id: session_id.to_string(),
                    status,
                });
            }
        }
        self.session_locks.remove(session_id);
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self.pending.iter().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub fn pending_for_session(&self, session_id: &str) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self
            .pending
            .iter()
            .filter(|p| p.request.session_id == session_id)
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub fn status(&self, request_id: &str) -> Option<PermissionStatus> {
        if self.pending.contains_key(request_id) {
            return Some(PermissionStatus::Pending);
        }
        self.completed.get(request_id)
    }

    async fn first_match(
        &self,
        kind: RuleKind,
        signature: &ActionSignature,
    ) -> Result<Option<String>, sqlx::Error> {
        let rules = PermissionRule::find_by_kind(&self.db.pool, kind).await?;
        for rule in rules {
            match RulePattern::parse(&rule.pattern) {
                Ok(pattern) if pattern.matches(signature) => return Ok(Some(rule.pattern)),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring stored {} rule: {}", kind, e),
            }
        }
        Ok(None)
    }

    async fn record_decision(
        &self,
        project_id: Uuid,
        request: &PermissionRequest,
        status: &PermissionStatus,
        source: DecisionSource,
    ) -> Result<(), sqlx::Error> {
        tracing::debug!(signature = %request.signature, ?status, "Permission decided by rule");
        self.audit
            .record(
                Some(project_id),
                Some(request.task_id),
                AuditEventType::PermissionDecision,
                decision_details(request, status, &source),
            )
            .await?;
        Ok(())
    }

    pub async fn add_rule(&self, kind: RuleKind, pattern: &str) -> Result<bool, PermissionError> {
        let pattern = RulePattern::parse(pattern).map_err(PermissionError::Validation)?;
        Ok(PermissionRule::add(&self.db.pool, kind, pattern.as_str()).await?)
    }

    pub async fn remove_rule(&self, kind: RuleKind, pattern: &str) -> Result<bool, PermissionError> {
        Ok(PermissionRule::remove(&self.db.pool, kind, pattern).await?)
    }

    pub async fn rules(&self, kind: RuleKind) -> Result<Vec<String>, PermissionError> {
        Ok(PermissionRule::find_by_kind(&self.db.pool, kind)
            .await?
            .into_iter()
            .map(|r| r.pattern)
            .collect())
    }

    /// Idempotent; invalid seed patterns are skipped with a warning.
    pub async fn seed_rules(&self, seed: &PermissionSeed) -> Result<usize, PermissionError> {
        let mut added = 0;
        for (kind, patterns) in [(RuleKind::Allow, &seed.allow), (RuleKind::Deny, &seed.deny)] {
            for pattern in patterns {
                match self.add_rule(kind, pattern).await {
                    Ok(true) => added += 1,
                    Ok(false) => {}
                    Err(PermissionError::Validation(e)) => {
                        tracing::warn!("Skipping seed {} rule: {}", kind, e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(added)
    }
}

fn decision_details(
    request: &PermissionRequest,
    status: &PermissionStatus,
    source: &DecisionSource,
) -> serde_json::Value {
    json!({
        "request_id": request.id,
        "session_id": request.session_id,
        "tool_name": request.tool_name,
        "tool_call_id": request.tool_call_id,
        "signature": request.signature.to_string(),
        "status": status,
        "source": source,
    })
}

#[cfg(test)]
mod tests {
    use db::models::{
        audit_event::AuditEvent,
        project::{CreateProject, Project},
    };

    use super::*;

    async fn setup(timeout_seconds: i64) -> (PermissionGate, SessionScope) {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "gate".into(),
                goal: None,
                agent_config: None,
            },
        )
        .await
        .unwrap();
        let gate = PermissionGate::new(db.clone(), AuditLog::new(db), timeout_seconds);
        let scope = SessionScope {
            session_id: "session-a".into(),
            task_id: Uuid::new_v4(),
            project_id: project.id,
        };
        (gate, scope)
    }

    fn bash(command: &str) -> CreatePermissionRequest {
        CreatePermissionRequest {
            tool_name: "Bash".into(),
            tool_input: json!({ "command": command }),
            tool_call_id: Uuid::new_v4().to_string(),
        }
    }

    async fn wait_for_pending(gate: &PermissionGate, session_id: &str) -> PermissionRequest {
        for _ in 0..200 {
            if let Some(r) = gate.pending_for_session(session_id).into_iter().next() {
                return r;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("no pending request for {session_id}");
    }

    #[tokio::test]
    async fn deny_rules_win_over_allow_rules() {
        let (gate, scope) = setup(60).await;
        gate.add_rule(RuleKind::Allow, "Bash").await.unwrap();
        gate.add_rule(RuleKind::Deny, "Bash(rm *)").await.unwrap();

        let status = gate.evaluate(&scope, bash("rm -rf /")).await.unwrap();
        assert!(matches!(status, PermissionStatus::Denied { .. }));
        let status = gate.evaluate(&scope, bash("ls")).await.unwrap();
        assert_eq!(status, PermissionStatus::Approved);

        let logged = AuditEvent::find_by_task_id(&gate.db.pool, scope.task_id, 10)
            .await
            .unwrap();
        assert_eq!(logged.len(), 2);
        assert!(logged
            .iter()
            .all(|e| e.event_type == AuditEventType::PermissionDecision));
    }

    #[tokio::test]
    async fn unmatched_call_blocks_until_operator_decides() {
        let (gate, scope) = setup(60).await;
        let g = gate.clone();
        let s = scope.clone();
        let call = tokio::spawn(async move { g.evaluate(&s, bash("cargo publish")).await });

        let request = wait_for_pending(&gate, &scope.session_id).await;
        assert!(!call.is_finished());
        assert_eq!(gate.status(&request.id), Some(PermissionStatus::Pending));

        gate.respond(&request.id, PermissionDecision::AllowOnce)
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), PermissionStatus::Approved);

        assert!(matches!(
            gate.respond(&request.id, PermissionDecision::AllowOnce).await,
            Err(PermissionError::AlreadyCompleted(_))
        ));
        assert!(matches!(
            gate.respond("missing", PermissionDecision::AllowOnce).await,
            Err(PermissionError::NotFound(_))
        ));
        // Allow-once does not persist a rule.
        assert!(gate.rules(RuleKind::Allow).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn always_deny_persists_a_rule_for_the_signature() {
        let (gate, scope) = setup(60).await;
        let g = gate.clone();
        let s = scope.clone();
        let call = tokio::spawn(async move { g.evaluate(&s, bash("git push --force")).await });
        let request = wait_for_pending(&gate, &scope.session_id).await;
        gate.respond(
            &request.id,
            PermissionDecision::AlwaysDeny {
                reason: Some("never".into()),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            call.await.unwrap().unwrap(),
            PermissionStatus::Denied { .. }
        ));
        assert_eq!(
            gate.rules(RuleKind::Deny).await.unwrap(),
            vec!["Bash(git push --force)".to_string()]
        );

        // The next identical call is decided without a human.
        let status = gate.evaluate(&scope, bash("git push --force")).await.unwrap();
        assert!(matches!(status, PermissionStatus::Denied { .. }));
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn sessions_have_independent_queues() {
        let (gate, scope_a) = setup(60).await;
        let scope_b = SessionScope {
            session_id: "session-b".into(),
            task_id: Uuid::new_v4(),
            project_id: scope_a.project_id,
        };
        let (ga, sa) = (gate.clone(), scope_a.clone());
        let a = tokio::spawn(async move { ga.evaluate(&sa, bash("make a")).await });
        let (gb, sb) = (gate.clone(), scope_b.clone());
        let b = tokio::spawn(async move { gb.evaluate(&sb, bash("make b")).await });

        let req_a = wait_for_pending(&gate, "session-a").await;
        let req_b = wait_for_pending(&gate, "session-b").await;
        assert_eq!(req_a.task_id, scope_a.task_id);
        assert_eq!(req_b.task_id, scope_b.task_id);

        gate.respond(&req_b.id, PermissionDecision::DenyOnce { reason: None })
            .await
            .unwrap();
        assert!(matches!(b.await.unwrap().unwrap(), PermissionStatus::Denied { .. }));
        assert!(!a.is_finished());
        gate.respond(&req_a.id, PermissionDecision::AllowOnce)
            .await
            .unwrap();
        assert!(a.await.unwrap().unwrap().is_approved());
    }

    #[tokio::test]
    async fn always_allow_on_a_glob_command_does_not_widen() {
        let (gate, scope) = setup(60).await;
        let g = gate.clone();
        let s = scope.clone();
        let call = tokio::spawn(async move { g.evaluate(&s, bash("rm -f *.log")).await });
        let request = wait_for_pending(&gate, &scope.session_id).await;
        gate.respond(&request.id, PermissionDecision::AlwaysAllow)
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), PermissionStatus::Approved);
        assert_eq!(
            gate.rules(RuleKind::Allow).await.unwrap(),
            vec![r"Bash(rm -f \*.log)".to_string()]
        );

        // Same call is approved by the stored rule.
        let status = gate.evaluate(&scope, bash("rm -f *.log")).await.unwrap();
        assert_eq!(status, PermissionStatus::Approved);

        // A different command the literal star would have covered still asks.
        let g = gate.clone();
        let s = scope.clone();
        let other =
            tokio::spawn(async move { g.evaluate(&s, bash("rm -f ~/.ssh/id_rsa x.log")).await });
        let held = wait_for_pending(&gate, &scope.session_id).await;
        assert_eq!(held.signature.argument, "rm -f ~/.ssh/id_rsa x.log");
        assert!(!other.is_finished());
        gate.respond(&held.id, PermissionDecision::DenyOnce { reason: None })
            .await
            .unwrap();
        assert!(matches!(
            other.await.unwrap().unwrap(),
            PermissionStatus::Denied { .. }
        ));
    }

    #[test]
    fn completed_log_evicts_oldest_first() {
        let log = CompletedLog::new(2);
        log.insert("a".into(), PermissionStatus::Approved);
        log.insert("b".into(), PermissionStatus::TimedOut);
        log.insert("a".into(), PermissionStatus::Approved);
        assert_eq!(log.len(), 2);
        log.insert("c".into(), PermissionStatus::Approved);
        assert_eq!(log.len(), 2);
        assert!(!log.contains("a"));
        assert_eq!(log.get("b"), Some(PermissionStatus::TimedOut));
        assert!(log.contains("c"));
    }

    #[tokio::test]
    async fn undecided_requests_time_out() {
        let (gate, scope) = setup(0).await;
        let status = gate.evaluate(&scope, bash("sleep 1")).await.unwrap();
        assert_eq!(status, PermissionStatus::TimedOut);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_skips_bad_patterns() {
        let (gate, _) = setup(60).await;
        let seed = PermissionSeed {
            allow: vec!["Read".into(), "Glob".into(), "Bash(npm".into()],
            deny: vec!["Bash(rm -rf *)".into()],
        };
        assert_eq!(gate.seed_rules(&seed).await.unwrap(), 3);
        assert_eq!(gate.seed_rules(&seed).await.unwrap(), 0);
        assert_eq!(gate.rules(RuleKind::Allow).await.unwrap().len(), 2);
        assert!(!gate.remove_rule(RuleKind::Allow, "Write").await.unwrap());
    }
}
