use std::{collections::HashSet, path::PathBuf, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use db::{
    DBService,
    models::{
        audit_event::AuditEventType,
        cycle::Cycle,
        project::ProjectContext,
        repo::Repo,
        task::{CreateTask, Task, TaskStatus, UpdateTask},
    },
};
use executors::{
    events::AgentEvent,
    executors::{CodingAgent, ExecutorError, SpawnRequest, SpawnedAgent},
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use utils::tool_signature::ActionSignature;
use uuid::Uuid;

use crate::services::{
    audit::AuditLog,
    permissions::{PermissionGate, SessionApprovalBridge, SessionScope},
    recovery::RecoveryMonitor,
    worktree_manager::{Worktree, WorktreeError, WorktreeManager},
};

/// Tool name the agent uses to launch a subagent.
const SUBAGENT_TOOL: &str = "Task";
const DEFAULT_RESUME_PROMPT: &str = "Continue working on the task from where you left off.";
const DEFAULT_CHANGES_PROMPT: &str = "The reviewer requested changes. Revisit your work and address them.";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),
    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("task {0} already has a running session")]
    SessionRunning(Uuid),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Workspace(#[from] WorktreeError),
    #[error(transparent)]
    ExternalProcess(#[from] ExecutorError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

struct RunningSession {
    session_id: String,
    generation: Uuid,
    stop: CancellationToken,
}

/// How a session is (re)entered.
enum Launch {
    Start,
    Resume,
    RequestChanges,
}

impl Launch {
    fn from_status(&self) -> TaskStatus {
        match self {
            Launch::Start => TaskStatus::Todo,
            Launch::Resume => TaskStatus::Interrupted,
            Launch::RequestChanges => TaskStatus::Review,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Launch::Start => "start",
            Launch::Resume => "resume",
            Launch::RequestChanges => "changes_requested",
        }
    }
}

/// Owns task records, enforces the status machine and supervises at most
/// one agent session per task.
#[derive(Clone)]
pub struct TaskRegistry {
    db: DBService,
    audit: AuditLog,
    worktrees: WorktreeManager,
    gate: PermissionGate,
    monitor: RecoveryMonitor,
    agent: Arc<dyn CodingAgent>,
    running: Arc<DashMap<Uuid, RunningSession>>,
}

impl TaskRegistry {
    pub fn new(
        db: DBService,
        audit: AuditLog,
        worktrees: WorktreeManager,
        gate: PermissionGate,
        monitor: RecoveryMonitor,
        agent: Arc<dyn CodingAgent>,
    ) -> Self {
        Self {
            db,
            audit,
            worktrees,
            gate,
            monitor,
            agent,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.running.iter().map(|r| *r.key()).collect()
    }

    pub fn running_session(&self, task_id: Uuid) -> Option<String> {
        self.running.get(&task_id).map(|r| r.session_id.clone())
    }

    /// Create a task in `todo`. The cycle defaults to the context's cycle and
    /// the repo to the project's first registered repo.
    pub async fn create(&self, ctx: &ProjectContext, mut data: CreateTask) -> Result<Task, TaskError> {
        if data.title.trim().is_empty() {
            return Err(TaskError::Validation("task title must not be empty".into()));
        }
        data.project_id = ctx.project_id;
        if data.cycle_id.is_none() {
            data.cycle_id = ctx.cycle_id;
        }
        if let Some(cycle_id) = data.cycle_id {
            let cycle = Cycle::find_by_id(&self.db.pool, cycle_id)
                .await?
                .filter(|c| c.project_id == ctx.project_id)
                .ok_or(TaskError::NotFound("cycle", cycle_id))?;
            data.cycle_id = Some(cycle.id);
        }
        if data.repo_id.is_none() {
            data.repo_id = Repo::find_by_project_id(&self.db.pool, ctx.project_id)
                .await?
                .first()
                .map(|r| r.id);
        }

        let mut tx = self.db.pool.begin().await?;
        let task = Task::create(&mut *tx, &data, Uuid::new_v4()).await?;
        AuditLog::record_with(
            &mut *tx,
            Some(task.project_id),
            Some(task.id),
            AuditEventType::TaskCreated,
            json!({ "title": task.title, "cycle_id": task.cycle_id, "task_type": task.task_type }),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(task_id = %task.id, "Task created");
        Ok(task)
    }

    pub async fn find(&self, task_id: Uuid) -> Result<Task, TaskError> {
        Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskError::NotFound("task", task_id))
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Task>, TaskError> {
        Ok(Task::find_by_project_id(&self.db.pool, project_id).await?)
    }

    pub async fn list_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<Task>, TaskError> {
        Ok(Task::find_by_cycle_id(&self.db.pool, cycle_id).await?)
    }

    pub async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, TaskError> {
        Ok(Task::find_by_statuses(&self.db.pool, statuses).await?)
    }

    pub async fn update(&self, task_id: Uuid, data: &UpdateTask) -> Result<Task, TaskError> {
        if data.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(TaskError::Validation("task title must not be empty".into()));
        }
        Task::update(&self.db.pool, task_id, data)
            .await?
            .ok_or(TaskError::NotFound("task", task_id))
    }

    /// Stop any running session, reclaim the worktree and delete the record.
    pub async fn delete(&self, task_id: Uuid) -> Result<(), TaskError> {
        let task = self.find(task_id).await?;
        self.end_session(task_id);
        if let Some(session_id) = task.session_id.as_deref() {
            self.monitor.clear_alerts_for_session(session_id);
        }

        if let Some(path) = task.worktree_path.as_deref() {
            match self.repo_for(&task).await {
                Ok(repo) => {
                    self.worktrees
                        .remove_worktree_best_effort(&repo.path_buf(), &PathBuf::from(path))
                        .await
                }
                Err(e) => tracing::warn!(task_id = %task_id, "Cannot reclaim worktree: {}", e),
            }
        }

        let mut tx = self.db.pool.begin().await?;
        Task::delete(&mut *tx, task_id).await?;
        AuditLog::record_with(
            &mut *tx,
            Some(task.project_id),
            Some(task_id),
            AuditEventType::TaskDeleted,
            json!({ "title": task.title, "status": task.status }),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Drive a task to `to`, dispatching to the operation that owns that edge.
    pub async fn transition(&self, task_id: Uuid, to: TaskStatus) -> Result<Task, TaskError> {
        let task = self.find(task_id).await?;
        if !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition { from: task.status, to });
        }
        match (task.status, to) {
            (TaskStatus::Todo, _) => self.start(task_id, None).await,
            (TaskStatus::Interrupted, _) => self.resume(task_id, None).await,
            (TaskStatus::Review, TaskStatus::InProgress) => self.request_changes(task_id, None).await,
            (TaskStatus::Review, _) => self.approve(task_id).await,
            (TaskStatus::InProgress, TaskStatus::Review) => self.complete(task_id).await,
            _ => self.stop(task_id).await,
        }
    }

    /// `todo → in_progress`: create the worktree, then launch a new session.
    /// Worktree failure leaves the task in `todo`.
    pub async fn start(&self, task_id: Uuid, prompt: Option<String>) -> Result<Task, TaskError> {
        let task = self.find(task_id).await?;
        let prompt = prompt.unwrap_or_else(|| initial_prompt(&task));
        self.launch(task, Launch::Start, prompt).await
    }

    /// `interrupted → in_progress`, continuing the prior session in the
    /// retained worktree.
    pub async fn resume(&self, task_id: Uuid, prompt: Option<String>) -> Result<Task, TaskError> {
        let task = self.find(task_id).await?;
        let prompt = prompt.unwrap_or_else(|| DEFAULT_RESUME_PROMPT.to_string());
        self.launch(task, Launch::Resume, prompt).await
    }

    /// `review → in_progress`, feeding the reviewer's feedback to the same
    /// session.
    pub async fn request_changes(
        &self,
        task_id: Uuid,
        feedback: Option<String>,
    ) -> Result<Task, TaskError> {
        let task = self.find(task_id).await?;
        let prompt = feedback
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CHANGES_PROMPT.to_string());
        self.launch(task, Launch::RequestChanges, prompt).await
    }

    /// `in_progress → review` by operator request, ending any live session.
    pub async fn complete(&self, task_id: Uuid) -> Result<Task, TaskError> {
        let task = self
            .apply_transition(
                task_id,
                TaskStatus::InProgress,
                TaskStatus::Review,
                json!({ "reason": "completed" }),
            )
            .await?;
        self.end_session(task_id);
        Ok(task)
    }

    /// `in_progress → interrupted`: terminate the agent, keep the worktree.
    pub async fn stop(&self, task_id: Uuid) -> Result<Task, TaskError> {
        let task = self
            .apply_transition(
                task_id,
                TaskStatus::InProgress,
                TaskStatus::Interrupted,
                json!({ "reason": "stopped" }),
            )
            .await?;
        self.end_session(task_id);
        tracing::info!(task_id = %task_id, "Task stopped");
        Ok(task)
    }

    /// `review → done`.
    pub async fn approve(&self, task_id: Uuid) -> Result<Task, TaskError> {
        self.apply_transition(
            task_id,
            TaskStatus::Review,
            TaskStatus::Done,
            json!({ "reason": "approved" }),
        )
        .await
    }

    /// After a restart no session is live: every `in_progress` task becomes
    /// `interrupted`. Returns all tasks that can be resumed.
    pub async fn recover_after_restart(&self) -> Result<Vec<Task>, TaskError> {
        let stale = Task::find_by_statuses(&self.db.pool, &[TaskStatus::InProgress]).await?;
        for task in stale {
            if self.is_running(task.id) {
                continue;
            }
            let recovered = self
                .transition_logged(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Interrupted,
                    json!({ "reason": "restart", "session_id": task.session_id }),
                )
                .await?;
            if recovered.is_some() {
                tracing::warn!(task_id = %task.id, "Task left in progress by previous run, marked interrupted");
            }
        }
        Ok(Task::find_by_statuses(
            &self.db.pool,
            &[TaskStatus::InProgress, TaskStatus::Interrupted],
        )
        .await?)
    }

    /// Worktree paths of tasks that may still need them.
    pub async fn active_worktrees(&self) -> Result<HashSet<PathBuf>, TaskError> {
        Ok(Task::active_worktree_paths(&self.db.pool)
            .await?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    async fn repo_for(&self, task: &Task) -> Result<Repo, TaskError> {
        match task.repo_id {
            Some(repo_id) => Repo::find_by_id(&self.db.pool, repo_id)
                .await?
                .ok_or(TaskError::NotFound("repo", repo_id)),
            None => Repo::find_by_project_id(&self.db.pool, task.project_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    TaskError::Validation(format!("project {} has no repository", task.project_id))
                }),
        }
    }

    async fn apply_transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        details: Value,
    ) -> Result<Task, TaskError> {
        let current = self.find(task_id).await?;
        if current.status != from || !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        match self.transition_logged(task_id, from, to, details).await? {
            Some(task) => Ok(task),
            // Lost a race with another transition.
            None => {
                let latest = self.find(task_id).await?;
                Err(TaskError::InvalidTransition {
                    from: latest.status,
                    to,
                })
            }
        }
    }

    /// Compare-and-set transition plus its audit entry, in one transaction.
    async fn transition_logged(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        details: Value,
    ) -> Result<Option<Task>, sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        let Some(task) = Task::transition(&mut *tx, task_id, from, to).await? else {
            return Ok(None);
        };
        AuditLog::record_with(
            &mut *tx,
            Some(task.project_id),
            Some(task_id),
            AuditEventType::TaskStatusChanged,
            status_details(from, to, details),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(task_id = %task_id, %from, %to, "Task status changed");
        Ok(Some(task))
    }

    #[tracing::instrument(skip(self, task, launch, prompt), fields(task_id = %task.id, reason = launch.reason()))]
    async fn launch(&self, task: Task, launch: Launch, prompt: String) -> Result<Task, TaskError> {
        let from = launch.from_status();
        if task.status != from {
            return Err(TaskError::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }

        let session_id = match launch {
            Launch::Start => Uuid::new_v4().to_string(),
            Launch::Resume | Launch::RequestChanges => task.session_id.clone().ok_or_else(|| {
                TaskError::Validation(format!("task {} has no session to continue", task.id))
            })?,
        };

        let generation = Uuid::new_v4();
        let stop = CancellationToken::new();
        match self.running.entry(task.id) {
            Entry::Occupied(_) => return Err(TaskError::SessionRunning(task.id)),
            Entry::Vacant(slot) => {
                slot.insert(RunningSession {
                    session_id: session_id.clone(),
                    generation,
                    stop: stop.clone(),
                });
            }
        }

        let prepared = self.prepare(&task, &launch, &session_id).await;
        let (task, worktree) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(task.id, generation);
                return Err(e);
            }
        };

        let scope = SessionScope {
            session_id: session_id.clone(),
            task_id: task.id,
            project_id: task.project_id,
        };
        let request = SpawnRequest {
            working_dir: worktree.path.clone(),
            prompt,
            session_id: session_id.clone(),
            resume: !matches!(launch, Launch::Start),
        };
        let bridge = SessionApprovalBridge::new(self.gate.clone(), scope.clone());

        match self.agent.spawn(request, bridge).await {
            Ok(spawned) => {
                self.monitor.start(&session_id, task.id, task.project_id);
                let registry = self.clone();
                tokio::spawn(async move {
                    registry.supervise(scope, generation, stop, spawned).await;
                });
                Ok(task)
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "Agent failed to spawn: {}", e);
                self.release(task.id, generation);
                self.transition_logged(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Interrupted,
                    json!({ "reason": "spawn_failed", "error": e.to_string() }),
                )
                .await?;
                Err(e.into())
            }
        }
    }

    /// Provision the worktree and move the task to `in_progress`, binding the
    /// session and workspace in the same transaction as the transition.
    async fn prepare(
        &self,
        task: &Task,
        launch: &Launch,
        session_id: &str,
    ) -> Result<(Task, Worktree), TaskError> {
        let repo = self.repo_for(task).await?;
        let fresh = matches!(launch, Launch::Start);
        let worktree = if fresh {
            self.worktrees.create_worktree(&repo, task).await?
        } else {
            self.worktrees.ensure_worktree(&repo, task).await?
        };
        let path = worktree.path.to_string_lossy().to_string();

        let result = async {
            let mut tx = self.db.pool.begin().await?;
            Task::set_workspace(&mut *tx, task.id, &worktree.branch, &path).await?;
            Task::set_session_id(&mut *tx, task.id, session_id).await?;
            let Some(updated) =
                Task::transition(&mut *tx, task.id, task.status, TaskStatus::InProgress).await?
            else {
                return Ok(None);
            };
            AuditLog::record_with(
                &mut *tx,
                Some(task.project_id),
                Some(task.id),
                AuditEventType::TaskStatusChanged,
                status_details(
                    task.status,
                    TaskStatus::InProgress,
                    json!({
                        "reason": launch.reason(),
                        "session_id": session_id,
                        "branch": worktree.branch,
                        "worktree_path": path,
                    }),
                ),
            )
            .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(Some(updated))
        }
        .await;

        let outcome = match result {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Err(TaskError::InvalidTransition {
                from: self.find(task.id).await?.status,
                to: TaskStatus::InProgress,
            }),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(updated) => {
                tracing::info!(task_id = %task.id, session_id, branch = %worktree.branch, "Task started");
                Ok((updated, worktree))
            }
            Err(e) => {
                if fresh {
                    self.worktrees
                        .remove_worktree_best_effort(&repo.path_buf(), &worktree.path)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Drop the session slot, but only if it still belongs to `generation`.
    fn release(&self, task_id: Uuid, generation: Uuid) {
        if let Some((_, session)) = self
            .running
            .remove_if(&task_id, |_, s| s.generation == generation)
        {
            self.monitor.stop(&session.session_id);
        }
    }

    /// Cancel and forget whatever session the task has.
    fn end_session(&self, task_id: Uuid) {
        if let Some((_, session)) = self.running.remove(&task_id) {
            session.stop.cancel();
            self.monitor.stop(&session.session_id);
            self.gate.cancel_session(&session.session_id);
        }
    }

    /// Pump agent events into the monitor and audit log until the session
    /// completes, fails, or is stopped.
    async fn supervise(
        self,
        scope: SessionScope,
        generation: Uuid,
        stop: CancellationToken,
        mut spawned: SpawnedAgent,
    ) {
        let task_id = scope.task_id;
        let session_id = scope.session_id.as_str();
        let mut subagents: HashSet<String> = HashSet::new();

        let (to, details) = loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    spawned.cancel.cancel();
                    return;
                }
                event = spawned.events.recv() => event,
            };

            let Some(event) = event else {
                break (TaskStatus::Interrupted, json!({ "reason": "process_exited" }));
            };
            match event {
                AgentEvent::SessionStarted { .. } => {
                    tracing::debug!(task_id = %task_id, session_id, "Agent session started");
                }
                AgentEvent::ToolUse {
                    call_id,
                    tool_name,
                    input,
                } => {
                    if tool_name == SUBAGENT_TOOL {
                        subagents.insert(call_id.clone());
                        self.audit
                            .record_best_effort(
                                Some(scope.project_id),
                                Some(task_id),
                                AuditEventType::SubagentSpawned,
                                json!({
                                    "session_id": session_id,
                                    "call_id": call_id,
                                    "description": input.get("description"),
                                    "subagent_type": input.get("subagent_type"),
                                }),
                            )
                            .await;
                    }
                    let signature = ActionSignature::from_tool_call(&tool_name, &input);
                    self.monitor.record_action(session_id, signature).await;
                }
                AgentEvent::ToolResult {
                    call_id, is_error, ..
                } => {
                    self.monitor.touch(session_id);
                    if subagents.remove(&call_id) {
                        self.audit
                            .record_best_effort(
                                Some(scope.project_id),
                                Some(task_id),
                                AuditEventType::SubagentCompleted,
                                json!({ "session_id": session_id, "call_id": call_id, "is_error": is_error }),
                            )
                            .await;
                    }
                }
                AgentEvent::Thinking { .. } | AgentEvent::AssistantText { .. } => {
                    self.monitor.touch(session_id);
                }
                AgentEvent::Compaction { .. } => {
                    self.monitor.record_compaction(session_id).await;
                }
                AgentEvent::Completed {
                    result,
                    is_error,
                    cost_usd,
                    num_turns,
                } => {
                    let summary = json!({
                        "session_id": session_id,
                        "result": result,
                        "cost_usd": cost_usd,
                        "num_turns": num_turns,
                    });
                    break if is_error {
                        (TaskStatus::Interrupted, json!({ "reason": "agent_error", "completion": summary }))
                    } else {
                        (TaskStatus::Review, json!({ "reason": "agent_completed", "completion": summary }))
                    };
                }
                AgentEvent::Error { message } => {
                    tracing::error!(task_id = %task_id, session_id, "Agent session failed: {}", message);
                    break (
                        TaskStatus::Interrupted,
                        json!({ "reason": "agent_failed", "error": message }),
                    );
                }
            }
        };

        // A stop that raced the final event already owns the transition.
        if stop.is_cancelled() {
            return;
        }
        self.release(task_id, generation);
        self.gate.cancel_session(session_id);
        match self
            .transition_logged(task_id, TaskStatus::InProgress, to, details)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => tracing::debug!(task_id = %task_id, %to, "Task already left in_progress"),
            Err(e) => tracing::error!(task_id = %task_id, "Failed to record session outcome: {}", e),
        }
    }
}

fn initial_prompt(task: &Task) -> String {
    match task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => format!("{}\n\n{}", task.title, description),
        None => task.title.clone(),
    }
}

fn status_details(from: TaskStatus, to: TaskStatus, extra: Value) -> Value {
    let mut details = json!({ "from": from, "to": to });
    if let (Value::Object(map), Value::Object(extra)) = (&mut details, extra) {
        map.extend(extra);
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_details_merge_extra_fields() {
        let details = status_details(
            TaskStatus::InProgress,
            TaskStatus::Interrupted,
            json!({ "reason": "stopped" }),
        );
        assert_eq!(
            details,
            json!({ "from": "in_progress", "to": "interrupted", "reason": "stopped" })
        );
    }

    #[test]
    fn prompt_includes_description_when_present() {
        let mut task = Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            cycle_id: None,
            repo_id: None,
            title: "Add login".into(),
            description: None,
            task_type: Default::default(),
            status: TaskStatus::Todo,
            session_id: None,
            branch_name: None,
            worktree_path: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        };
        assert_eq!(initial_prompt(&task), "Add login");
        task.description = Some("Use OAuth".into());
        assert_eq!(initial_prompt(&task), "Add login\n\nUse OAuth");
    }
}
