use std::{collections::VecDeque, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::models::{
    audit_event::AuditEventType,
    task::{Task, TaskStatus},
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;
use utils::tool_signature::ActionSignature;
use uuid::Uuid;

use crate::services::{audit::AuditLog, config::Config};

const ALERT_CHANNEL_CAPACITY: usize = 64;
/// Undismissed alerts kept in memory; the oldest go first.
const MAX_RETAINED_ALERTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Repetition,
    Oscillation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    Continue,
    StopTask,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    Loop { kind: LoopKind, pattern: Vec<String> },
    Stuck { idle_secs: u64 },
    Compaction { count: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAlert {
    pub id: Uuid,
    pub session_id: String,
    pub task_id: Uuid,
    pub kind: AlertKind,
    pub remedies: Vec<Remedy>,
    pub created_at: DateTime<Utc>,
    /// Only compaction alerts expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl RecoveryAlert {
    fn new(session_id: &str, task_id: Uuid, kind: AlertKind) -> Self {
        let remedies = match kind {
            AlertKind::Loop { .. } | AlertKind::Stuck { .. } => {
                vec![Remedy::Continue, Remedy::StopTask]
            }
            AlertKind::Compaction { .. } => Vec::new(),
        };
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            task_id,
            kind,
            remedies,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub loop_threshold: usize,
    pub history_size: usize,
    pub stuck_timeout: Duration,
    pub poll_interval: Duration,
    pub compaction_display: Duration,
    pub max_alerts: usize,
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            loop_threshold: config.loop_threshold,
            history_size: config.action_history_size,
            stuck_timeout: Duration::from_secs(config.stuck_timeout_secs),
            poll_interval: Duration::from_secs(config.stuck_poll_interval_secs),
            compaction_display: Duration::from_secs(config.compaction_display_secs),
            max_alerts: MAX_RETAINED_ALERTS,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

struct SessionState {
    task_id: Uuid,
    project_id: Uuid,
    history: VecDeque<ActionSignature>,
    last_activity: Instant,
    stuck_flagged: bool,
    compactions: u32,
    watcher: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub issues: Vec<String>,
    pub interrupted_tasks: Vec<Task>,
    pub has_interrupted_tasks: bool,
}

/// Watches each running session's action stream for loops, stalls and
/// context compaction. Alerts are advisory and never fail the session.
#[derive(Clone)]
pub struct RecoveryMonitor {
    audit: AuditLog,
    settings: MonitorSettings,
    sessions: Arc<DashMap<String, SessionState>>,
    alerts: Arc<Mutex<Vec<RecoveryAlert>>>,
    events: broadcast::Sender<RecoveryAlert>,
}

impl RecoveryMonitor {
    pub fn new(audit: AuditLog, settings: MonitorSettings) -> Self {
        let (events, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            audit,
            settings,
            sessions: Arc::new(DashMap::new()),
            alerts: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryAlert> {
        self.events.subscribe()
    }

    /// Begin monitoring a session. Returns `false` if it already was.
    pub fn start(&self, session_id: &str, task_id: Uuid, project_id: Uuid) -> bool {
        if self.sessions.contains_key(session_id) {
            return false;
        }
        let watcher = CancellationToken::new();
        self.sessions.insert(
            session_id.to_string(),
            SessionState {
                task_id,
                project_id,
                history: VecDeque::with_capacity(self.settings.history_size),
                last_activity: Instant::now(),
                stuck_flagged: false,
                compactions: 0,
                watcher: watcher.clone(),
            },
        );
        self.spawn_stuck_watcher(session_id.to_string(), watcher);
        tracing::debug!(session_id, %task_id, "Recovery monitor started");
        true
    }

    /// Stop monitoring and release the session's buffer. Returns `false` if it
    /// was not monitored.
    pub fn stop(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, state)) => {
                state.watcher.cancel();
                tracing::debug!(session_id, "Recovery monitor stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn monitored_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// Note non-tool activity (reasoning, text) so the session is not
    /// considered stuck.
    pub fn touch(&self, session_id: &str) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.last_activity = Instant::now();
            state.stuck_flagged = false;
        }
    }

    pub fn history(&self, session_id: &str) -> Vec<ActionSignature> {
        self.sessions
            .get(session_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push one action into the session's history and run the loop
    /// detectors. A detection clears the history so one loop yields one alert.
    pub async fn record_action(
        &self,
        session_id: &str,
        signature: ActionSignature,
    ) -> Option<RecoveryAlert> {
        let (task_id, project_id, detected) = {
            let mut state = self.sessions.get_mut(session_id)?;
            state.last_activity = Instant::now();
            state.stuck_flagged = false;
            if state.history.len() == self.settings.history_size {
                state.history.pop_front();
            }
            state.history.push_back(signature);
            let detected = detect_loop(&state.history, self.settings.loop_threshold);
            if detected.is_some() {
                state.history.clear();
            }
            (state.task_id, state.project_id, detected?)
        };

        let (kind, pattern) = detected;
        tracing::warn!(session_id, ?kind, pattern = ?pattern, "Loop detected");
        let alert = RecoveryAlert::new(session_id, task_id, AlertKind::Loop { kind, pattern });
        self.audit
            .record_best_effort(
                Some(project_id),
                Some(task_id),
                AuditEventType::LoopDetected,
                json!({ "session_id": session_id, "alert": &alert }),
            )
            .await;
        self.publish(alert.clone());
        Some(alert)
    }

    /// Forward a context-compaction signal. Informational; expires after
    /// the display timeout.
    pub async fn record_compaction(&self, session_id: &str) -> Option<RecoveryAlert> {
        let (task_id, project_id, count) = {
            let mut state = self.sessions.get_mut(session_id)?;
            state.compactions += 1;
            state.last_activity = Instant::now();
            (state.task_id, state.project_id, state.compactions)
        };
        let mut alert = RecoveryAlert::new(session_id, task_id, AlertKind::Compaction { count });
        let display = chrono::Duration::from_std(self.settings.compaction_display)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        alert.expires_at = Some(alert.created_at + display);
        tracing::info!(session_id, count, "Context compaction detected");
        self.audit
            .record_best_effort(
                Some(project_id),
                Some(task_id),
                AuditEventType::CompactionDetected,
                json!({ "session_id": session_id, "count": count }),
            )
            .await;
        self.publish(alert.clone());
        Some(alert)
    }

    fn publish(&self, alert: RecoveryAlert) {
        let now = Utc::now();
        {
            let mut alerts = self.alerts.lock();
            alerts.retain(|a| !a.is_expired(now));
            alerts.push(alert.clone());
            let overflow = alerts.len().saturating_sub(self.settings.max_alerts.max(1));
            if overflow > 0 {
                alerts.drain(..overflow);
            }
        }
        let _ = self.events.send(alert);
    }

    /// Current alerts, with expired compaction notices dropped.
    pub fn active_alerts(&self) -> Vec<RecoveryAlert> {
        let now = Utc::now();
        let mut alerts = self.alerts.lock();
        alerts.retain(|a| !a.is_expired(now));
        alerts.clone()
    }

    pub fn dismiss_alert(&self, alert_id: Uuid) -> bool {
        let mut alerts = self.alerts.lock();
        let before = alerts.len();
        alerts.retain(|a| a.id != alert_id);
        alerts.len() != before
    }

    pub fn clear_alerts_for_session(&self, session_id: &str) {
        self.alerts.lock().retain(|a| a.session_id != session_id);
    }

    fn spawn_stuck_watcher(&self, session_id: String, cancel: CancellationToken) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.settings.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let flagged = {
                    let Some(mut state) = monitor.sessions.get_mut(&session_id) else {
                        break;
                    };
                    let idle = state.last_activity.elapsed();
                    if state.stuck_flagged || idle < monitor.settings.stuck_timeout {
                        None
                    } else {
                        state.stuck_flagged = true;
                        Some((state.task_id, state.project_id, idle.as_secs()))
                    }
                };
                if let Some((task_id, project_id, idle_secs)) = flagged {
                    tracing::warn!(session_id = %session_id, idle_secs, "Session appears stuck");
                    let alert =
                        RecoveryAlert::new(&session_id, task_id, AlertKind::Stuck { idle_secs });
                    monitor
                        .audit
                        .record_best_effort(
                            Some(project_id),
                            Some(task_id),
                            AuditEventType::StuckDetected,
                            json!({ "session_id": session_id, "idle_secs": idle_secs }),
                        )
                        .await;
                    monitor.publish(alert);
                }
            }
        });
    }

    /// Outstanding problems across persisted tasks, plus the list of
    /// interrupted tasks that can be resumed.
    pub async fn integrity_check(&self, pool: &SqlitePool) -> Result<IntegrityReport, sqlx::Error> {
        let tasks = Task::find_by_statuses(
            pool,
            &[TaskStatus::InProgress, TaskStatus::Review, TaskStatus::Interrupted],
        )
        .await?;

        let mut issues = Vec::new();
        let mut interrupted_tasks = Vec::new();
        for task in tasks {
            if task.status == TaskStatus::InProgress {
                let monitored = task
                    .session_id
                    .as_deref()
                    .is_some_and(|s| self.is_monitoring(s));
                if !monitored {
                    issues.push(format!(
                        "task {} is in progress but has no monitored session",
                        task.id
                    ));
                }
            }
            match task.worktree_path.as_deref() {
                Some(path) if !Path::new(path).exists() => issues.push(format!(
                    "task {} worktree is missing: {}",
                    task.id, path
                )),
                None if task.session_id.is_some() => issues.push(format!(
                    "task {} has a session but no worktree",
                    task.id
                )),
                _ => {}
            }
            if task.status == TaskStatus::Interrupted {
                interrupted_tasks.push(task);
            }
        }

        Ok(IntegrityReport {
            has_interrupted_tasks: !interrupted_tasks.is_empty(),
            issues,
            interrupted_tasks,
        })
    }
}

/// Repetition: the last `k` signatures are identical. Oscillation: the last
/// `k` signatures alternate between two distinct values.
fn detect_loop(history: &VecDeque<ActionSignature>, k: usize) -> Option<(LoopKind, Vec<String>)> {
    if k < 2 || history.len() < k {
        return None;
    }
    let window: Vec<&ActionSignature> = history.iter().skip(history.len() - k).collect();
    let (a, b) = (window[0], window[1]);

    if window.iter().all(|s| *s == a) {
        return Some((LoopKind::Repetition, vec![a.to_string()]));
    }
    if a != b
        && window
            .iter()
            .enumerate()
            .all(|(i, s)| *s == if i % 2 == 0 { a } else { b })
    {
        return Some((LoopKind::Oscillation, vec![a.to_string(), b.to_string()]));
    }
    None
}
