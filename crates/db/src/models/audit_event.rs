use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Fixed vocabulary of audit event tags.
#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display,
)]
#[sqlx(type_name = "audit_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditEventType {
    TaskCreated,
    TaskStatusChanged,
    TaskDeleted,
    CodeHealthCheck,
    SpecDriftCheck,
    AuditTriggered,
    BranchSessionStarted,
    BranchSessionMerged,
    BranchSessionDiscarded,
    ContextClearedWithSummary,
    LearningCaptured,
    SubagentSpawned,
    SubagentCompleted,
    LoopDetected,
    StuckDetected,
    CompactionDetected,
    PermissionDecision,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub event_type: AuditEventType,
    /// Serialized JSON payload.
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAuditEvent {
    pub project_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub details: Value,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEventCount {
    pub event_type: AuditEventType,
    pub count: i64,
}

const AUDIT_COLUMNS: &str = "id, project_id, task_id, event_type, details, created_at";

impl AuditEvent {
    pub fn details_json(&self) -> Value {
        serde_json::from_str(&self.details).unwrap_or(Value::Null)
    }

    /// Append an event. There is no update path; the table rejects UPDATEs.
    pub async fn create<'e, E>(executor: E, data: &CreateAuditEvent) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, AuditEvent>(&format!(
            "INSERT INTO audit_events (id, project_id, task_id, event_type, details, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {AUDIT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(data.project_id)
        .bind(data.task_id)
        .bind(data.event_type)
        .bind(data.details.to_string())
        .bind(Utc::now())
        .fetch_one(executor)
        .await
    }

    /// Most recent first.
    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AuditEvent>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events WHERE task_id = $1
             ORDER BY created_at DESC, rowid DESC LIMIT $2"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Most recent first, across every task and project.
    pub async fn find_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AuditEvent>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events ORDER BY created_at DESC, rowid DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Most recent first, restricted to a project and a set of event types.
    pub async fn find_recent_for_project(
        pool: &SqlitePool,
        project_id: Uuid,
        types: &[AuditEventType],
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..types.len())
            .map(|i| format!("${}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events
             WHERE project_id = $1 AND event_type IN ({placeholders})
             ORDER BY created_at DESC, rowid DESC LIMIT $2"
        );
        let mut query = sqlx::query_as::<_, AuditEvent>(&sql).bind(project_id).bind(limit);
        for event_type in types {
            query = query.bind(*event_type);
        }
        query.fetch_all(pool).await
    }

    pub async fn latest_of_type_for_project<'e, E>(
        executor: E,
        project_id: Uuid,
        event_type: AuditEventType,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, AuditEvent>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events
             WHERE project_id = $1 AND event_type = $2
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(project_id)
        .bind(event_type)
        .fetch_optional(executor)
        .await
    }

    /// Per-type counts for a project, optionally only events strictly after
    /// the event with id `after` (by insertion order).
    pub async fn count_by_type_for_project<'e, E>(
        executor: E,
        project_id: Uuid,
        after: Option<Uuid>,
    ) -> Result<Vec<AuditEventCount>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, AuditEventCount>(
            "SELECT event_type, COUNT(*) AS count FROM audit_events
             WHERE project_id = $1
               AND ($2 IS NULL OR rowid > (SELECT rowid FROM audit_events WHERE id = $2))
             GROUP BY event_type ORDER BY event_type ASC",
        )
        .bind(project_id)
        .bind(after)
        .fetch_all(executor)
        .await
    }
}
