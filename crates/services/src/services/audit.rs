use std::collections::BTreeMap;

use db::{
    DBService,
    models::audit_event::{AuditEvent, AuditEventType, CreateAuditEvent},
};
use serde_json::Value;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

/// Append-only ledger of state-changing events.
#[derive(Clone)]
pub struct AuditLog {
    db: DBService,
}

impl AuditLog {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        project_id: Option<Uuid>,
        task_id: Option<Uuid>,
        event_type: AuditEventType,
        details: Value,
    ) -> Result<AuditEvent, sqlx::Error> {
        Self::record_with(&self.db.pool, project_id, task_id, event_type, details).await
    }

    /// Same as [`AuditLog::record`] but on a caller-supplied executor, so the
    /// entry commits or rolls back together with the change it describes.
    pub async fn record_with<'e, E>(
        executor: E,
        project_id: Option<Uuid>,
        task_id: Option<Uuid>,
        event_type: AuditEventType,
        details: Value,
    ) -> Result<AuditEvent, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        AuditEvent::create(
            executor,
            &CreateAuditEvent {
                project_id,
                task_id,
                event_type,
                details,
            },
        )
        .await
    }

    /// For background watchers: failures are logged, never propagated.
    pub async fn record_best_effort(
        &self,
        project_id: Option<Uuid>,
        task_id: Option<Uuid>,
        event_type: AuditEventType,
        details: Value,
    ) {
        if let Err(e) = self.record(project_id, task_id, event_type, details).await {
            tracing::error!(%event_type, "Failed to write audit event: {}", e);
        }
    }

    pub async fn for_task(&self, task_id: Uuid, limit: i64) -> Result<Vec<AuditEvent>, sqlx::Error> {
        AuditEvent::find_by_task_id(&self.db.pool, task_id, limit).await
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, sqlx::Error> {
        AuditEvent::find_recent(&self.db.pool, limit).await
    }

    /// Per-type event counts for a project since its last `audit_triggered`
    /// event (or since the beginning).
    pub async fn summarize_since_last_audit<C>(
        conn: &mut C,
        project_id: Uuid,
    ) -> Result<BTreeMap<String, i64>, sqlx::Error>
    where
        for<'e> &'e mut C: Executor<'e, Database = Sqlite>,
    {
        let last = AuditEvent::latest_of_type_for_project(
            &mut *conn,
            project_id,
            AuditEventType::AuditTriggered,
        )
        .await?;
        let counts =
            AuditEvent::count_by_type_for_project(&mut *conn, project_id, last.map(|e| e.id))
                .await?;
        Ok(counts
            .into_iter()
            .map(|c| (c.event_type.to_string(), c.count))
            .collect())
    }
}
