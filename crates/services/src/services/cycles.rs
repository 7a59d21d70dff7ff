use db::{
    DBService,
    models::{
        audit_event::{AuditEvent, AuditEventType},
        cycle::{Cycle, CycleStatus, is_unique_violation},
        learning::{CreateLearning, Learning, LearningSource},
        project::Project,
    },
};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::services::audit::AuditLog;

pub const CODE_HEALTH_RECOMMENDATION: &str = "code_health_review";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("project {0} already has an active cycle")]
    ActiveCycleExists(Uuid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleCompletion {
    pub cycle: Cycle,
    pub learning: Learning,
    /// Present when this completion hit the audit frequency.
    pub audit: Option<AuditEvent>,
}

#[derive(Clone)]
pub struct CycleManager {
    db: DBService,
    audit: AuditLog,
    audit_frequency: u32,
}

impl CycleManager {
    pub fn new(db: DBService, audit: AuditLog, audit_frequency: u32) -> Self {
        Self {
            db,
            audit,
            audit_frequency: audit_frequency.max(1),
        }
    }

    pub fn audit_frequency(&self) -> u32 {
        self.audit_frequency
    }

    /// Open the project's next cycle. Rejected while another one is active.
    pub async fn start(&self, project_id: Uuid, goal: &str) -> Result<Cycle, CycleError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(CycleError::Validation("cycle goal must not be empty".into()));
        }
        Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(CycleError::NotFound("project", project_id))?;
        if Cycle::find_active_for_project(&self.db.pool, project_id)
            .await?
            .is_some()
        {
            return Err(CycleError::ActiveCycleExists(project_id));
        }
        let cycle = Cycle::create_next(&self.db.pool, project_id, goal)
            .await
            .map_err(|e| {
                // A concurrent start won the partial unique index.
                if is_unique_violation(&e) {
                    CycleError::ActiveCycleExists(project_id)
                } else {
                    e.into()
                }
            })?;
        tracing::info!(cycle_id = %cycle.id, number = cycle.number, "Cycle started");
        Ok(cycle)
    }

    pub async fn find(&self, cycle_id: Uuid) -> Result<Cycle, CycleError> {
        Cycle::find_by_id(&self.db.pool, cycle_id)
            .await?
            .ok_or(CycleError::NotFound("cycle", cycle_id))
    }

    pub async fn list(&self, project_id: Uuid) -> Result<Vec<Cycle>, CycleError> {
        Ok(Cycle::find_by_project_id(&self.db.pool, project_id).await?)
    }

    pub async fn active(&self, project_id: Uuid) -> Result<Option<Cycle>, CycleError> {
        Ok(Cycle::find_active_for_project(&self.db.pool, project_id).await?)
    }

    pub async fn update_goal(&self, cycle_id: Uuid, goal: &str) -> Result<Cycle, CycleError> {
        if goal.trim().is_empty() {
            return Err(CycleError::Validation("cycle goal must not be empty".into()));
        }
        Cycle::update_goal(&self.db.pool, cycle_id, goal.trim())
            .await?
            .ok_or(CycleError::NotFound("cycle", cycle_id))
    }

    /// Only completed cycles, or active ones no task refers to, may be deleted.
    pub async fn delete(&self, cycle_id: Uuid) -> Result<(), CycleError> {
        let cycle = self.find(cycle_id).await?;
        if cycle.status == CycleStatus::Active && Cycle::count_tasks(&self.db.pool, cycle_id).await? > 0 {
            return Err(CycleError::Conflict(format!(
                "cycle {} is active and has tasks",
                cycle.number
            )));
        }
        Cycle::delete(&self.db.pool, cycle_id).await?;
        Ok(())
    }

    /// Close the cycle with its learnings. Every `audit_frequency`-th
    /// completion in the project also raises an advisory `audit_triggered`;
    /// completions of cycles deleted later still count.
    #[tracing::instrument(skip(self, learnings))]
    pub async fn complete(&self, cycle_id: Uuid, learnings: &str) -> Result<CycleCompletion, CycleError> {
        let learnings = learnings.trim();
        if learnings.is_empty() {
            return Err(CycleError::Validation(
                "learnings are required to complete a cycle".into(),
            ));
        }

        let mut tx = self.db.pool.begin().await?;
        let Some(cycle) = Cycle::complete(&mut *tx, cycle_id, learnings).await? else {
            drop(tx);
            let existing = self.find(cycle_id).await?;
            return Err(CycleError::Conflict(format!(
                "cycle {} is already {}",
                existing.number, existing.status
            )));
        };

        let learning = Learning::create(
            &mut *tx,
            &CreateLearning {
                project_id: cycle.project_id,
                cycle_id: Some(cycle.id),
                task_id: None,
                content: learnings.to_string(),
                source: LearningSource::CycleCompletion,
            },
        )
        .await?;
        AuditLog::record_with(
            &mut *tx,
            Some(cycle.project_id),
            None,
            AuditEventType::LearningCaptured,
            json!({
                "cycle_id": cycle.id,
                "cycle_number": cycle.number,
                "learning_id": learning.id,
                "source": learning.source,
                "content": learning.content,
            }),
        )
        .await?;

        let completed = Cycle::completions_to_date(&mut *tx, cycle.project_id).await?;
        let frequency = i64::from(self.audit_frequency);
        let audit = if completed > 0 && completed % frequency == 0 {
            let summary = AuditLog::summarize_since_last_audit(&mut *tx, cycle.project_id).await?;
            let event = AuditLog::record_with(
                &mut *tx,
                Some(cycle.project_id),
                None,
                AuditEventType::AuditTriggered,
                json!({
                    "frequency": self.audit_frequency,
                    "completed_cycles": completed,
                    "cycle_number": cycle.number,
                    "summary": summary,
                    "recommendation": CODE_HEALTH_RECOMMENDATION,
                }),
            )
            .await?;
            tracing::info!(
                project_id = %cycle.project_id,
                completed,
                "Audit recommended after cycle completion"
            );
            Some(event)
        } else {
            None
        };
        tx.commit().await?;

        tracing::info!(cycle_id = %cycle.id, number = cycle.number, "Cycle completed");
        Ok(CycleCompletion {
            cycle,
            learning,
            audit,
        })
    }

    pub async fn record_code_health_check(
        &self,
        project_id: Uuid,
        details: Value,
    ) -> Result<AuditEvent, CycleError> {
        Ok(self
            .audit
            .record(Some(project_id), None, AuditEventType::CodeHealthCheck, details)
            .await?)
    }

    pub async fn record_spec_drift_check(
        &self,
        project_id: Uuid,
        details: Value,
    ) -> Result<AuditEvent, CycleError> {
        Ok(self
            .audit
            .record(Some(project_id), None, AuditEventType::SpecDriftCheck, details)
            .await?)
    }
}
