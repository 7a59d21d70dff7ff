use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[sqlx(type_name = "branch_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Merged,
    Discarded,
}

/// An experimental fork of a task's running session.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionBranch {
    pub id: Uuid,
    pub task_id: Uuid,
    pub session_id: Option<String>,
    pub status: BranchStatus,
    pub work_summary: String,
    /// JSON-encoded snapshot captured at fork time.
    pub snapshot: String,
    /// Merge summary or discard reason, depending on `status`.
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateSessionBranch {
    pub task_id: Uuid,
    pub session_id: Option<String>,
    pub work_summary: String,
    pub snapshot: String,
}

const BRANCH_COLUMNS: &str =
    "id, task_id, session_id, status, work_summary, snapshot, resolution, created_at, resolved_at";

impl SessionBranch {
    pub async fn create<'e, E>(executor: E, data: &CreateSessionBranch) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, SessionBranch>(&format!(
            "INSERT INTO session_branches (id, task_id, session_id, status, work_summary, snapshot, created_at)
             VALUES ($1, $2, $3, 'active', $4, $5, $6)
             RETURNING {BRANCH_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(data.task_id)
        .bind(&data.session_id)
        .bind(&data.work_summary)
        .bind(&data.snapshot)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, SessionBranch>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM session_branches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_task_id(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, SessionBranch>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM session_branches WHERE task_id = $1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_active_for_task(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, SessionBranch>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM session_branches WHERE task_id = $1 AND status = 'active'"
        ))
        .bind(task_id)
        .fetch_optional(pool)
        .await
    }

    /// Compare-and-set `active -> merged|discarded`. `None` if the branch is
    /// missing or already resolved.
    pub async fn resolve<'e, E>(
        executor: E,
        id: Uuid,
        status: BranchStatus,
        resolution: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, SessionBranch>(&format!(
            "UPDATE session_branches
             SET status = $2, resolution = $3, resolved_at = $4
             WHERE id = $1 AND status = 'active'
             RETURNING {BRANCH_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(resolution)
        .bind(Utc::now())
        .fetch_optional(executor)
        .await
    }
}
