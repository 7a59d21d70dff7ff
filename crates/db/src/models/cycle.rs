use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[sqlx(type_name = "cycle_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CycleStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Cycle {
    pub id: Uuid,
    pub project_id: Uuid,
    pub number: i64,
    pub goal: String,
    pub status: CycleStatus,
    pub learnings: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const CYCLE_COLUMNS: &str =
    "id, project_id, number, goal, status, learnings, created_at, completed_at";

impl Cycle {
    /// Insert the next cycle for a project as `active`. The number comes from
    /// the project's counter inside the insert, so numbers of deleted cycles
    /// are never handed out again; the partial unique index rejects a second
    /// active cycle.
    pub async fn create_next<'e, E>(
        executor: E,
        project_id: Uuid,
        goal: &str,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Cycle>(&format!(
            "INSERT INTO cycles (id, project_id, number, goal, status, created_at)
             VALUES ($1, $2,
                     (SELECT next_cycle_number FROM projects WHERE id = $2),
                     $3, 'active', $4)
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(goal)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Cycle>(&format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE id = $1"))
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_active_for_project<'e, E>(
        executor: E,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Cycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM cycles WHERE project_id = $1 AND status = 'active'"
        ))
        .bind(project_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Cycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM cycles WHERE project_id = $1 ORDER BY number ASC"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// Cycles ever completed in the project, including ones since deleted.
    pub async fn completions_to_date<'e, E>(
        executor: E,
        project_id: Uuid,
    ) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar("SELECT completed_cycles FROM projects WHERE id = $1")
        .bind(project_id)
        .fetch_one(executor)
        .await
    }

    /// Compare-and-set `active -> completed`. Returns `None` when the cycle is
    /// missing or no longer active.
    pub async fn complete<'e, E>(
        executor: E,
        id: Uuid,
        learnings: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Cycle>(&format!(
            "UPDATE cycles
             SET status = 'completed', learnings = $2, completed_at = $3
             WHERE id = $1 AND status = 'active'
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(id)
        .bind(learnings)
        .bind(Utc::now())
        .fetch_optional(executor)
        .await
    }

    pub async fn update_goal(
        pool: &SqlitePool,
        id: Uuid,
        goal: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Cycle>(&format!(
            "UPDATE cycles SET goal = $2 WHERE id = $1 RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(id)
        .bind(goal)
        .fetch_optional(pool)
        .await
    }

    pub async fn count_tasks(pool: &SqlitePool, id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE cycle_id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM cycles WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// True when `err` came from a UNIQUE/PRIMARY KEY constraint.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
