use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[sqlx(type_name = "learning_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LearningSource {
    CycleCompletion,
    BranchMerge,
    Manual,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Learning {
    pub id: Uuid,
    pub project_id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub content: String,
    pub source: LearningSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateLearning {
    pub project_id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub content: String,
    pub source: LearningSource,
}

const LEARNING_COLUMNS: &str = "id, project_id, cycle_id, task_id, content, source, created_at";

impl Learning {
    pub async fn create<'e, E>(executor: E, data: &CreateLearning) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Learning>(&format!(
            "INSERT INTO learnings (id, project_id, cycle_id, task_id, content, source, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {LEARNING_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(data.project_id)
        .bind(data.cycle_id)
        .bind(data.task_id)
        .bind(&data.content)
        .bind(data.source)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
    }

    /// Most recent first.
    pub async fn find_recent_for_project(
        pool: &SqlitePool,
        project_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Learning>(&format!(
            "SELECT {LEARNING_COLUMNS} FROM learnings WHERE project_id = $1
             ORDER BY created_at DESC, rowid DESC LIMIT $2"
        ))
        .bind(project_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_cycle_id(pool: &SqlitePool, cycle_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Learning>(&format!(
            "SELECT {LEARNING_COLUMNS} FROM learnings WHERE cycle_id = $1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(cycle_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_task_id(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Learning>(&format!(
            "SELECT {LEARNING_COLUMNS} FROM learnings WHERE task_id = $1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
