use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display, Default,
)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Done,
    Interrupted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Interrupted,
    ];

    /// The complete transition table. Anything not listed here is a conflict.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Todo, InProgress)
                | (InProgress, Review)
                | (InProgress, Interrupted)
                | (Review, Done)
                | (Review, InProgress)
                | (Interrupted, InProgress)
        )
    }
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(type_name = "task_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    #[default]
    Implementation,
    Research,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
}

impl CreateTask {
    pub fn from_title(project_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            project_id,
            cycle_id: None,
            repo_id: None,
            title: title.into(),
            description: None,
            task_type: TaskType::Implementation,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub task_type: Option<TaskType>,
}

const TASK_COLUMNS: &str = "id, project_id, cycle_id, repo_id, title, description, task_type, \
     status, session_id, branch_name, worktree_path, created_at, updated_at, completed_at";

impl Task {
    pub async fn create<'e, E>(executor: E, data: &CreateTask, id: Uuid) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Task>(&format!(
            "INSERT INTO tasks (id, project_id, cycle_id, repo_id, title, description, task_type, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'todo', $8, $8)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(data.project_id)
        .bind(data.cycle_id)
        .bind(data.repo_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.task_type)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = $1 ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_cycle_id(pool: &SqlitePool, cycle_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE cycle_id = $1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(cycle_id)
        .fetch_all(pool)
        .await
    }

    /// All tasks, across projects, whose status is one of `statuses`.
    pub async fn find_by_statuses(
        pool: &SqlitePool,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Self>, sqlx::Error> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({placeholders}) ORDER BY updated_at ASC, rowid ASC"
        );
        let mut query = sqlx::query_as::<_, Task>(&sql);
        for status in statuses {
            query = query.bind(*status);
        }
        query.fetch_all(pool).await
    }

    /// Worktree paths held by tasks that are not yet `done`.
    pub async fn active_worktree_paths(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT worktree_path FROM tasks WHERE worktree_path IS NOT NULL AND status != 'done'",
        )
        .fetch_all(pool)
        .await
    }

    /// Fields left as `None` keep their stored value.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateTask,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "UPDATE tasks
             SET title = COALESCE($2, title),
                 description = COALESCE($3, description),
                 task_type = COALESCE($4, task_type),
                 updated_at = $5
             WHERE id = $1
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.task_type)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
    }

    /// Compare-and-set status update. Returns `None` when the row is missing
    /// or its status is no longer `from`, so two racing callers can never both
    /// apply the same transition. Entering `done` stamps `completed_at`.
    pub async fn transition<'e, E>(
        executor: E,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now();
        let completed_at = (to == TaskStatus::Done).then_some(now);
        sqlx::query_as::<_, Task>(&format!(
            "UPDATE tasks
             SET status = $3, updated_at = $4, completed_at = COALESCE($5, completed_at)
             WHERE id = $1 AND status = $2
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(now)
        .bind(completed_at)
        .fetch_optional(executor)
        .await
    }

    pub async fn set_workspace<'e, E>(
        executor: E,
        id: Uuid,
        branch_name: &str,
        worktree_path: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE tasks SET branch_name = $2, worktree_path = $3, updated_at = $4 WHERE id = $1")
            .bind(id)
            .bind(branch_name)
            .bind(worktree_path)
            .bind(Utc::now())
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_session_id<'e, E>(
        executor: E,
        id: Uuid,
        session_id: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE tasks SET session_id = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(session_id)
            .bind(Utc::now())
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
