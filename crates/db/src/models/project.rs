use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub goal: Option<String>,
    /// Opaque agent configuration blob (JSON), passed through to executors.
    pub agent_config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub goal: Option<String>,
    pub agent_config: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub goal: Option<String>,
    pub agent_config: Option<String>,
}

/// Explicit replacement for a process-wide "current project / current cycle"
/// selection. Callers own it and pass it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: Uuid,
    pub cycle_id: Option<Uuid>,
}

impl ProjectContext {
    pub fn new(project_id: Uuid) -> Self {
        Self {
            project_id,
            cycle_id: None,
        }
    }

    pub fn with_cycle(mut self, cycle_id: Uuid) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }
}

const PROJECT_COLUMNS: &str = "id, name, goal, agent_config, created_at, updated_at";

impl Project {
    pub async fn create(pool: &SqlitePool, data: &CreateProject) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, name, goal, agent_config, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&data.name)
        .bind(&data.goal)
        .bind(&data.agent_config)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
    }

    /// Fields left as `None` keep their stored value.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateProject,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "UPDATE projects
             SET name = COALESCE($2, name),
                 goal = COALESCE($3, goal),
                 agent_config = COALESCE($4, agent_config),
                 updated_at = $5
             WHERE id = $1
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(id)
        .bind(&data.name)
        .bind(&data.goal)
        .bind(&data.agent_config)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
    }
}
