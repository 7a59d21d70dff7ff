use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub path: String,
    pub tech_stack: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRepo {
    pub project_id: Uuid,
    pub name: String,
    pub path: String,
    pub tech_stack: Option<String>,
}

const REPO_COLUMNS: &str = "id, project_id, name, path, tech_stack, created_at";

impl Repo {
    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    pub async fn create(pool: &SqlitePool, data: &CreateRepo) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Repo>(&format!(
            "INSERT INTO repos (id, project_id, name, path, tech_stack, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {REPO_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(data.project_id)
        .bind(&data.name)
        .bind(&data.path)
        .bind(&data.tech_stack)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>(&format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Repos in registration order; the first is the project's default.
    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE project_id = $1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM repos WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
