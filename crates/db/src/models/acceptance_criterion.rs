use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(type_name = "criterion_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CriterionStatus {
    #[default]
    Pending,
    Pass,
    Fail,
}

/// How a criterion is checked. Stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifierKind {
    /// Run `command`; pass when it exits with `expected` (default 0).
    CommandExitCode {
        command: String,
        #[serde(default)]
        expected: i32,
    },
    /// Run `command`; pass when stdout matches the regex `pattern`.
    OutputMatch { command: String, pattern: String },
    FileExists { path: String },
    /// Pass when the file at `path` contains a line matching `pattern`.
    PatternGrep { path: String, pattern: String },
    TestSuitePass { command: String },
    /// Manually ticked by the operator.
    Checklist { item: String },
}

impl VerifierKind {
    pub fn is_manual(&self) -> bool {
        matches!(self, VerifierKind::Checklist { .. })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub verifier: Json<VerifierKind>,
    pub status: CriterionStatus,
    pub last_output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAcceptanceCriterion {
    pub task_id: Uuid,
    pub description: String,
    pub verifier: VerifierKind,
}

const CRITERION_COLUMNS: &str =
    "id, task_id, description, verifier, status, last_output, created_at, updated_at";

impl AcceptanceCriterion {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateAcceptanceCriterion,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, AcceptanceCriterion>(&format!(
            "INSERT INTO acceptance_criteria (id, task_id, description, verifier, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'pending', $5, $5)
             RETURNING {CRITERION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(data.task_id)
        .bind(&data.description)
        .bind(Json(&data.verifier))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AcceptanceCriterion>(&format!(
            "SELECT {CRITERION_COLUMNS} FROM acceptance_criteria WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_task_id(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AcceptanceCriterion>(&format!(
            "SELECT {CRITERION_COLUMNS} FROM acceptance_criteria WHERE task_id = $1
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn set_result(
        pool: &SqlitePool,
        id: Uuid,
        status: CriterionStatus,
        output: Option<&str>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AcceptanceCriterion>(&format!(
            "UPDATE acceptance_criteria SET status = $2, last_output = $3, updated_at = $4
             WHERE id = $1
             RETURNING {CRITERION_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(output)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM acceptance_criteria WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
