use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display,
)]
#[sqlx(type_name = "rule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: Uuid,
    pub kind: RuleKind,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

impl PermissionRule {
    /// Insert a rule; adding a pattern that already exists for `kind` is a
    /// no-op. Returns whether a row was written.
    pub async fn add<'e, E>(executor: E, kind: RuleKind, pattern: &str) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO permission_rules (id, kind, pattern, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(kind)
        .bind(pattern.trim())
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removing a rule that does not exist is a no-op.
    pub async fn remove(pool: &SqlitePool, kind: RuleKind, pattern: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM permission_rules WHERE kind = $1 AND pattern = $2")
            .bind(kind)
            .bind(pattern.trim())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_kind(pool: &SqlitePool, kind: RuleKind) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PermissionRule>(
            "SELECT id, kind, pattern, created_at FROM permission_rules
             WHERE kind = $1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(kind)
        .fetch_all(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PermissionRule>(
            "SELECT id, kind, pattern, created_at FROM permission_rules ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(pool)
        .await
    }
}
