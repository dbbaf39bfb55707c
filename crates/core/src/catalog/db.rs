use async_trait::async_trait;
use sqlx::PgPool;

use super::{CatalogSource, DefinitionKind};
use crate::error::CatalogError;

/// Row type for sqlx deserialization from the `behavior_definition` table.
#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: String,
    body: serde_json::Value,
}

/// Catalog source backed by Postgres.
#[derive(Clone)]
pub struct PgCatalogSource {
    pool: PgPool,
}

impl PgCatalogSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn load_all(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, CatalogError> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            "SELECT id, body FROM behavior_definition WHERE kind = $1 ORDER BY id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                if row.body.is_object() {
                    Some(row.body)
                } else {
                    tracing::warn!(kind = kind.as_str(), id = %row.id, "definition body is not an object");
                    None
                }
            })
            .collect())
    }
}

/// Insert or replace one definition.
pub async fn upsert(
    pool: &PgPool,
    kind: DefinitionKind,
    id: &str,
    body: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO behavior_definition (kind, id, body, updated_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (kind, id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()",
    )
    .bind(kind.as_str())
    .bind(id)
    .bind(body)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove one definition. Returns whether a row was deleted.
pub async fn delete(pool: &PgPool, kind: DefinitionKind, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM behavior_definition WHERE kind = $1 AND id = $2")
        .bind(kind.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
