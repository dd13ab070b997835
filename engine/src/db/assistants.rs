/// Assistant persistence operations
///
/// Records are stored whole as JSON; `built_in` is mirrored into its own
/// column so built-in cleanup does not need to decode every row.
use crate::store::{AssistantFilter, AssistantRecord};
use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

/// Assistant repository for database operations
pub struct AssistantRepository {
    pool: SqlitePool,
}

impl AssistantRepository {
    /// Create a new assistant repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an assistant record
    pub async fn upsert(&self, assistant_id: &str, record: &AssistantRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("Failed to encode assistant record")?;
        let built_in = record
            .get("built_in")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO assistants (assistant_id, data, built_in, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(assistant_id) DO UPDATE SET data = excluded.data,
                 built_in = excluded.built_in, updated_at = excluded.updated_at",
        )
        .bind(assistant_id)
        .bind(data)
        .bind(built_in)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save assistant")?;

        Ok(())
    }

    /// Get an assistant by ID
    pub async fn get(&self, assistant_id: &str) -> Result<Option<AssistantRecord>> {
        let row = sqlx::query("SELECT data FROM assistants WHERE assistant_id = ?")
            .bind(assistant_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch assistant")?;

        row.map(|r| decode(&r.get::<String, _>("data")))
            .transpose()
    }

    /// List assistants matching `filter`, ordered by id
    pub async fn list(&self, filter: &AssistantFilter) -> Result<Vec<AssistantRecord>> {
        let rows = match filter.built_in {
            Some(built_in) => {
                sqlx::query("SELECT data FROM assistants WHERE built_in = ? ORDER BY assistant_id")
                    .bind(built_in)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT data FROM assistants ORDER BY assistant_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list assistants")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = decode(&row.get::<String, _>("data"))?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete assistants matching `filter`
    pub async fn delete_matching(&self, filter: &AssistantFilter) -> Result<u64> {
        let records = self.list(filter).await?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut deleted = 0;
        for record in &records {
            let Some(id) = record
                .get("assistant_id")
                .or_else(|| record.get("id"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let result = sqlx::query("DELETE FROM assistants WHERE assistant_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete assistant")?;
            deleted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit deletion")?;
        Ok(deleted)
    }
}

fn decode(data: &str) -> Result<AssistantRecord> {
    serde_json::from_str(data).context("Failed to decode assistant record")
}
