/// Search record persistence
use crate::store::SearchRecord;
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

/// Search repository for database operations
pub struct SearchRepository {
    pool: SqlitePool,
}

impl SearchRepository {
    /// Create a new search repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a search execution; returns its row id
    pub async fn insert(&self, record: &SearchRecord) -> Result<i64> {
        let data = serde_json::to_string(record).context("Failed to encode search record")?;

        let result = sqlx::query(
            "INSERT INTO searches (request_id, chat_id, assistant_id, query, source, reference_count, error, duration_ms, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(&record.chat_id)
        .bind(&record.assistant_id)
        .bind(&record.query)
        .bind(&record.source)
        .bind(record.references.len() as i64)
        .bind(record.error.as_deref())
        .bind(record.duration_ms as i64)
        .bind(data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save search record")?;

        Ok(result.last_insert_rowid())
    }

    /// Searches of a chat, oldest first
    pub async fn list_for_chat(&self, chat_id: &str) -> Result<Vec<SearchRecord>> {
        let rows = sqlx::query("SELECT data FROM searches WHERE chat_id = ? ORDER BY id")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list searches")?;

        rows.iter()
            .map(|row| {
                serde_json::from_str(&row.get::<String, _>("data"))
                    .context("Failed to decode search record")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_search_is_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.searches();

        let record = SearchRecord {
            request_id: "req-1".into(),
            chat_id: "chat-1".into(),
            assistant_id: "tests.search".into(),
            query: "what is an lru".into(),
            keywords: vec![],
            config: json!({}),
            source: "auto".into(),
            references: vec![],
            xml: String::new(),
            prompt: String::new(),
            duration_ms: 12,
            error: Some("all search requests failed".into()),
            created_at: 1,
        };
        repo.insert(&record).await.unwrap();

        let stored = repo.list_for_chat("chat-1").await.unwrap();
        assert_eq!(stored, vec![record]);
    }
}
