/// Database module for SQLite persistence
///
/// This module stores assistant records and search executions. It uses sqlx
/// with WAL mode for better concurrency; all queries are parameterized.
use crate::store::{AssistantFilter, AssistantRecord, AssistantStore, SearchRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub mod assistants;
pub mod searches;

// Re-export commonly used types
pub use assistants::AssistantRepository;
pub use searches::SearchRepository;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for better concurrency
    /// 3. Run migrations to set up the schema
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations are idempotent and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Close the database connection, flushing the WAL first
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create an assistant repository
    pub fn assistants(&self) -> AssistantRepository {
        AssistantRepository::new(self.pool.clone())
    }

    /// Create a search repository
    pub fn searches(&self) -> SearchRepository {
        SearchRepository::new(self.pool.clone())
    }

    /// Store backed by this database
    pub fn store(&self) -> SqliteStore {
        SqliteStore {
            assistants: self.assistants(),
            searches: self.searches(),
        }
    }
}

/// `AssistantStore` over SQLite
pub struct SqliteStore {
    assistants: AssistantRepository,
    searches: SearchRepository,
}

fn db_error(err: anyhow::Error) -> EngineError {
    EngineError::Database(format!("{:#}", err))
}

#[async_trait]
impl AssistantStore for SqliteStore {
    async fn get_assistant(&self, assistant_id: &str) -> Result<AssistantRecord, EngineError> {
        self.assistants
            .get(assistant_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("assistant '{}'", assistant_id)))
    }

    async fn save_assistant(&self, record: &AssistantRecord) -> Result<String, EngineError> {
        let id = crate::store::record_id(record)?;
        self.assistants
            .upsert(&id, record)
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn delete_assistants(&self, filter: &AssistantFilter) -> Result<u64, EngineError> {
        self.assistants.delete_matching(filter).await.map_err(db_error)
    }

    async fn get_assistants(
        &self,
        filter: &AssistantFilter,
    ) -> Result<Vec<AssistantRecord>, EngineError> {
        self.assistants.list(filter).await.map_err(db_error)
    }

    async fn save_search(&self, record: &SearchRecord) -> Result<(), EngineError> {
        self.searches.insert(record).await.map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();

        assert!(db_path.exists());

        let result = sqlx::query("SELECT 1").fetch_one(db.pool()).await;
        assert!(result.is_ok());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();

        assert!(tables.contains(&"assistants".to_string()));
        assert!(tables.contains(&"searches".to_string()));

        db.close().await.unwrap();
    }
}
