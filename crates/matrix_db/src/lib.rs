//! SQLite persistence for the Event Matrix worker runtime.
//!
//! Owns the durable `tasks` queue plus the `event_log`, `runtime_log` and
//! `entity_records` tables. Schemas are created on open; callers treat the
//! store as an opaque keyed relational backend.

pub mod error;
pub mod logs;
pub mod records;
pub mod tasks;

pub use error::{DbError, Result};
pub use logs::{EventLogRecord, EventLogStore, RuntimeLogStore};
pub use records::RecordStore;
pub use tasks::TaskStore;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Open (creating if needed) the worker database and ensure the schema.
pub async fn open(path: &str) -> Result<DbPool> {
    let url = if path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{path}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    init_schema(&pool).await?;
    info!("Opened worker database: {}", path);
    Ok(pool)
}

/// In-memory database for tests.
pub async fn open_in_memory() -> Result<DbPool> {
    open(":memory:").await
}

async fn init_schema(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            event_label TEXT NOT NULL,
            event TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            retries INTEGER NOT NULL DEFAULT 0,
            exec_server TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            execute_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_tasks_event_id ON tasks (event_id)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_event_label ON tasks (event_label)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_execute_at ON tasks (execute_at)",
    ] {
        sqlx::query(index).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            event_label TEXT NOT NULL,
            user_id TEXT NOT NULL DEFAULT '',
            response_code TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            slow INTEGER NOT NULL DEFAULT 0,
            source_ip TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runtime_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_records (
            project TEXT NOT NULL,
            context TEXT NOT NULL,
            entity TEXT NOT NULL,
            record_id TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project, context, entity, record_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_schema() {
        let pool = open_in_memory().await.unwrap();

        // Idempotent on a second pass.
        init_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 4);
    }
}
