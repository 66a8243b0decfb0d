//! Event and runtime log tables.
//!
//! Both are append-only and written best-effort: a failed log insert is
//! reported to tracing but never fails the request that produced it.

use matrix_protocol::now_millis;
use tracing::warn;

use crate::error::Result;
use crate::DbPool;

/// One processed-event record, written when the schema marks it logable.
#[derive(Debug, Clone, Default)]
pub struct EventLogRecord {
    pub event_id: String,
    pub event_label: String,
    pub user_id: String,
    pub response_code: String,
    pub duration_ms: i64,
    pub slow: bool,
    pub source_ip: String,
}

#[derive(Clone)]
pub struct EventLogStore {
    pool: DbPool,
}

impl EventLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &EventLogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_log
                (event_id, event_label, user_id, response_code, duration_ms, slow, source_ip, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_label)
        .bind(&record.user_id)
        .bind(&record.response_code)
        .bind(record.duration_ms)
        .bind(record.slow as i64)
        .bind(&record.source_ip)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fire-and-forget variant used on the hot path.
    pub async fn insert_best_effort(&self, record: &EventLogRecord) {
        if let Err(e) = self.insert(record).await {
            warn!("Failed to write event log for {}: {}", record.event_label, e);
        }
    }
}

#[derive(Clone)]
pub struct RuntimeLogStore {
    pool: DbPool,
}

impl RuntimeLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, level: &str, source: &str, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO runtime_log (level, source, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(level)
        .bind(source)
        .bind(message)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_best_effort(&self, level: &str, source: &str, message: &str) {
        if let Err(e) = self.insert(level, source, message).await {
            warn!("Failed to write runtime log: {}", e);
        }
    }
}
