//! Durable task table.
//!
//! The scheduler and retry loops page through this table; the in-process
//! slot bookkeeping lives with the runtime, not here. All timestamps are
//! Unix milliseconds.

use matrix_protocol::{now_millis, Task, TaskStatus};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::info;

use crate::error::{DbError, Result};
use crate::DbPool;

#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    id: String,
    event_id: String,
    event_label: String,
    event: String,
    status: String,
    retries: i64,
    exec_server: String,
    created_at: i64,
    execute_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            status: TaskStatus::from_str(&self.status).unwrap_or_default(),
            id: self.id,
            event_id: self.event_id,
            event_label: self.event_label,
            event: self.event,
            retries: self.retries,
            exec_server: self.exec_server,
            created_at: self.created_at,
            execute_at: self.execute_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct TaskStore {
    pool: DbPool,
}

impl TaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a new or updated task (UPSERT on id).
    pub async fn upsert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, event_id, event_label, event, status, retries, exec_server,
                 created_at, execute_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                retries = excluded.retries,
                exec_server = excluded.exec_server,
                execute_at = excluded.execute_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.event_id)
        .bind(&task.event_label)
        .bind(&task.event)
        .bind(task.status.as_str())
        .bind(task.retries)
        .bind(&task.exec_server)
        .bind(task.created_at)
        .bind(task.execute_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(TaskRow::into_task))
    }

    /// Page of runnable tasks: PENDING with `execute_at` due.
    pub async fn fetch_due_pending(&self, now: i64, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE status = 'PENDING' AND execute_at <= ?
            ORDER BY execute_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    /// Atomically claim a pending task for execution.
    ///
    /// Returns false when another path already moved it out of PENDING.
    pub async fn mark_in_progress(&self, id: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'IN_PROGRESS', updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Page of retry candidates: IN_PROGRESS or TIMEOUT tasks.
    ///
    /// The caller filters out ids currently holding an in-process slot;
    /// what remains was orphaned by a crash or timed out remotely.
    pub async fn fetch_retryable(&self, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('IN_PROGRESS', 'TIMEOUT')
            ORDER BY updated_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    /// Push a task back to PENDING with a new due time and bumped retries.
    pub async fn reschedule(&self, id: &str, execute_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING', execute_at = ?, retries = retries + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execute_at)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a finished (or re-queued) execution outcome.
    pub async fn finish(&self, id: &str, status: TaskStatus, exec_server: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, exec_server = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(exec_server)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DbError::not_found(format!("task {id}")));
        }
        info!("Task {} -> {}", id, status);
        Ok(())
    }

    /// Tasks currently persisted per status, for stats handlers.
    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_protocol::Event;

    async fn store() -> TaskStore {
        TaskStore::new(crate::open_in_memory().await.unwrap())
    }

    fn sample_task(id: &str, execute_at: i64) -> Task {
        let event = Event {
            id: format!("evt-{id}"),
            project: "demo".into(),
            version: "0.0.1".into(),
            context: "main".into(),
            entity: "user_info".into(),
            event: "notify".into(),
            ..Default::default()
        };
        let mut task = Task::from_event(&event, 0).unwrap();
        task.id = id.to_string();
        task.execute_at = execute_at;
        task
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = store().await;
        let task = sample_task("t1", 0);
        store.upsert(&task).await.unwrap();

        let loaded = store.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.event_label, task.event_label);
        assert_eq!(loaded.status, TaskStatus::Pending);

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_pending_excludes_future() {
        let store = store().await;
        let now = now_millis();
        store.upsert(&sample_task("due", now - 10)).await.unwrap();
        store
            .upsert(&sample_task("future", now + 60_000))
            .await
            .unwrap();

        let due = store.fetch_due_pending(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
    }

    #[tokio::test]
    async fn test_mark_in_progress_claims_once() {
        let store = store().await;
        store.upsert(&sample_task("t1", 0)).await.unwrap();

        assert!(store.mark_in_progress("t1").await.unwrap());
        // Second claim loses: no longer PENDING.
        assert!(!store.mark_in_progress("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_missing_task_is_error() {
        let store = store().await;
        let result = store.finish("ghost", TaskStatus::Success, "srv-1").await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_cycle() {
        let store = store().await;
        store.upsert(&sample_task("t1", 0)).await.unwrap();
        store.mark_in_progress("t1").await.unwrap();

        let retryable = store.fetch_retryable(10).await.unwrap();
        assert_eq!(retryable.len(), 1);

        let due_at = now_millis() + 5_000;
        store.reschedule("t1", due_at).await.unwrap();

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert_eq!(task.execute_at, due_at);

        // Terminal finish leaves the retry set empty.
        store.mark_in_progress("t1").await.unwrap();
        store.finish("t1", TaskStatus::Success, "srv-9").await.unwrap();
        assert!(store.fetch_retryable(10).await.unwrap().is_empty());
        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.exec_server, "srv-9");
    }
}
