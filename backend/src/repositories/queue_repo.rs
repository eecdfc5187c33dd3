use sqlx::SqlitePool;

use crate::db::models::{processed_state, LearningQueueRow, PendingChat, QueueStatus};
use crate::error::AppError;

/// Durable FIFO of completed chats awaiting extraction, plus the
/// pending_chats staging table the memory subsystem drains.
#[derive(Clone)]
pub struct QueueRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl QueueRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
        }
    }

    pub fn with_pools(read_pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    pub async fn enqueue(
        &self,
        user_id: &str,
        chat_id: &str,
        messages_json: &str,
    ) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO learning_queue (user_id, chat_id, messages) VALUES (?1, ?2, ?3)",
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(messages_json)
        .execute(&self.write_pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest unprocessed row, FIFO by created_at.
    pub async fn next_unprocessed(&self) -> Result<Option<LearningQueueRow>, AppError> {
        let row = sqlx::query_as::<_, LearningQueueRow>(
            "SELECT * FROM learning_queue WHERE processed = 0 ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_in_progress(&self, id: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE learning_queue SET processed = ?2, process_started_at = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .bind(processed_state::IN_PROGRESS)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn mark_done(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE learning_queue SET processed = ?2 WHERE id = ?1")
            .bind(id)
            .bind(processed_state::DONE)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE learning_queue SET processed = -1, process_started_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn queue_status(&self, worker_running: bool) -> Result<QueueStatus, AppError> {
        let pending = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM learning_queue WHERE processed = 0",
        )
        .fetch_one(&self.read_pool)
        .await?;
        let done = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM learning_queue WHERE processed = 1",
        )
        .fetch_one(&self.read_pool)
        .await?;
        let failed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM learning_queue WHERE processed = -1 AND process_started_at IS NULL",
        )
        .fetch_one(&self.read_pool)
        .await?;

        Ok(QueueStatus {
            pending,
            done,
            failed,
            worker_running,
        })
    }

    pub async fn insert_pending_chat(
        &self,
        id: &str,
        user_id: &str,
        chat_id: &str,
        messages_json: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pending_chats (id, user_id, chat_id, messages, created_at, processed)
            VALUES (?1, ?2, ?3, ?4, datetime('now','utc'), 0)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(chat_id)
        .bind(messages_json)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn next_pending_chat(&self) -> Result<Option<PendingChat>, AppError> {
        let row = sqlx::query_as::<_, PendingChat>(
            "SELECT * FROM pending_chats WHERE processed = 0 ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn set_pending_state(&self, id: &str, state: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE pending_chats SET processed = ?2 WHERE id = ?1")
            .bind(id)
            .bind(state)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn pending_chat_count(&self) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_chats WHERE processed = 0")
                .fetch_one(&self.read_pool)
                .await?;
        Ok(count)
    }
}
