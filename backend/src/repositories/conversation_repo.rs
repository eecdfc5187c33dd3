use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Message, NewMessage, Session};
use crate::error::AppError;

#[derive(Clone)]
pub struct ConversationRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ConversationRepo {
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

    pub async fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Session, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO sessions (id, user_id, title) VALUES (?1, ?2, ?3)")
            .bind(&id)
            .bind(user_id)
            .bind(title)
            .execute(&self.write_pool)
            .await?;

        self.get_session(&id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "session".to_string(),
                id,
            })
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, AppError> {
        let row = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY COALESCE(last_message_at, created_at) DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_session_title(&self, id: &str, title: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sessions SET title = ?2, updated_at = datetime('now','utc') WHERE id = ?1",
        )
        .bind(id)
        .bind(title)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn insert_message(&self, message: NewMessage) -> Result<Message, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, position) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(message.position)
        .execute(&self.write_pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET message_count = message_count + 1,
                last_message_at = datetime('now','utc'),
                updated_at = datetime('now','utc')
            WHERE id = ?1
            "#,
        )
        .bind(&message.session_id)
        .execute(&self.write_pool)
        .await?;

        let row = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(&id)
            .fetch_one(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY position ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }
}
