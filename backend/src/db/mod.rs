use std::path::PathBuf;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::config::AppConfig;
use crate::error::AppError;

pub mod migrations;
pub mod models;

#[derive(Clone)]
pub struct Database {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
    pub db_path: PathBuf,
}

impl Database {
    pub async fn new(config: &AppConfig, max_read_connections: u32) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let db_path = config.db_path();
        let base_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "MEMORY");

        // Create write and read pools concurrently for faster startup
        let write_opts = base_options.clone();
        let read_opts = base_options;

        let (write_result, read_result) = tokio::join!(
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(write_opts),
            SqlitePoolOptions::new()
                .max_connections(max_read_connections)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(read_opts),
        );

        let write_pool = write_result?;
        let read_pool = read_result?;

        migrations::run_migrations(&write_pool).await?;

        Ok(Self {
            write_pool,
            read_pool,
            db_path,
        })
    }

    pub fn write_pool(&self) -> &SqlitePool {
        &self.write_pool
    }

    pub fn read_pool(&self) -> &SqlitePool {
        &self.read_pool
    }

    /// Reclaim free pages. The weekly maintenance sweep calls this.
    pub async fn vacuum(&self) -> Result<(), AppError> {
        sqlx::query("VACUUM").execute(&self.write_pool).await?;
        Ok(())
    }

    /// Run PRAGMA optimize before closing. Call this on app shutdown.
    pub async fn optimize(&self) {
        let _ = sqlx::query("PRAGMA optimize")
            .execute(&self.write_pool)
            .await;
        tracing::info!("Database PRAGMA optimize executed");
    }
}

/// Retry an operation on sqlite lock contention, with a short growing delay.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    const MAX_ATTEMPTS: u32 = 3;

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(AppError::Database(message))
                if message.contains("database is locked") && attempt + 1 < MAX_ATTEMPTS =>
            {
                attempt += 1;
                let delay = Duration::from_millis(100 * u64::from(attempt));
                tracing::warn!(
                    "Database locked, retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    MAX_ATTEMPTS
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}
