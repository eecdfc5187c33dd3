use serde::Serialize;

#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Model inference error: {0}")]
    Inference(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl AppError {
    /// Wrap an existing error with additional context message.
    pub fn context(self, msg: impl Into<String>) -> Self {
        let ctx = msg.into();
        match self {
            Self::Database(e) => Self::Database(format!("{ctx}: {e}")),
            Self::Inference(e) => Self::Inference(format!("{ctx}: {e}")),
            Self::Embedding(e) => Self::Embedding(format!("{ctx}: {e}")),
            Self::VectorIndex(e) => Self::VectorIndex(format!("{ctx}: {e}")),
            Self::Download(e) => Self::Download(format!("{ctx}: {e}")),
            Self::Io(e) => Self::Io(format!("{ctx}: {e}")),
            Self::Internal(e) => Self::Internal(format!("{ctx}: {e}")),
            Self::Config(e) => Self::Config(format!("{ctx}: {e}")),
            Self::Timeout(e) => Self::Timeout(format!("{ctx}: {e}")),
            other => other, // Structured variants pass through unchanged
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::PoolTimedOut => {
                Self::Timeout(format!("Database connection pool timed out: {value}"))
            }
            sqlx::Error::ColumnNotFound(col) => {
                Self::Database(format!("Column '{col}' not found: {value}"))
            }
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            _ => Self::Database(value.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout(value.to_string())
        } else {
            Self::Download(value.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<flume::RecvError> for AppError {
    fn from(value: flume::RecvError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<flume::SendError<crate::services::background_service::BackgroundTask>> for AppError {
    fn from(value: flume::SendError<crate::services::background_service::BackgroundTask>) -> Self {
        Self::Internal(value.to_string())
    }
}
