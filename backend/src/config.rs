use std::path::{Path, PathBuf};

/// Runtime configuration for the backend. Everything lives under one data
/// directory so a test can point the whole system at a temp dir.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,

    /// Memories below this importance are stored in SQL only, never embedded.
    pub importance_threshold: f64,
    /// Importance-cleanup deletes below this when old and never accessed.
    pub low_importance_threshold: f64,
    /// Age in days before an untouched low-importance memory is removable.
    pub old_memory_days: i64,
    /// Content longer than this is eligible for excerpt compression.
    pub compress_min_length: usize,
    /// Jaccard similarity at or above which same-type memories merge.
    pub similarity_threshold: f64,
    /// Hard per-user cap enforced by the archival pass.
    pub max_memories_per_user: i64,

    /// Tier ages in days. Importance >= 0.8 doubles both thresholds.
    pub hot_days: i64,
    pub warm_days: i64,
    pub max_hot_per_user: usize,
    pub max_warm_per_user: usize,

    /// Retrieval result cache TTL in seconds.
    pub retrieval_cache_ttl_secs: u64,
    /// How often the maintenance vacuum runs, in days.
    pub vacuum_interval_days: u64,

    /// Embedding dimension for the vector index.
    pub embedding_dim: usize,

    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            importance_threshold: 0.2,
            low_importance_threshold: 0.3,
            old_memory_days: 30,
            compress_min_length: 100,
            similarity_threshold: 0.85,
            max_memories_per_user: 10_000,
            hot_days: 7,
            warm_days: 90,
            max_hot_per_user: 1_000,
            max_warm_per_user: 5_000,
            retrieval_cache_ttl_secs: 300,
            vacuum_interval_days: 7,
            embedding_dim: 384,
            log_filter: "warn,aster_lib=info".to_string(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("aster.db")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn download_state_path(&self) -> PathBuf {
        self.data_dir.join("download_state.json")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vector_indices")
    }

    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.data_dir.join("embeddings")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("aster.log")
    }
}

impl AsRef<Path> for AppConfig {
    fn as_ref(&self) -> &Path {
        &self.data_dir
    }
}
