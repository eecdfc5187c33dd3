use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::db::models::{
    Memory, MemoryDeleteFilter, MemoryGraph, MemoryStats, MemoryTypeBreakdown, NewMemory,
    StoreOutcome, Tier,
};
use crate::error::AppError;
use crate::repositories::memory_repo::MemoryRepo;
use crate::services::embedding_service::EmbeddingService;
use crate::services::retrieval_service::RetrievalCache;
use crate::vector::VectorStore;

/// Canonical dedup hash: sha256 over the content alone.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Tier a memory belongs in, as a pure function of age and importance.
/// High-importance memories stay in the faster tiers twice as long.
pub fn target_tier(age_days: i64, importance: f64, config: &AppConfig) -> Tier {
    let multiplier = if importance >= 0.8 { 2 } else { 1 };
    if age_days <= config.hot_days * multiplier {
        Tier::Hot
    } else if age_days <= config.warm_days * multiplier {
        Tier::Warm
    } else {
        Tier::Cold
    }
}

pub fn age_days(created_at: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(created_at)
        .map(|dt| (chrono::Utc::now() - dt.with_timezone(&chrono::Utc)).num_days())
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S").map(|dt| {
                (chrono::Utc::now().naive_utc() - dt).num_days()
            })
        })
        .unwrap_or(0)
        .max(0)
}

/// CRUD and quality gating over typed memories. SQL is the source of truth;
/// the vector index is written best-effort after it.
#[derive(Clone)]
pub struct MemoryService {
    config: AppConfig,
    memory_repo: MemoryRepo,
    vector: Arc<VectorStore>,
    embedding: Option<Arc<EmbeddingService>>,
    cache: Arc<RetrievalCache>,
}

impl MemoryService {
    pub fn new(
        config: AppConfig,
        memory_repo: MemoryRepo,
        vector: Arc<VectorStore>,
        embedding: Option<Arc<EmbeddingService>>,
        cache: Arc<RetrievalCache>,
    ) -> Self {
        Self {
            config,
            memory_repo,
            vector,
            embedding,
            cache,
        }
    }

    pub fn repo(&self) -> &MemoryRepo {
        &self.memory_repo
    }

    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vector
    }

    /// Store one memory: gate on importance, reject exact duplicates, write
    /// the SQL row, then embed into the hot index best-effort. A vector
    /// failure after the SQL commit is tolerated; the orphan sweep and the
    /// hybrid backfill reconcile later.
    pub async fn store(&self, memory: NewMemory) -> Result<StoreOutcome, AppError> {
        if memory.importance < self.config.importance_threshold {
            tracing::debug!(
                "Skipping memory with importance {:.3} < {:.3}",
                memory.importance,
                self.config.importance_threshold
            );
            return Ok(StoreOutcome::SkippedImportance);
        }

        let hash = content_hash(&memory.content);
        if self
            .memory_repo
            .find_by_hash(&memory.user_id, &hash)
            .await?
            .is_some()
        {
            return Ok(StoreOutcome::SkippedDuplicate);
        }

        let row = crate::db::with_retry(|| {
            let repo = self.memory_repo.clone();
            let memory = memory.clone();
            let hash = hash.clone();
            async move { repo.insert_memory(&memory, &hash).await }
        })
        .await?;

        if let Some(embedding) = self.embedding.as_ref().filter(|e| e.is_initialized()) {
            match embedding.embed_text(&row.content).await {
                Ok(vector) => {
                    if let Err(e) = self.vector.add(Tier::Hot, &[vector], &[row.id.clone()]) {
                        tracing::warn!("Vector insert failed for {} (SQL row kept): {e}", row.id);
                    }
                }
                Err(e) => {
                    tracing::warn!("Embedding failed for {} (SQL row kept): {e}", row.id);
                }
            }
        }

        self.cache.invalidate_user(&memory.user_id);
        Ok(StoreOutcome::Stored { id: row.id })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Memory>, AppError> {
        self.memory_repo.get_memory(id).await
    }

    pub async fn list(
        &self,
        user_id: &str,
        memory_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Memory>, AppError> {
        self.memory_repo
            .list_memories(user_id, memory_type, limit, offset)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<u64, AppError> {
        let user_id = self
            .memory_repo
            .get_memory(id)
            .await?
            .map(|m| m.user_id);

        let deleted = self.memory_repo.delete_memory(id).await?;
        self.vector.remove_everywhere(&[id.to_string()]);

        if let Some(user_id) = user_id {
            self.cache.invalidate_user(&user_id);
        }
        Ok(deleted)
    }

    /// Bulk delete by filter; cascades to the vector index.
    pub async fn delete_filtered(
        &self,
        user_id: &str,
        filter: &MemoryDeleteFilter,
    ) -> Result<u64, AppError> {
        if filter.is_empty() {
            return Ok(0);
        }

        let mut victims: Vec<String> = Vec::new();

        if !filter.ids.is_empty() {
            let rows = self.memory_repo.get_memories_by_ids(&filter.ids).await?;
            victims.extend(
                rows.into_iter()
                    .filter(|m| m.user_id == user_id)
                    .map(|m| m.id),
            );
        }

        if !filter.memory_types.is_empty()
            || filter.older_than_days.is_some()
            || filter.importance_below.is_some()
        {
            let rows = self
                .memory_repo
                .list_memories(user_id, None, i64::MAX, 0)
                .await?;
            for row in rows {
                let type_match = filter.memory_types.is_empty()
                    || filter.memory_types.contains(&row.memory_type);
                let age_match = filter
                    .older_than_days
                    .map(|days| age_days(&row.created_at) > days)
                    .unwrap_or(true);
                let importance_match = filter
                    .importance_below
                    .map(|threshold| row.importance < threshold)
                    .unwrap_or(true);
                if type_match && age_match && importance_match {
                    victims.push(row.id);
                }
            }
        }

        victims.sort();
        victims.dedup();

        let deleted = self.memory_repo.delete_many(&victims).await?;
        self.vector.remove_everywhere(&victims);
        self.cache.invalidate_user(user_id);
        Ok(deleted)
    }

    pub async fn relate(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<(), AppError> {
        self.memory_repo
            .insert_relation(user_id, source_id, target_id, "related")
            .await
    }

    pub async fn graph(
        &self,
        user_id: &str,
        memory_id: &str,
        depth: i64,
    ) -> Result<MemoryGraph, AppError> {
        self.memory_repo
            .get_memory_graph(user_id, memory_id, depth)
            .await
    }

    pub async fn stats(&self, user_id: &str) -> Result<MemoryStats, AppError> {
        let rows = self
            .memory_repo
            .list_memories(user_id, None, i64::MAX, 0)
            .await?;

        let mut stats = MemoryStats {
            user_id: user_id.to_string(),
            total_memories: rows.len() as i64,
            ..MemoryStats::default()
        };

        let mut importance_sum = 0.0;
        for row in &rows {
            let tokens = (row.content.len() / 4).max(1) as i64;
            stats.total_tokens += tokens;
            stats.total_size_bytes += row.content.len() as i64;
            importance_sum += row.importance;

            let entry = stats
                .type_breakdown
                .entry(row.memory_type.clone())
                .or_insert_with(MemoryTypeBreakdown::default);
            entry.count += 1;
            entry.tokens += tokens;
        }
        if !rows.is_empty() {
            stats.avg_importance =
                (importance_sum / rows.len() as f64 * 100.0).round() / 100.0;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_content_only() {
        let a = content_hash("I like apples");
        let b = content_hash("I like apples");
        let c = content_hash("I like pears");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn tier_thresholds_follow_age_and_importance() {
        let config = AppConfig::new("/tmp/unused");

        assert_eq!(target_tier(0, 0.5, &config), Tier::Hot);
        assert_eq!(target_tier(7, 0.5, &config), Tier::Hot);
        assert_eq!(target_tier(8, 0.5, &config), Tier::Warm);
        assert_eq!(target_tier(90, 0.5, &config), Tier::Warm);
        assert_eq!(target_tier(91, 0.5, &config), Tier::Cold);

        // Importance >= 0.8 doubles both windows.
        assert_eq!(target_tier(14, 0.9, &config), Tier::Hot);
        assert_eq!(target_tier(15, 0.9, &config), Tier::Warm);
        assert_eq!(target_tier(180, 0.9, &config), Tier::Warm);
        assert_eq!(target_tier(181, 0.9, &config), Tier::Cold);
    }

    #[test]
    fn age_days_parses_both_timestamp_shapes() {
        let rfc = chrono::Utc::now().to_rfc3339();
        assert_eq!(age_days(&rfc), 0);

        let sqlite_style = (chrono::Utc::now() - chrono::Duration::days(10))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(age_days(&sqlite_style), 10);

        assert_eq!(age_days("garbage"), 0);
    }
}
