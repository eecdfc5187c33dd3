use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::db::models::{NewMemory, Tier};
use crate::error::AppError;
use crate::repositories::memory_repo::MemoryRepo;
use crate::vector::VectorStore;

const COMPRESSION_MARKER: &str = "[compressed]";

/// Rewrite gate for the compression pass. `config.compress_min_length` only
/// selects SQL candidates; rows stay untouched until they exceed this.
const COMPRESS_REWRITE_LENGTH: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub skipped: bool,
    pub strategies_applied: Vec<String>,
    pub deduplicated: u64,
    pub importance_cleaned: u64,
    pub compressed: u64,
    pub merged: u64,
    pub archived: u64,
    pub orphan_vectors_removed: u64,
    pub execution_time_ms: f64,
}

/// Below this row count the pipeline is not worth running unforced.
const OPTIMIZE_ROW_THRESHOLD: i64 = 500;

/// Offline maintenance over the memory store: dedup, importance cleanup,
/// compression, similarity merge, archival, orphan-vector sweep. Each pass
/// persists its deletions before the next starts, so a failure mid-pipeline
/// leaves a consistent (just less optimized) store. Idempotent: a second run
/// over an unchanged store is a no-op.
#[derive(Clone)]
pub struct OptimizerService {
    config: AppConfig,
    memory_repo: MemoryRepo,
    vector: Arc<VectorStore>,
}

impl OptimizerService {
    pub fn new(config: AppConfig, memory_repo: MemoryRepo, vector: Arc<VectorStore>) -> Self {
        Self {
            config,
            memory_repo,
            vector,
        }
    }

    pub async fn optimize(
        &self,
        user_id: Option<&str>,
        force: bool,
    ) -> Result<OptimizeReport, AppError> {
        let started = std::time::Instant::now();
        let mut report = OptimizeReport::default();

        if !force && !self.needs_optimization(user_id).await? {
            report.skipped = true;
            return Ok(report);
        }

        report.deduplicated = self.deduplicate(user_id).await?;
        if report.deduplicated > 0 {
            report.strategies_applied.push("deduplication".to_string());
        }

        report.importance_cleaned = self.cleanup_low_importance(user_id).await?;
        if report.importance_cleaned > 0 {
            report.strategies_applied.push("importance_cleanup".to_string());
        }

        report.compressed = self.compress_large_content(user_id).await?;
        if report.compressed > 0 {
            report.strategies_applied.push("compression".to_string());
        }

        report.merged = self.merge_similar(user_id).await?;
        if report.merged > 0 {
            report.strategies_applied.push("similarity_merge".to_string());
        }

        if let Some(user) = user_id {
            report.archived = self.archive_over_cap(user).await?;
        } else {
            for user in self.memory_repo.distinct_user_ids().await? {
                report.archived += self.archive_over_cap(&user).await?;
            }
        }
        if report.archived > 0 {
            report.strategies_applied.push("archival".to_string());
        }

        report.orphan_vectors_removed = self.sweep_orphan_vectors().await?;
        if report.orphan_vectors_removed > 0 {
            report.strategies_applied.push("vector_cleanup".to_string());
        }

        report.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            "Memory optimization finished in {:.0}ms ({} strategies)",
            report.execution_time_ms,
            report.strategies_applied.len()
        );
        Ok(report)
    }

    async fn needs_optimization(&self, user_id: Option<&str>) -> Result<bool, AppError> {
        let count = match user_id {
            Some(user) => self.memory_repo.count_for_user(user).await?,
            None => {
                let mut total = 0;
                for user in self.memory_repo.distinct_user_ids().await? {
                    total += self.memory_repo.count_for_user(&user).await?;
                }
                total
            }
        };
        Ok(count >= OPTIMIZE_ROW_THRESHOLD)
    }

    /// Offline dedup: rows grouped by content keep the earliest id.
    async fn deduplicate(&self, user_id: Option<&str>) -> Result<u64, AppError> {
        let groups = self.memory_repo.duplicate_groups(user_id).await?;
        let mut victims = Vec::new();

        for group in groups {
            for id in group.all_ids.split(',') {
                if id != group.keep_id {
                    victims.push(id.to_string());
                }
            }
        }

        let deleted = self.memory_repo.delete_many(&victims).await?;
        self.vector.remove_everywhere(&victims);
        Ok(deleted)
    }

    async fn cleanup_low_importance(&self, user_id: Option<&str>) -> Result<u64, AppError> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::days(self.config.old_memory_days))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();

        let victims = self
            .memory_repo
            .stale_low_importance_ids(user_id, self.config.low_importance_threshold, &cutoff)
            .await?;

        let deleted = self.memory_repo.delete_many(&victims).await?;
        self.vector.remove_everywhere(&victims);
        Ok(deleted)
    }

    /// Rewrite long content to a marked prefix+suffix excerpt. The marker
    /// makes the pass idempotent.
    async fn compress_large_content(&self, user_id: Option<&str>) -> Result<u64, AppError> {
        let rows = self
            .memory_repo
            .oversized_rows(
                user_id,
                self.config.compress_min_length as i64,
                COMPRESSION_MARKER,
            )
            .await?;

        let mut compressed = 0u64;
        for (id, content) in rows {
            let Some(excerpt) = compress_content(&content) else {
                continue;
            };
            if let Some(row) = self.memory_repo.get_memory(&id).await? {
                self.memory_repo
                    .update_content(&id, &excerpt, row.importance, true)
                    .await?;
                compressed += 1;
            }
        }
        Ok(compressed)
    }

    /// Merge same-type pairs whose word sets overlap at or above the
    /// threshold; the higher-importance row wins and absorbs the other.
    async fn merge_similar(&self, user_id: Option<&str>) -> Result<u64, AppError> {
        let rows = self.memory_repo.rows_for_merge(user_id).await?;
        let mut merged_away: HashSet<String> = HashSet::new();
        let mut merged = 0u64;

        for i in 0..rows.len() {
            if merged_away.contains(&rows[i].id) {
                continue;
            }
            for j in (i + 1)..rows.len() {
                if merged_away.contains(&rows[j].id) || rows[i].memory_type != rows[j].memory_type {
                    continue;
                }
                if rows[i].user_id != rows[j].user_id {
                    continue;
                }

                let similarity = jaccard_similarity(&rows[i].content, &rows[j].content);
                if similarity < self.config.similarity_threshold {
                    continue;
                }

                // rows are ordered by importance desc, so row i wins.
                let keep = &rows[i];
                let drop = &rows[j];
                if !keep.content.ends_with("[merged: similar content consolidated]") {
                    let annotated =
                        format!("{} [merged: similar content consolidated]", keep.content);
                    self.memory_repo
                        .update_content(
                            &keep.id,
                            &annotated,
                            keep.importance.max(drop.importance),
                            keep.compressed != 0,
                        )
                        .await?;
                }
                self.memory_repo.delete_memory(&drop.id).await?;
                self.vector.remove_everywhere(&[drop.id.clone()]);
                merged_away.insert(drop.id.clone());
                merged += 1;
            }
        }

        Ok(merged)
    }

    /// Hard per-user cap: oldest, least important rows go first.
    async fn archive_over_cap(&self, user_id: &str) -> Result<u64, AppError> {
        let count = self.memory_repo.count_for_user(user_id).await?;
        if count <= self.config.max_memories_per_user {
            return Ok(0);
        }

        let excess = count - self.config.max_memories_per_user;
        let victims = self.memory_repo.archival_candidates(user_id, excess).await?;
        let deleted = self.memory_repo.delete_many(&victims).await?;
        self.vector.remove_everywhere(&victims);
        Ok(deleted)
    }

    /// Drop index entries whose SQL row is gone.
    pub async fn sweep_orphan_vectors(&self) -> Result<u64, AppError> {
        let indexed = self.vector.all_memory_ids();
        if indexed.is_empty() {
            return Ok(0);
        }

        let existing: HashSet<String> = self
            .memory_repo
            .existing_ids(&indexed)
            .await?
            .into_iter()
            .collect();

        let orphans: Vec<String> = indexed
            .into_iter()
            .filter(|id| !existing.contains(id))
            .collect();

        Ok(self.vector.remove_everywhere(&orphans) as u64)
    }

    /// Collapse a user's cold memories into per-month summaries. Individual
    /// entries stay addressable but are marked summary-only.
    pub async fn summarize_cold(&self, user_id: &str) -> Result<u64, AppError> {
        let cold_rows = self
            .memory_repo
            .tier_rows_oldest_first(user_id, Tier::Cold)
            .await?;

        let mut by_month: std::collections::BTreeMap<String, Vec<&crate::db::models::Memory>> =
            std::collections::BTreeMap::new();
        for row in cold_rows.iter().filter(|r| r.summary_only == 0) {
            let month: String = row.created_at.chars().take(7).collect();
            by_month.entry(month).or_default().push(row);
        }

        let mut summarized = 0u64;
        for (month, rows) in by_month {
            if rows.len() < 3 {
                continue;
            }

            let avg_importance =
                rows.iter().map(|r| r.importance).sum::<f64>() / rows.len() as f64;
            let sample: Vec<&str> = rows
                .iter()
                .take(3)
                .map(|r| r.content.as_str())
                .collect();
            let content = format!(
                "Summary of {} memories from {month} (avg importance {:.2}): {}",
                rows.len(),
                avg_importance,
                sample.join("; ")
            );

            let mut summary = NewMemory::new(user_id, &content, "meta", avg_importance.max(0.3));
            summary.category = "monthly_summary".to_string();
            summary.keywords = vec![month.clone(), "summary".to_string()];
            let hash = crate::services::memory_service::content_hash(&content);
            let row = self.memory_repo.insert_memory(&summary, &hash).await?;
            self.memory_repo.set_tier(&row.id, Tier::Cold).await?;

            for old in rows {
                self.memory_repo.mark_summary_only(&old.id).await?;
            }
            summarized += 1;
        }

        Ok(summarized)
    }
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

/// Excerpt long content to a marked prefix and suffix. Returns None when the
/// content is under the rewrite gate or already compressed.
fn compress_content(content: &str) -> Option<String> {
    if content.starts_with(COMPRESSION_MARKER) {
        return None;
    }
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= COMPRESS_REWRITE_LENGTH {
        return None;
    }
    let prefix: String = chars[..200].iter().collect();
    let suffix: String = chars[chars.len() - 100..].iter().collect();
    Some(format!("{COMPRESSION_MARKER} {prefix}...{suffix}"))
}
