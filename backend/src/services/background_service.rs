use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::models::Tier;
use crate::db::Database;
use crate::error::AppError;
use crate::repositories::memory_repo::MemoryRepo;
use crate::services::embedding_service::EmbeddingService;
use crate::services::memory_service::{age_days, target_tier};
use crate::services::optimizer_service::OptimizerService;
use crate::vector::VectorStore;

#[derive(Debug, Clone)]
pub enum BackgroundTask {
    OptimizeUser(String),
    Vacuum,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VacuumReport {
    pub operations: Vec<String>,
    pub execution_time_ms: f64,
}

/// Periodic maintenance: the weekly vacuum plus an on-demand task queue.
/// All jobs share one cancellation token and stop within a bounded wait.
#[derive(Clone)]
pub struct BackgroundService {
    config: AppConfig,
    db: Arc<Database>,
    memory_repo: MemoryRepo,
    optimizer: OptimizerService,
    vector: Arc<VectorStore>,
    embedding: Option<Arc<EmbeddingService>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    queue_tx: flume::Sender<BackgroundTask>,
    queue_rx: flume::Receiver<BackgroundTask>,
    cancel_token: CancellationToken,
}

impl BackgroundService {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        memory_repo: MemoryRepo,
        optimizer: OptimizerService,
        vector: Arc<VectorStore>,
        embedding: Option<Arc<EmbeddingService>>,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(256);

        Self {
            config,
            db,
            memory_repo,
            optimizer,
            vector,
            embedding,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            queue_tx,
            queue_rx,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn sender(&self) -> flume::Sender<BackgroundTask> {
        self.queue_tx.clone()
    }

    pub async fn start(&self) {
        self.start_worker().await;
        self.start_vacuum_job().await;
    }

    async fn start_worker(&self) {
        let rx = self.queue_rx.clone();
        let service = self.clone();
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Background worker shutting down gracefully");
                        break;
                    }
                    result = rx.recv_async() => {
                        match result {
                            Ok(BackgroundTask::OptimizeUser(user_id)) => {
                                let _ = service.optimizer.optimize(Some(&user_id), false).await;
                            }
                            Ok(BackgroundTask::Vacuum) => {
                                let _ = service.vacuum_and_optimize().await;
                            }
                            Err(_) => break, // Channel closed
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.insert("worker".to_string(), handle);
    }

    async fn start_vacuum_job(&self) {
        let service = self.clone();
        let token = self.cancel_token.clone();
        let interval = Duration::from_secs(self.config.vacuum_interval_days * 24 * 60 * 60);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so startup stays cheap.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Vacuum job shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = service.vacuum_and_optimize().await {
                            tracing::error!("Weekly vacuum failed: {e}");
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.insert("vacuum".to_string(), handle);
    }

    /// The weekly sweep, in order: age-based tier promotion, quota
    /// enforcement, cold summarization, low-importance cold removal, orphan
    /// sweep, relational VACUUM, vector compaction and save.
    pub async fn vacuum_and_optimize(&self) -> Result<VacuumReport, AppError> {
        let started = std::time::Instant::now();
        let mut report = VacuumReport::default();

        let promoted = self.promote_tiers_by_age().await?;
        if promoted > 0 {
            report
                .operations
                .push(format!("Age-based promotion: {promoted} memories"));
        }

        let quota_moved = self.enforce_tier_quotas().await?;
        if quota_moved > 0 {
            report
                .operations
                .push(format!("Quota promotion: {quota_moved} memories"));
        }

        let cutoff = (chrono::Utc::now() - chrono::Duration::days(self.config.warm_days))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let marked = self.memory_repo.mark_compressed_older_than(&cutoff).await?;
        if marked > 0 {
            report
                .operations
                .push(format!("Marked {marked} memories compressed"));
        }

        let mut summarized = 0u64;
        for user in self.memory_repo.distinct_user_ids().await? {
            summarized += self.optimizer.summarize_cold(&user).await?;
        }
        if summarized > 0 {
            report
                .operations
                .push(format!("Cold summaries written: {summarized}"));
        }

        let removed = self.remove_low_importance_cold().await?;
        if removed > 0 {
            report
                .operations
                .push(format!("Removed {removed} low-importance cold memories"));
        }

        let orphans = self.optimizer.sweep_orphan_vectors().await?;
        if orphans > 0 {
            report
                .operations
                .push(format!("Removed {orphans} orphaned vectors"));
        }

        self.db.vacuum().await?;
        report.operations.push("Relational VACUUM".to_string());

        self.vector.compact_and_save()?;
        report.operations.push("Vector indices compacted and saved".to_string());

        report.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            "Vacuum completed in {:.0}ms ({} operations)",
            report.execution_time_ms,
            report.operations.len()
        );
        Ok(report)
    }

    /// Advance each memory to the tier its age and importance call for.
    /// Transitions only ever move hot -> warm -> cold.
    async fn promote_tiers_by_age(&self) -> Result<u64, AppError> {
        let rows = self.memory_repo.all_rows().await?;
        let mut promoted = 0u64;

        for row in rows {
            let current = row.tier();
            let target = target_tier(age_days(&row.created_at), row.importance, &self.config);
            if current.advances_to(target) {
                self.move_memory_tier(&row.id, &row.content, current, target)
                    .await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Per-user hot/warm caps: oldest rows spill into the next tier.
    async fn enforce_tier_quotas(&self) -> Result<u64, AppError> {
        let mut moved = 0u64;

        for user in self.memory_repo.distinct_user_ids().await? {
            let hot = self.memory_repo.tier_rows_oldest_first(&user, Tier::Hot).await?;
            if hot.len() > self.config.max_hot_per_user {
                let excess = hot.len() - self.config.max_hot_per_user;
                for row in hot.into_iter().take(excess) {
                    self.move_memory_tier(&row.id, &row.content, Tier::Hot, Tier::Warm)
                        .await?;
                    moved += 1;
                }
            }

            let warm = self.memory_repo.tier_rows_oldest_first(&user, Tier::Warm).await?;
            if warm.len() > self.config.max_warm_per_user {
                let excess = warm.len() - self.config.max_warm_per_user;
                for row in warm.into_iter().take(excess) {
                    self.move_memory_tier(&row.id, &row.content, Tier::Warm, Tier::Cold)
                        .await?;
                    moved += 1;
                }
            }
        }

        Ok(moved)
    }

    /// Update the SQL tier and relocate the vector into the new tier's index
    /// when embeddings are available.
    async fn move_memory_tier(
        &self,
        id: &str,
        content: &str,
        from: Tier,
        to: Tier,
    ) -> Result<(), AppError> {
        self.memory_repo.set_tier(id, to).await?;

        let had_vector = self.vector.remove(from, &[id.to_string()]) > 0;
        if had_vector {
            if let Some(embedding) = &self.embedding {
                if embedding.is_initialized() {
                    match embedding.embed_text(content).await {
                        Ok(vector) => {
                            if let Err(e) = self.vector.add(to, &[vector], &[id.to_string()]) {
                                tracing::warn!("Tier move re-index failed for {id}: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("Tier move embedding failed for {id}: {e}"),
                    }
                }
            }
        }

        Ok(())
    }

    async fn remove_low_importance_cold(&self) -> Result<u64, AppError> {
        let victims = self.memory_repo.cold_low_importance_ids(0.1).await?;
        let deleted = self.memory_repo.delete_many(&victims).await?;
        self.vector.remove_everywhere(&victims);
        Ok(deleted)
    }

    /// Gracefully shut down all background tasks.
    /// Cancels the shared token and waits up to 5 seconds for tasks to finish.
    pub async fn stop_all(&self) {
        tracing::info!("Stopping all background tasks...");
        self.cancel_token.cancel();

        let mut tasks = self.tasks.lock().await;
        for (name, handle) in tasks.drain() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => tracing::info!("Task '{}' stopped cleanly", name),
                Ok(Err(e)) => tracing::warn!("Task '{}' panicked: {}", name, e),
                Err(_) => {
                    tracing::warn!("Task '{}' did not stop within 5s, aborting", name);
                }
            }
        }
        tracing::info!("All background tasks stopped");
    }
}
