use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::Database;
use crate::downloads::DownloadManager;
use crate::error::AppError;
use crate::llm::{LlmEngine, LlmHandle};
use crate::repositories::conversation_repo::ConversationRepo;
use crate::repositories::memory_repo::MemoryRepo;
use crate::repositories::profile_repo::ProfileRepo;
use crate::repositories::queue_repo::QueueRepo;
use crate::services::background_service::BackgroundService;
use crate::services::chat_service::ChatService;
use crate::services::embedding_service::EmbeddingService;
use crate::services::learning_service::{LearningService, UiActivity};
use crate::services::memory_service::MemoryService;
use crate::services::optimizer_service::OptimizerService;
use crate::services::retrieval_service::{RetrievalCache, RetrievalService};
use crate::vector::VectorStore;

const EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";

/// Everything the backend is made of, constructed once and passed around by
/// handle. No global singletons; tests build one of these against a temp
/// directory and a scripted engine.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,

    pub memory_repo: Arc<MemoryRepo>,
    pub profile_repo: Arc<ProfileRepo>,
    pub conversation_repo: Arc<ConversationRepo>,
    pub queue_repo: Arc<QueueRepo>,

    pub vector: Arc<VectorStore>,
    pub embedding: Option<Arc<EmbeddingService>>,
    pub llm: LlmHandle,
    pub ui: UiActivity,

    pub memory: Arc<MemoryService>,
    pub retrieval: Arc<RetrievalService>,
    pub optimizer: Arc<OptimizerService>,
    pub learning: Arc<LearningService>,
    pub chat: Arc<ChatService>,
    pub background: Arc<BackgroundService>,
    pub downloads: Arc<DownloadManager>,
}

impl AppState {
    pub async fn initialize(
        config: AppConfig,
        engine: Arc<dyn LlmEngine>,
    ) -> Result<Self, AppError> {
        let database = Arc::new(Database::new(&config, 4).await?);

        let read_pool = database.read_pool().clone();
        let write_pool = database.write_pool().clone();

        let memory_repo = Arc::new(MemoryRepo::with_pools(read_pool.clone(), write_pool.clone()));
        let profile_repo = Arc::new(ProfileRepo::with_pools(read_pool.clone(), write_pool.clone()));
        let conversation_repo = Arc::new(ConversationRepo::with_pools(
            read_pool.clone(),
            write_pool.clone(),
        ));
        let queue_repo = Arc::new(QueueRepo::with_pools(read_pool.clone(), write_pool.clone()));

        let vector = Arc::new(VectorStore::open(config.vector_dir(), config.embedding_dim)?);

        let embedding: Option<Arc<EmbeddingService>> =
            match EmbeddingService::new(EMBEDDING_MODEL, config.embedding_cache_dir()) {
                Ok(service) => {
                    tracing::info!(
                        target: "aster.state",
                        "Embedding service created (lazy init: {})",
                        service.is_initialized()
                    );
                    Some(Arc::new(service))
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to create embedding service: {e}. Continuing without embeddings."
                    );
                    None
                }
            };

        let cache = Arc::new(RetrievalCache::new(Duration::from_secs(
            config.retrieval_cache_ttl_secs,
        )));

        let memory = Arc::new(MemoryService::new(
            config.clone(),
            (*memory_repo).clone(),
            Arc::clone(&vector),
            embedding.clone(),
            Arc::clone(&cache),
        ));

        let retrieval = Arc::new(RetrievalService::new(
            (*memory_repo).clone(),
            Arc::clone(&vector),
            embedding.clone(),
            Arc::clone(&cache),
        ));

        let optimizer = Arc::new(OptimizerService::new(
            config.clone(),
            (*memory_repo).clone(),
            Arc::clone(&vector),
        ));

        let llm = LlmHandle::new(engine);
        let ui = UiActivity::new(true);

        let learning = Arc::new(LearningService::new(
            (*queue_repo).clone(),
            (*profile_repo).clone(),
            (*memory).clone(),
            llm.clone(),
            ui.clone(),
        ));

        let chat = Arc::new(ChatService::new(
            (*conversation_repo).clone(),
            (*retrieval).clone(),
            (*memory).clone(),
            (*learning).clone(),
            llm.clone(),
        ));

        let background = Arc::new(BackgroundService::new(
            config.clone(),
            Arc::clone(&database),
            (*memory_repo).clone(),
            (*optimizer).clone(),
            Arc::clone(&vector),
            embedding.clone(),
        ));
        background.start().await;

        let downloads = Arc::new(DownloadManager::initialize(&config).await?);

        tracing::info!(target: "aster.state", "Backend state initialized");

        Ok(Self {
            config,
            db: database,
            memory_repo,
            profile_repo,
            conversation_repo,
            queue_repo,
            vector,
            embedding,
            llm,
            ui,
            memory,
            retrieval,
            optimizer,
            learning,
            chat,
            background,
            downloads,
        })
    }

    /// Load the embedding model. The host calls this once after startup so
    /// the first retrieval does not pay the initialization cost; until it
    /// runs, every vector-dependent path degrades to SQL.
    pub async fn warm_up_embeddings(&self) -> Result<(), AppError> {
        match &self.embedding {
            Some(embedding) => embedding.ensure_initialized().await,
            None => Ok(()),
        }
    }

    /// Graceful shutdown: stop workers, flush indices, optimize the db.
    pub async fn shutdown(&self) {
        tracing::info!("Shutdown requested, stopping services");
        self.learning.stop().await;
        self.background.stop_all().await;
        self.downloads.shutdown().await;
        if let Err(e) = self.vector.save_all() {
            tracing::warn!("Failed to save vector indices on shutdown: {e}");
        }
        self.db.optimize().await;
        tracing::info!("Graceful shutdown complete");
    }
}
