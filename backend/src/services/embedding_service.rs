use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fastembed::{InitOptions, TextEmbedding};
use moka::future::Cache;

use crate::error::AppError;

/// Lazy fastembed wrapper. The model loads on first use; callers that can
/// live without embeddings check `is_initialized` and degrade instead of
/// forcing the load.
pub struct EmbeddingService {
    model_name: String,
    engine: Arc<Mutex<Option<TextEmbedding>>>,
    initialized: AtomicBool,
    cache: Cache<u64, Vec<f32>>,
    cache_dir: PathBuf,
}

impl EmbeddingService {
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, AppError> {
        Ok(Self {
            model_name: model_name.to_string(),
            engine: Arc::new(Mutex::new(None)),
            initialized: AtomicBool::new(false),
            cache: Cache::builder()
                .time_to_live(std::time::Duration::from_secs(60 * 60 * 24))
                .max_capacity(25_000)
                .build(),
            cache_dir,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        if self.initialized.load(Ordering::Relaxed) {
            return Ok(());
        }

        let is_initialized = {
            let guard = self
                .engine
                .lock()
                .map_err(|_| AppError::Embedding("Embedding engine lock poisoned".to_string()))?;
            guard.is_some()
        };

        if !is_initialized {
            let options = InitOptions::new(fastembed::EmbeddingModel::BGESmallENV15)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);

            let engine = TextEmbedding::try_new(options)
                .map_err(|e| AppError::Embedding(format!("Failed to initialize fastembed: {e}")))?;

            let mut guard = self
                .engine
                .lock()
                .map_err(|_| AppError::Embedding("Embedding engine lock poisoned".to_string()))?;
            *guard = Some(engine);
        }

        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let key = hash_text(text);
        if let Some(value) = self.cache.get(&key).await {
            return Ok(value);
        }

        self.ensure_initialized().await?;

        let text_owned = text.to_string();
        let engine_arc = self.engine.clone();

        let vector = tokio::task::spawn_blocking(move || {
            let mut guard = engine_arc
                .lock()
                .map_err(|_| AppError::Embedding("Embedding engine lock poisoned".to_string()))?;
            let engine = guard
                .as_mut()
                .ok_or_else(|| AppError::Embedding("Embedding engine not initialized".to_string()))?;

            let embeddings = engine
                .embed(vec![text_owned], None)
                .map_err(|e| AppError::Embedding(format!("fastembed embed failed: {e}")))?;

            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| AppError::Embedding("No embedding was generated".to_string()))
        })
        .await
        .map_err(|e| AppError::Embedding(format!("Task spawn failed: {e}")))??;

        self.cache.insert(key, vector.clone()).await;
        Ok(vector)
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let missing: Vec<String> = {
            let mut missing = Vec::new();
            for text in &texts {
                if !self.cache.contains_key(&hash_text(text)) {
                    missing.push(text.clone());
                }
            }
            missing
        };

        if !missing.is_empty() {
            self.ensure_initialized().await?;

            let mut computed = Vec::new();
            for chunk in missing.chunks(32) {
                let chunk_owned = chunk.to_vec();
                let engine_ref = self.engine.clone();
                let chunk_result = tokio::task::spawn_blocking(move || {
                    let mut guard = engine_ref.lock().map_err(|_| {
                        AppError::Embedding("Embedding engine lock poisoned".to_string())
                    })?;
                    let engine = guard.as_mut().ok_or_else(|| {
                        AppError::Embedding("Embedding engine not initialized".to_string())
                    })?;
                    engine
                        .embed(chunk_owned, None)
                        .map_err(|e| AppError::Embedding(format!("fastembed batch embed failed: {e}")))
                })
                .await
                .map_err(|e| AppError::Embedding(format!("Task spawn failed: {e}")))??;
                computed.extend(chunk_result);
            }

            for (text, vector) in missing.into_iter().zip(computed.into_iter()) {
                self.cache.insert(hash_text(&text), vector).await;
            }
        }

        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.cache.get(&hash_text(&text)).await {
                Some(vector) => out.push(vector),
                None => out.push(self.embed_text(&text).await?),
            }
        }
        Ok(out)
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
