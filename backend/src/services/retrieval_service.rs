use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::future::Cache;

use crate::db::models::{Memory, RetrievalResult, SearchStrategy, Tier, Urgency};
use crate::error::AppError;
use crate::repositories::memory_repo::MemoryRepo;
use crate::services::embedding_service::EmbeddingService;
use crate::vector::VectorStore;

const HYBRID_CANDIDATE_LIMIT: i64 = 50;
const HYBRID_MIN_CANDIDATES: usize = 6;

/// Result cache keyed by (user, query, urgency, type set), invalidated per
/// user through a generation counter so writes never serve stale results.
pub struct RetrievalCache {
    cache: Cache<String, RetrievalResult>,
    generations: DashMap<String, u64>,
}

impl RetrievalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(1024)
                .build(),
            generations: DashMap::new(),
        }
    }

    fn generation(&self, user_id: &str) -> u64 {
        self.generations.get(user_id).map(|g| *g).unwrap_or(0)
    }

    fn key(&self, user_id: &str, query: &str, urgency: Urgency, types: &[String]) -> String {
        let mut types_key = types.to_vec();
        types_key.sort();
        format!(
            "{}:{}:{}:{}:{}",
            self.generation(user_id),
            user_id,
            query,
            urgency.as_str(),
            types_key.join(",")
        )
    }

    async fn get(
        &self,
        user_id: &str,
        query: &str,
        urgency: Urgency,
        types: &[String],
    ) -> Option<RetrievalResult> {
        self.cache
            .get(&self.key(user_id, query, urgency, types))
            .await
    }

    async fn put(
        &self,
        user_id: &str,
        query: &str,
        urgency: Urgency,
        types: &[String],
        result: RetrievalResult,
    ) {
        self.cache
            .insert(self.key(user_id, query, urgency, types), result)
            .await;
    }

    /// Any write for a user bumps the generation; old entries simply stop
    /// being addressable and age out with the TTL.
    pub fn invalidate_user(&self, user_id: &str) {
        *self.generations.entry(user_id.to_string()).or_insert(0) += 1;
    }
}

/// Translates a query plus an urgency budget into a concrete search
/// strategy. Never fails outward: vector trouble downgrades to hybrid,
/// hybrid trouble downgrades to SQL keyword search.
#[derive(Clone)]
pub struct RetrievalService {
    memory_repo: MemoryRepo,
    vector: Arc<VectorStore>,
    embedding: Option<Arc<EmbeddingService>>,
    cache: Arc<RetrievalCache>,
}

impl RetrievalService {
    pub fn new(
        memory_repo: MemoryRepo,
        vector: Arc<VectorStore>,
        embedding: Option<Arc<EmbeddingService>>,
        cache: Arc<RetrievalCache>,
    ) -> Self {
        Self {
            memory_repo,
            vector,
            embedding,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<RetrievalCache> {
        &self.cache
    }

    pub async fn retrieve(
        &self,
        query: &str,
        user_id: &str,
        urgency: Urgency,
        memory_types: &[String],
        limit: usize,
    ) -> Result<RetrievalResult, AppError> {
        if let Some(cached) = self.cache.get(user_id, query, urgency, memory_types).await {
            return Ok(cached);
        }

        let started = Instant::now();

        let mut result = match urgency {
            Urgency::Instant => self.sql_retrieval(query, user_id, memory_types, limit).await?,
            Urgency::Normal => match self.hybrid_retrieval(query, user_id, memory_types, limit).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Hybrid retrieval failed, downgrading to SQL: {e}");
                    self.sql_retrieval(query, user_id, memory_types, limit).await?
                }
            },
            Urgency::Comprehensive => {
                match self.vector_retrieval(query, user_id, memory_types, limit).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!("Vector retrieval failed, downgrading to hybrid: {e}");
                        match self.hybrid_retrieval(query, user_id, memory_types, limit).await {
                            Ok(result) => result,
                            Err(e) => {
                                tracing::warn!("Hybrid fallback failed, downgrading to SQL: {e}");
                                self.sql_retrieval(query, user_id, memory_types, limit).await?
                            }
                        }
                    }
                }
            }
        };

        result.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.urgency = urgency;

        let budget_ms = urgency.max_latency_ms() as f64;
        if result.latency_ms > budget_ms * 2.0 {
            tracing::warn!(
                "Retrieval ({}) took {:.1}ms, over twice the {:.0}ms budget",
                result.search_strategy.as_str(),
                result.latency_ms,
                budget_ms
            );
        }

        for memory in &result.memories {
            let _ = self.memory_repo.update_access(&memory.id).await;
        }

        self.cache
            .put(user_id, query, urgency, memory_types, result.clone())
            .await;
        Ok(result)
    }

    /// Instant path: keyword candidates scored by word overlap.
    /// score = 0.7 * content overlap + 0.3 * keyword overlap, per query word.
    async fn sql_retrieval(
        &self,
        query: &str,
        user_id: &str,
        memory_types: &[String],
        limit: usize,
    ) -> Result<RetrievalResult, AppError> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();

        let mut candidates = self
            .memory_repo
            .search_text(user_id, &terms, (limit as i64) * 4)
            .await?;
        if candidates.is_empty() {
            candidates = self
                .memory_repo
                .recent_memories(user_id, memory_types, (limit as i64) * 4)
                .await?;
        }
        if !memory_types.is_empty() {
            candidates.retain(|m| memory_types.contains(&m.memory_type));
        }

        let total_searched = candidates.len();
        let query_words: HashSet<String> = terms.iter().cloned().collect();

        let mut scored: Vec<(f64, Memory)> = candidates
            .into_iter()
            .map(|memory| {
                let score = keyword_score(&query_words, &memory);
                (score, memory)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let relevance_scores: Vec<f64> = scored.iter().map(|(s, _)| *s).collect();
        let memories: Vec<Memory> = scored.into_iter().map(|(_, m)| m).collect();

        Ok(RetrievalResult {
            memories,
            search_strategy: SearchStrategy::SqlKeyword,
            latency_ms: 0.0,
            total_searched,
            relevance_scores,
            query: query.to_string(),
            urgency: Urgency::Instant,
        })
    }

    /// Normal path: recent SQL candidates cosine-ranked against the query
    /// embedding. Vectors missing from the index are computed on the fly and
    /// back-filled.
    async fn hybrid_retrieval(
        &self,
        query: &str,
        user_id: &str,
        memory_types: &[String],
        limit: usize,
    ) -> Result<RetrievalResult, AppError> {
        let embedding = match &self.embedding {
            Some(embedding) if embedding.is_initialized() => embedding,
            _ => {
                return Err(AppError::Embedding(
                    "embedding service unavailable".to_string(),
                ))
            }
        };

        let candidates = self
            .memory_repo
            .recent_memories(user_id, memory_types, HYBRID_CANDIDATE_LIMIT)
            .await?;
        if candidates.len() < HYBRID_MIN_CANDIDATES {
            // Too few rows for ranking to matter; the keyword path is as good.
            let mut result = self.sql_retrieval(query, user_id, memory_types, limit).await?;
            result.urgency = Urgency::Normal;
            return Ok(result);
        }

        let query_vec = embedding.embed_text(query).await?;
        let contents: Vec<String> = candidates.iter().map(|m| m.content.clone()).collect();
        let vectors = embedding.embed_batch(contents).await?;

        // Backfill the hot index for rows the store never embedded.
        for (memory, vector) in candidates.iter().zip(vectors.iter()) {
            if !self.vector.contains(&memory.id) {
                let _ = self
                    .vector
                    .add(Tier::Hot, &[vector.clone()], &[memory.id.clone()]);
            }
        }

        let total_searched = candidates.len();
        let mut scored: Vec<(f64, Memory)> = candidates
            .into_iter()
            .zip(vectors.iter())
            .map(|(memory, vector)| (cosine_similarity(&query_vec, vector) as f64, memory))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let relevance_scores: Vec<f64> = scored.iter().map(|(s, _)| *s).collect();
        let memories: Vec<Memory> = scored.into_iter().map(|(_, m)| m).collect();

        Ok(RetrievalResult {
            memories,
            search_strategy: SearchStrategy::HybridSqlVector,
            latency_ms: 0.0,
            total_searched,
            relevance_scores,
            query: query.to_string(),
            urgency: Urgency::Normal,
        })
    }

    /// Comprehensive path: ANN across all tiers, memories rebuilt from their
    /// SQL rows by id.
    async fn vector_retrieval(
        &self,
        query: &str,
        user_id: &str,
        memory_types: &[String],
        limit: usize,
    ) -> Result<RetrievalResult, AppError> {
        let embedding = match &self.embedding {
            Some(embedding) if embedding.is_initialized() => embedding,
            _ => {
                return Err(AppError::Embedding(
                    "embedding service unavailable".to_string(),
                ))
            }
        };

        let query_vec = embedding.embed_text(query).await?;
        let matches = self
            .vector
            .multi_tier_search(&query_vec, limit * 2, &Tier::ALL);
        if matches.is_empty() {
            return Err(AppError::VectorIndex("no vector matches".to_string()));
        }

        let ids: Vec<String> = matches.iter().map(|m| m.memory_id.clone()).collect();
        let rows = self.memory_repo.get_memories_by_ids(&ids).await?;

        let total_searched = matches.len();
        let mut memories = Vec::new();
        let mut relevance_scores = Vec::new();
        for vector_match in &matches {
            let Some(row) = rows
                .iter()
                .find(|r| r.id == vector_match.memory_id && r.user_id == user_id)
            else {
                continue;
            };
            if !memory_types.is_empty() && !memory_types.contains(&row.memory_type) {
                continue;
            }
            memories.push(row.clone());
            // L2 distance to a similarity-like score.
            relevance_scores.push(1.0 / (1.0 + vector_match.distance as f64));
            if memories.len() >= limit {
                break;
            }
        }

        Ok(RetrievalResult {
            memories,
            search_strategy: SearchStrategy::VectorSemantic,
            latency_ms: 0.0,
            total_searched,
            relevance_scores,
            query: query.to_string(),
            urgency: Urgency::Comprehensive,
        })
    }
}

fn keyword_score(query_words: &HashSet<String>, memory: &Memory) -> f64 {
    if query_words.is_empty() {
        return 0.0;
    }

    let content_words: HashSet<String> = memory
        .content
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();
    let keywords: HashSet<String> = memory
        .keyword_list()
        .into_iter()
        .map(|k| k.to_lowercase())
        .collect();

    let content_overlap = query_words.intersection(&content_words).count() as f64;
    let keyword_overlap = query_words.intersection(&keywords).count() as f64;
    let relevance = (content_overlap * 0.7 + keyword_overlap * 0.3) / query_words.len() as f64;
    relevance.min(1.0)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / ((norm_a.sqrt() * norm_b.sqrt()).max(1e-6))
}
