use std::sync::Arc;
use std::time::Duration;

use aster_lib::config::AppConfig;
use aster_lib::db::models::{
    ChatTurnMessage, MemoryDeleteFilter, NewMemory, SearchStrategy, StoreOutcome, Urgency,
};
use aster_lib::db::Database;
use aster_lib::llm::{LlmEngine, LlmHandle, TokenEvent, TokenStream};
use aster_lib::repositories::memory_repo::MemoryRepo;
use aster_lib::repositories::profile_repo::ProfileRepo;
use aster_lib::repositories::queue_repo::QueueRepo;
use aster_lib::services::learning_service::{LearningService, UiActivity};
use aster_lib::services::memory_service::{content_hash, MemoryService};
use aster_lib::services::optimizer_service::OptimizerService;
use aster_lib::services::retrieval_service::{RetrievalCache, RetrievalService};
use aster_lib::vector::VectorStore;

/// Engine that replies with the same canned text to every prompt.
struct CannedEngine {
    response: String,
}

impl CannedEngine {
    fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

impl LlmEngine for CannedEngine {
    fn name(&self) -> &str {
        "canned"
    }

    fn stream(&self, _prompt: &str) -> TokenStream {
        let events = vec![TokenEvent::Content(self.response.clone()), TokenEvent::Done];
        Box::pin(futures::stream::iter(events))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    memory_repo: MemoryRepo,
    queue_repo: QueueRepo,
    profile_repo: ProfileRepo,
    vector: Arc<VectorStore>,
    cache: Arc<RetrievalCache>,
    memory: MemoryService,
    retrieval: RetrievalService,
    optimizer: OptimizerService,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());
    let db = Database::new(&config, 2).await.expect("db");

    let memory_repo = MemoryRepo::with_pools(db.read_pool().clone(), db.write_pool().clone());
    let queue_repo = QueueRepo::with_pools(db.read_pool().clone(), db.write_pool().clone());
    let profile_repo = ProfileRepo::with_pools(db.read_pool().clone(), db.write_pool().clone());
    let vector = Arc::new(VectorStore::open(config.vector_dir(), config.embedding_dim).expect("vector"));
    let cache = Arc::new(RetrievalCache::new(Duration::from_secs(300)));

    let memory = MemoryService::new(
        config.clone(),
        memory_repo.clone(),
        Arc::clone(&vector),
        None, // embeddings offline; everything must degrade, not fail
        Arc::clone(&cache),
    );
    let retrieval = RetrievalService::new(
        memory_repo.clone(),
        Arc::clone(&vector),
        None,
        Arc::clone(&cache),
    );
    let optimizer = OptimizerService::new(config.clone(), memory_repo.clone(), Arc::clone(&vector));

    Harness {
        _dir: dir,
        memory_repo,
        queue_repo,
        profile_repo,
        vector,
        cache,
        memory,
        retrieval,
        optimizer,
    }
}

#[tokio::test]
async fn importance_gate_and_duplicate_rejection() {
    let h = harness().await;

    let low = NewMemory::new("u1", "I like apples", "preference", 0.1);
    assert_eq!(
        h.memory.store(low).await.expect("store"),
        StoreOutcome::SkippedImportance
    );

    let ok = NewMemory::new("u1", "I like apples", "preference", 0.8);
    assert!(matches!(
        h.memory.store(ok).await.expect("store"),
        StoreOutcome::Stored { .. }
    ));

    let dup = NewMemory::new("u1", "I like apples", "preference", 0.9);
    assert_eq!(
        h.memory.store(dup).await.expect("store"),
        StoreOutcome::SkippedDuplicate
    );

    let rows = h.memory.list("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content_hash, content_hash("I like apples"));
}

#[tokio::test]
async fn store_then_delete_restores_count() {
    let h = harness().await;

    let before = h.memory.list("u1", None, 100, 0).await.expect("list").len();

    let outcome = h
        .memory
        .store(NewMemory::new("u1", "temporary fact", "fact", 0.7))
        .await
        .expect("store");
    let StoreOutcome::Stored { id } = outcome else {
        panic!("expected stored");
    };

    assert_eq!(h.memory.list("u1", None, 100, 0).await.expect("list").len(), before + 1);
    assert_eq!(h.memory.delete(&id).await.expect("delete"), 1);
    assert_eq!(h.memory.list("u1", None, 100, 0).await.expect("list").len(), before);
}

#[tokio::test]
async fn filtered_delete_cascades() {
    let h = harness().await;

    for (content, memory_type) in [
        ("fact one about the user", "fact"),
        ("fact two about the user", "fact"),
        ("prefers short answers", "preference"),
    ] {
        h.memory
            .store(NewMemory::new("u1", content, memory_type, 0.7))
            .await
            .expect("store");
    }

    let deleted = h
        .memory
        .delete_filtered(
            "u1",
            &MemoryDeleteFilter {
                memory_types: vec!["fact".to_string()],
                ..MemoryDeleteFilter::default()
            },
        )
        .await
        .expect("delete");
    assert_eq!(deleted, 2);

    let rows = h.memory.list("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].memory_type, "preference");
}

#[tokio::test]
async fn comprehensive_retrieval_downgrades_and_reports_actual_strategy() {
    let h = harness().await;

    for content in [
        "rust borrow checker rules",
        "sqlite write ahead logging",
        "the user prefers dark roast coffee",
    ] {
        h.memory
            .store(NewMemory::new("u1", content, "fact", 0.7))
            .await
            .expect("store");
    }

    // Vector index is offline (no embedding service): comprehensive must
    // degrade to the SQL path and say so.
    let result = h
        .retrieval
        .retrieve("rust borrow checker", "u1", Urgency::Comprehensive, &[], 5)
        .await
        .expect("retrieve never fails outward");

    assert!(!result.memories.is_empty());
    assert_eq!(result.search_strategy, SearchStrategy::SqlKeyword);
    assert_eq!(result.urgency, Urgency::Comprehensive);
    assert!(result.latency_ms >= 0.0);
    assert_eq!(result.memories[0].content, "rust borrow checker rules");
    assert_eq!(result.relevance_scores.len(), result.memories.len());
}

#[tokio::test]
async fn retrieval_cache_is_invalidated_by_writes() {
    let h = harness().await;

    h.memory
        .store(NewMemory::new("u1", "first fact about coffee", "fact", 0.7))
        .await
        .expect("store");

    let first = h
        .retrieval
        .retrieve("coffee", "u1", Urgency::Instant, &[], 5)
        .await
        .expect("retrieve");
    assert_eq!(first.memories.len(), 1);

    h.memory
        .store(NewMemory::new("u1", "second fact about coffee", "fact", 0.7))
        .await
        .expect("store");

    let second = h
        .retrieval
        .retrieve("coffee", "u1", Urgency::Instant, &[], 5)
        .await
        .expect("retrieve");
    assert_eq!(second.memories.len(), 2, "write must invalidate the cache");
}

#[tokio::test]
async fn optimizer_dedup_is_idempotent() {
    let h = harness().await;

    // Insert duplicates below the service so the store gate cannot refuse.
    let duplicate = NewMemory::new("u1", "the same content twice", "fact", 0.6);
    let hash = content_hash(&duplicate.content);
    h.memory_repo.insert_memory(&duplicate, &hash).await.expect("insert");
    h.memory_repo.insert_memory(&duplicate, &hash).await.expect("insert");

    let first = h.optimizer.optimize(Some("u1"), true).await.expect("optimize");
    assert_eq!(first.deduplicated, 1);

    let rows = h.memory_repo.list_memories("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);

    // Steady state: a second run changes nothing.
    let second = h.optimizer.optimize(Some("u1"), true).await.expect("optimize");
    assert_eq!(second.deduplicated, 0);
    assert!(second.strategies_applied.is_empty());
}

#[tokio::test]
async fn similar_same_type_memories_merge_into_higher_importance() {
    let h = harness().await;

    let a = NewMemory::new(
        "u1",
        "the user runs arch linux on a thinkpad x1 carbon laptop for daily development work",
        "fact",
        0.9,
    );
    let b = NewMemory::new(
        "u1",
        "the user runs arch linux on a thinkpad x1 carbon notebook for daily development work",
        "fact",
        0.4,
    );
    h.memory_repo.insert_memory(&a, &content_hash(&a.content)).await.expect("insert");
    h.memory_repo.insert_memory(&b, &content_hash(&b.content)).await.expect("insert");

    let report = h.optimizer.optimize(Some("u1"), true).await.expect("optimize");
    assert_eq!(report.merged, 1);

    let rows = h.memory_repo.list_memories("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].content.contains("carbon laptop"));
    assert_eq!(rows[0].importance, 0.9);
}

#[tokio::test]
async fn orphan_vectors_are_swept() {
    let h = harness().await;

    // A vector entry with no SQL row behind it.
    h.vector
        .add(
            aster_lib::db::models::Tier::Hot,
            &[vec![0.5; 384]],
            &["ghost-memory".to_string()],
        )
        .expect("add");
    assert!(h.vector.contains("ghost-memory"));

    let swept = h.optimizer.sweep_orphan_vectors().await.expect("sweep");
    assert_eq!(swept, 1);
    assert!(!h.vector.contains("ghost-memory"));
}

#[tokio::test]
async fn learning_queue_is_fifo_and_tracks_states() {
    let h = harness().await;

    for i in 0..3 {
        h.queue_repo
            .enqueue("u1", &format!("chat-{i}"), "[]")
            .await
            .expect("enqueue");
    }

    let first = h.queue_repo.next_unprocessed().await.expect("next").expect("row");
    assert_eq!(first.chat_id, "chat-0");
    h.queue_repo.mark_done(first.id).await.expect("done");

    let second = h.queue_repo.next_unprocessed().await.expect("next").expect("row");
    assert_eq!(second.chat_id, "chat-1");
    h.queue_repo.mark_failed(second.id).await.expect("failed");

    let status = h.queue_repo.queue_status(false).await.expect("status");
    assert_eq!(status.pending, 1);
    assert_eq!(status.done, 1);
    assert_eq!(status.failed, 1);
    assert!(!status.worker_running);
}

fn canned_fact_response() -> &'static str {
    r#"[{"fact": "User plays chess on weekends", "category": "personal_info",
        "importance": 0.8, "keywords": ["chess", "weekends"]}]"#
}

fn learning_service(h: &Harness, ui_active: bool) -> LearningService {
    let llm = LlmHandle::new(Arc::new(CannedEngine::new(canned_fact_response())));
    LearningService::new(
        h.queue_repo.clone(),
        h.profile_repo.clone(),
        h.memory.clone(),
        llm,
        UiActivity::new(ui_active),
    )
    .with_idle_poll(Duration::from_millis(50))
}

fn turn_json() -> String {
    serde_json::to_string(&vec![
        ChatTurnMessage {
            role: "user".to_string(),
            content: "I play chess every weekend".to_string(),
        },
        ChatTurnMessage {
            role: "assistant".to_string(),
            content: "Nice, chess is great for pattern recognition.".to_string(),
        },
    ])
    .expect("json")
}

#[tokio::test]
async fn extraction_waits_while_ui_is_active_then_runs() {
    let h = harness().await;
    let learning = learning_service(&h, true);

    h.queue_repo
        .insert_pending_chat("p1", "u1", "chat-1", &turn_json())
        .await
        .expect("pending");

    // UI active: nothing may be processed, the row stays unprocessed.
    let processed = learning.process_pending_chats().await.expect("process");
    assert_eq!(processed, 0);
    assert_eq!(h.queue_repo.pending_chat_count().await.expect("count"), 1);
    assert!(h.memory.list("u1", None, 100, 0).await.expect("list").is_empty());

    // UI inactive: the row drains and memories appear.
    learning.ui().set_active(false);
    let processed = learning.process_pending_chats().await.expect("process");
    assert_eq!(processed, 1);
    assert_eq!(h.queue_repo.pending_chat_count().await.expect("count"), 0);

    let rows = h.memory.list("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].memory_type, "fact");
    assert_eq!(rows[0].content, "User plays chess on weekends");
}

#[tokio::test]
async fn replaying_a_chat_does_not_duplicate_memories() {
    let h = harness().await;
    let learning = learning_service(&h, false);

    h.queue_repo
        .insert_pending_chat("p1", "u1", "chat-1", &turn_json())
        .await
        .expect("pending");
    learning.process_pending_chats().await.expect("process");

    // The same chat re-queued (as after a preemption) stores nothing new.
    h.queue_repo
        .insert_pending_chat("p2", "u1", "chat-1", &turn_json())
        .await
        .expect("pending");
    learning.process_pending_chats().await.expect("process");

    let rows = h.memory.list("u1", None, 100, 0).await.expect("list");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn extraction_updates_user_profile() {
    let h = harness().await;
    let learning = learning_service(&h, false);

    h.queue_repo
        .insert_pending_chat("p1", "u1", "chat-1", &turn_json())
        .await
        .expect("pending");
    learning.process_pending_chats().await.expect("process");

    let profile = h
        .profile_repo
        .get_profile("u1")
        .await
        .expect("query")
        .expect("profile exists");
    let interests: Vec<String> = serde_json::from_str(&profile.interests).expect("interests");
    assert!(interests.contains(&"chess".to_string()));
    assert!(!profile.communication_style.is_empty());
}

#[tokio::test]
async fn worker_drains_queue_end_to_end() {
    let h = harness().await;
    let learning = learning_service(&h, false);

    learning
        .enqueue_chat(
            "u1",
            "chat-1",
            &[
                ChatTurnMessage {
                    role: "user".to_string(),
                    content: "I play chess every weekend".to_string(),
                },
                ChatTurnMessage {
                    role: "assistant".to_string(),
                    content: "Great hobby.".to_string(),
                },
            ],
        )
        .await
        .expect("enqueue");
    assert!(learning.worker_running());

    // Wait for the worker to move the row through the pipeline.
    let mut done = false;
    for _ in 0..100 {
        let status = learning.queue_status().await.expect("status");
        if status.pending == 0 && status.done == 1 {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(done, "queue row should be processed");

    let mut extracted = false;
    for _ in 0..100 {
        if !h.memory.list("u1", None, 100, 0).await.expect("list").is_empty() {
            extracted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(extracted, "extraction should have produced memories");

    learning.stop().await;
}
