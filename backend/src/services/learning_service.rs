use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::models::{processed_state, ChatTurnMessage, PendingChat, QueueStatus, UserProfile};
use crate::error::AppError;
use crate::extraction::{ExtractionContext, FeedOutcome, RunawayDetector, ASPECTS};
use crate::llm::{LlmHandle, TokenEvent};
use crate::repositories::profile_repo::ProfileRepo;
use crate::repositories::queue_repo::QueueRepo;
use crate::services::memory_service::MemoryService;

/// Cooperative foreground signal. While the UI is active the extraction
/// worker must not touch the model; it aborts mid-stream and idles.
#[derive(Clone)]
pub struct UiActivity {
    tx: Arc<watch::Sender<bool>>,
}

impl UiActivity {
    pub fn new(initially_active: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_active);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_active(&self, active: bool) {
        if *self.tx.borrow() != active {
            tracing::info!(
                target: "aster.learning",
                "UI status changed -> {}",
                if active { "active" } else { "inactive" }
            );
        }
        let _ = self.tx.send(active);
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Drains the durable learning queue and turns completed chats into
/// memories, always yielding to the interactive path.
#[derive(Clone)]
pub struct LearningService {
    queue_repo: QueueRepo,
    profile_repo: ProfileRepo,
    memory_service: MemoryService,
    llm: LlmHandle,
    ui: UiActivity,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel_token: CancellationToken,
    idle_poll: Duration,
}

impl LearningService {
    pub fn new(
        queue_repo: QueueRepo,
        profile_repo: ProfileRepo,
        memory_service: MemoryService,
        llm: LlmHandle,
        ui: UiActivity,
    ) -> Self {
        Self {
            queue_repo,
            profile_repo,
            memory_service,
            llm,
            ui,
            worker: Arc::new(Mutex::new(None)),
            cancel_token: CancellationToken::new(),
            idle_poll: Duration::from_secs(10),
        }
    }

    /// Shorten the worker's idle poll. Test hook.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn ui(&self) -> &UiActivity {
        &self.ui
    }

    /// Queue one finished chat and make sure a worker is draining.
    pub async fn enqueue_chat(
        &self,
        user_id: &str,
        chat_id: &str,
        messages: &[ChatTurnMessage],
    ) -> Result<i64, AppError> {
        let messages_json = serde_json::to_string(messages)?;
        let queue_id = self
            .queue_repo
            .enqueue(user_id, chat_id, &messages_json)
            .await?;

        let pending = self.queue_repo.queue_status(true).await?.pending;
        tracing::info!(
            target: "aster.learning",
            "Queued chat {} for learning ({} pending)",
            chat_id,
            pending
        );

        self.ensure_worker_running();
        Ok(queue_id)
    }

    pub fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, AppError> {
        self.queue_repo.queue_status(self.worker_running()).await
    }

    /// Spawn the worker loop if none is alive. Called on every enqueue so a
    /// crashed worker is respawned by the next chat.
    pub fn ensure_worker_running(&self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let service = self.clone();
        *guard = Some(tokio::spawn(async move {
            service.worker_loop().await;
        }));
        tracing::info!(target: "aster.learning", "Learning worker started");
    }

    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let handle = self.worker.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    async fn worker_loop(&self) {
        loop {
            if self.cancel_token.is_cancelled() {
                tracing::info!("Learning worker shutting down");
                return;
            }

            if self.ui.is_active() {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
                continue;
            }

            match self.drain_one().await {
                Ok(true) => {
                    // Brief pause between items.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(false) => {
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => return,
                        _ = tokio::time::sleep(self.idle_poll) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Learning worker iteration failed: {e}");
                    tokio::time::sleep(self.idle_poll).await;
                }
            }
        }
    }

    /// One worker iteration: move the oldest queue row into pending_chats,
    /// then run the extraction pass over pending chats.
    async fn drain_one(&self) -> Result<bool, AppError> {
        let Some(row) = self.queue_repo.next_unprocessed().await? else {
            self.process_pending_chats().await?;
            return Ok(false);
        };

        self.queue_repo.mark_in_progress(row.id).await?;

        match serde_json::from_str::<Vec<ChatTurnMessage>>(&row.messages) {
            Ok(_) => {
                let pending_id = format!("{}_{}_{}", row.user_id, row.chat_id, row.id);
                self.queue_repo
                    .insert_pending_chat(&pending_id, &row.user_id, &row.chat_id, &row.messages)
                    .await?;
                self.queue_repo.mark_done(row.id).await?;
            }
            Err(e) => {
                tracing::warn!("Dropping queue row {} with bad payload: {e}", row.id);
                self.queue_repo.mark_failed(row.id).await?;
                return Ok(true);
            }
        }

        self.process_pending_chats().await?;
        Ok(true)
    }

    /// Drain pending chats while the UI stays inactive. A UI interrupt
    /// unwinds the current row to unprocessed and returns.
    pub async fn process_pending_chats(&self) -> Result<usize, AppError> {
        let mut processed = 0usize;

        while !self.ui.is_active() {
            let Some(chat) = self.queue_repo.next_pending_chat().await? else {
                break;
            };

            self.queue_repo
                .set_pending_state(&chat.id, processed_state::IN_PROGRESS)
                .await?;

            match self.extract_chat(&chat).await {
                Ok(ExtractOutcome::Completed { stored }) => {
                    self.queue_repo
                        .set_pending_state(&chat.id, processed_state::DONE)
                        .await?;
                    processed += 1;
                    tracing::info!(
                        target: "aster.learning",
                        "Extracted {} memories from chat {}",
                        stored,
                        chat.chat_id
                    );
                }
                Ok(ExtractOutcome::Preempted) => {
                    // UI opened mid-extraction; retry the whole row later.
                    self.queue_repo
                        .set_pending_state(&chat.id, processed_state::UNPROCESSED)
                        .await?;
                    tracing::info!(
                        target: "aster.learning",
                        "Extraction preempted by UI, re-queued chat {}",
                        chat.chat_id
                    );
                    break;
                }
                Err(AppError::Internal(message)) => {
                    // Bad payload; retrying cannot fix it.
                    tracing::warn!("Dropping pending chat {} with bad payload: {message}", chat.id);
                    self.queue_repo.set_pending_state(&chat.id, -1).await?;
                }
                Err(e) => {
                    tracing::error!("Extraction failed for chat {}: {e}", chat.chat_id);
                    self.queue_repo
                        .set_pending_state(&chat.id, processed_state::UNPROCESSED)
                        .await?;
                    break;
                }
            }
        }

        Ok(processed)
    }

    async fn extract_chat(&self, chat: &PendingChat) -> Result<ExtractOutcome, AppError> {
        let messages: Vec<ChatTurnMessage> = serde_json::from_str(&chat.messages)?;
        let ctx = ExtractionContext::from_messages(&chat.user_id, &messages);
        if ctx.is_empty() {
            return Ok(ExtractOutcome::Completed { stored: 0 });
        }

        let mut stored = 0usize;
        let mut interest_keywords: Vec<String> = Vec::new();
        let mut expertise_keywords: Vec<String> = Vec::new();

        for aspect in ASPECTS.iter() {
            if self.ui.is_active() {
                return Ok(ExtractOutcome::Preempted);
            }

            let response = match self.query_llm(&aspect.prompt(&ctx)).await {
                LlmQueryOutcome::Text(text) => text,
                LlmQueryOutcome::Preempted => return Ok(ExtractOutcome::Preempted),
                LlmQueryOutcome::Unavailable => {
                    // Engine busy with chat; treat like a preemption.
                    return Ok(ExtractOutcome::Preempted);
                }
            };

            let memories = aspect.memories_from_response(&ctx, &response);
            for memory in memories {
                match aspect.memory_type {
                    "preference" | "fact" => interest_keywords.extend(memory.keywords.clone()),
                    "skill" => expertise_keywords.extend(memory.keywords.clone()),
                    _ => {}
                }
                // Content-hash dedup makes a replayed row a no-op.
                match self.memory_service.store(memory).await {
                    Ok(crate::db::models::StoreOutcome::Stored { .. }) => stored += 1,
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to store extracted memory: {e}"),
                }
            }

            if self.ui.is_active() {
                return Ok(ExtractOutcome::Preempted);
            }
        }

        self.update_profile(&chat.user_id, &messages, interest_keywords, expertise_keywords)
            .await?;

        Ok(ExtractOutcome::Completed { stored })
    }

    /// Stream one extraction prompt, aborting on UI activity and trimming
    /// runaway generations.
    async fn query_llm(&self, prompt: &str) -> LlmQueryOutcome {
        let Some(mut stream) = self.llm.try_stream(prompt).await else {
            return LlmQueryOutcome::Unavailable;
        };

        let mut detector = RunawayDetector::new();
        while let Some(event) = stream.next().await {
            if self.ui.is_active() {
                return LlmQueryOutcome::Preempted;
            }
            match event {
                TokenEvent::Content(chunk) => {
                    if detector.feed(&chunk) == FeedOutcome::Stop {
                        tracing::warn!("Runaway extraction output detected, truncating stream");
                        break;
                    }
                }
                TokenEvent::Error(message) => {
                    tracing::warn!("Extraction stream error: {message}");
                    break;
                }
                TokenEvent::Done => break,
            }
        }

        LlmQueryOutcome::Text(detector.into_text())
    }

    /// Fold what this chat taught us into the user profile.
    async fn update_profile(
        &self,
        user_id: &str,
        messages: &[ChatTurnMessage],
        interests: Vec<String>,
        expertise: Vec<String>,
    ) -> Result<(), AppError> {
        let existing = self.profile_repo.get_profile(user_id).await?;

        let mut interest_set: Vec<String> = existing
            .as_ref()
            .map(|p| serde_json::from_str(&p.interests).unwrap_or_default())
            .unwrap_or_default();
        merge_keywords(&mut interest_set, interests, 32);

        let mut expertise_set: Vec<String> = existing
            .as_ref()
            .map(|p| serde_json::from_str(&p.expertise_areas).unwrap_or_default())
            .unwrap_or_default();
        merge_keywords(&mut expertise_set, expertise, 32);

        let user_messages: Vec<&ChatTurnMessage> =
            messages.iter().filter(|m| m.role == "user").collect();
        let avg_len = if user_messages.is_empty() {
            0
        } else {
            user_messages.iter().map(|m| m.content.len()).sum::<usize>() / user_messages.len()
        };
        let communication_style = if avg_len > 200 {
            "detailed"
        } else if avg_len > 50 {
            "conversational"
        } else {
            "concise"
        };

        let profile = UserProfile {
            user_id: user_id.to_string(),
            communication_style: communication_style.to_string(),
            interests: serde_json::to_string(&interest_set)?,
            expertise_areas: serde_json::to_string(&expertise_set)?,
            personality_traits: existing
                .as_ref()
                .map(|p| p.personality_traits.clone())
                .unwrap_or_else(|| "[]".to_string()),
            preferences: existing
                .map(|p| p.preferences)
                .unwrap_or_else(|| "{}".to_string()),
            updated_at: String::new(),
        };

        self.profile_repo.upsert_profile(&profile).await
    }
}

enum ExtractOutcome {
    Completed { stored: usize },
    Preempted,
}

enum LlmQueryOutcome {
    Text(String),
    Preempted,
    Unavailable,
}

fn merge_keywords(existing: &mut Vec<String>, incoming: Vec<String>, cap: usize) {
    for keyword in incoming {
        let keyword = keyword.to_lowercase();
        if keyword.len() >= 3 && !existing.contains(&keyword) {
            existing.push(keyword);
        }
    }
    existing.truncate(cap);
}
