use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::models::{ChatTurnMessage, NewMessage, Session, Urgency};
use crate::error::AppError;
use crate::extraction::patterns::extract_important_facts;
use crate::llm::{LlmHandle, TokenEvent};
use crate::repositories::conversation_repo::ConversationRepo;
use crate::services::learning_service::LearningService;
use crate::services::memory_service::MemoryService;
use crate::services::retrieval_service::RetrievalService;

const TRANSCRIPT_WINDOW: usize = 12;
const CONTEXT_MEMORY_LIMIT: usize = 8;
const FAST_PATH_MIN_IMPORTANCE: f64 = 0.5;

/// Per-turn orchestration: retrieve context, stream tokens, persist the
/// exchange, then hand the turn to the learning pipeline.
#[derive(Clone)]
pub struct ChatService {
    conversation_repo: ConversationRepo,
    retrieval: RetrievalService,
    memory_service: MemoryService,
    learning: LearningService,
    llm: LlmHandle,
    urgency: Urgency,
}

impl ChatService {
    pub fn new(
        conversation_repo: ConversationRepo,
        retrieval: RetrievalService,
        memory_service: MemoryService,
        learning: LearningService,
        llm: LlmHandle,
    ) -> Self {
        Self {
            conversation_repo,
            retrieval,
            memory_service,
            learning,
            llm,
            urgency: Urgency::Normal,
        }
    }

    /// Resolve the session, persist the user message, and stream the reply.
    /// The returned stream ends with `Done` (or `Error`); persistence and
    /// learning-queue handoff happen after the stream completes.
    pub async fn send_message(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        content: &str,
    ) -> Result<(Session, ReceiverStream<TokenEvent>), AppError> {
        let session = match session_id {
            Some(id) => self
                .conversation_repo
                .get_session(id)
                .await?
                .ok_or_else(|| AppError::NotFound {
                    entity: "session".to_string(),
                    id: id.to_string(),
                })?,
            None => self.conversation_repo.create_session(user_id, None).await?,
        };

        let history = self
            .conversation_repo
            .get_messages(&session.id, 1_000, 0)
            .await?;
        let position = history.last().map(|m| m.position + 1).unwrap_or(0);

        self.conversation_repo
            .insert_message(NewMessage {
                session_id: session.id.clone(),
                role: "user".to_string(),
                content: content.to_string(),
                position,
            })
            .await?;

        if position == 0 && session.title.is_none() {
            let title = synthesize_title(content);
            self.conversation_repo
                .update_session_title(&session.id, &title)
                .await?;
        }

        let retrieved = self
            .retrieval
            .retrieve(content, user_id, self.urgency, &[], CONTEXT_MEMORY_LIMIT)
            .await?;

        let mut prompt = String::from(
            "You are a helpful local AI assistant with long-term memory of this user.\n",
        );
        if !retrieved.memories.is_empty() {
            prompt.push_str("\nWhat you remember about the user:\n");
            for memory in &retrieved.memories {
                prompt.push_str(&format!(
                    "- {} (type: {}, importance: {:.2})\n",
                    memory.content, memory.memory_type, memory.importance
                ));
            }
        }
        prompt.push_str("\nConversation so far:\n");
        for message in history.iter().rev().take(TRANSCRIPT_WINDOW).rev() {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        prompt.push_str(&format!("user: {content}\nassistant:"));

        self.llm.clear_stop();
        let mut llm_stream = self.llm.stream(&prompt).await;

        let (tx, rx) = tokio::sync::mpsc::channel::<TokenEvent>(256);

        let service = self.clone();
        let session_id_owned = session.id.clone();
        let user_id_owned = user_id.to_string();
        let user_content = content.to_string();
        let next_position = position + 1;

        tokio::spawn(async move {
            let mut full_text = String::new();

            while let Some(event) = llm_stream.next().await {
                // Global stop flag: end the stream; whatever already streamed
                // is what gets persisted.
                if service.llm.stop_requested() {
                    let _ = tx.send(TokenEvent::Done).await;
                    break;
                }
                if let TokenEvent::Content(chunk) = &event {
                    full_text.push_str(chunk);
                }
                let done = matches!(event, TokenEvent::Done | TokenEvent::Error(_));
                if tx.send(event).await.is_err() {
                    break;
                }
                if done {
                    break;
                }
            }
            drop(llm_stream);

            if full_text.trim().is_empty() {
                return;
            }

            if let Err(e) = service
                .finish_turn(
                    &session_id_owned,
                    &user_id_owned,
                    &user_content,
                    &full_text,
                    next_position,
                )
                .await
            {
                tracing::error!("Failed to finish chat turn: {e}");
            }
        });

        Ok((session, ReceiverStream::new(rx)))
    }

    /// Post-stream bookkeeping: persist the reply, run the regex fast path,
    /// enqueue the turn for deep extraction.
    async fn finish_turn(
        &self,
        session_id: &str,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
        position: i64,
    ) -> Result<(), AppError> {
        self.conversation_repo
            .insert_message(NewMessage {
                session_id: session_id.to_string(),
                role: "assistant".to_string(),
                content: assistant_content.to_string(),
                position,
            })
            .await?;

        for fact in extract_important_facts(user_content, user_id) {
            if fact.importance >= FAST_PATH_MIN_IMPORTANCE {
                if let Err(e) = self.memory_service.store(fact).await {
                    tracing::warn!("Fast-path fact store failed: {e}");
                }
            }
        }

        let turn = vec![
            ChatTurnMessage {
                role: "user".to_string(),
                content: user_content.to_string(),
            },
            ChatTurnMessage {
                role: "assistant".to_string(),
                content: assistant_content.to_string(),
            },
        ];
        self.learning.enqueue_chat(user_id, session_id, &turn).await?;

        Ok(())
    }

    /// Ask the current generation to stop at the next chunk boundary.
    pub fn stop_generation(&self) {
        self.llm.request_stop();
    }

    pub async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<Session>, AppError> {
        self.conversation_repo.list_sessions(user_id, limit).await
    }

    pub async fn session_history(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<crate::db::models::Message>, AppError> {
        self.conversation_repo.get_messages(session_id, limit, 0).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), AppError> {
        self.conversation_repo.delete_session(session_id).await
    }
}

/// Session title from the first user message: whitespace collapsed, at most
/// 50 characters, ellipsis when truncated.
pub fn synthesize_title(first_message: &str) -> String {
    let collapsed = first_message.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    if chars.len() > 50 {
        let mut title: String = chars[..47].iter().collect();
        title.push_str("...");
        title
    } else if collapsed.is_empty() {
        "New Conversation".to_string()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_collapses_whitespace() {
        assert_eq!(
            synthesize_title("  how   do I\n\nresume a download? "),
            "how do I resume a download?"
        );
    }

    #[test]
    fn title_truncates_to_fifty_chars() {
        let long = "a".repeat(80);
        let title = synthesize_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn empty_message_gets_default_title() {
        assert_eq!(synthesize_title("   "), "New Conversation");
    }
}
