use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The twelve memory aspects the extraction pipeline produces.
pub const MEMORY_TYPES: [&str; 12] = [
    "fact",
    "preference",
    "pattern",
    "skill",
    "goal",
    "event",
    "emotional",
    "temporal",
    "context",
    "meta",
    "social",
    "procedural",
];

/// Storage tier for a memory. Transitions only ever move forward
/// (hot -> warm -> cold) except on explicit restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub fn parse(value: &str) -> Tier {
        match value {
            "warm" => Tier::Warm,
            "cold" => Tier::Cold,
            _ => Tier::Hot,
        }
    }

    fn order(&self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    /// True when moving from `self` to `target` advances the tier.
    pub fn advances_to(&self, target: Tier) -> bool {
        target.order() > self.order()
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub memory_type: String,
    pub category: String,
    pub importance: f64,
    pub confidence: f64,
    pub keywords: String,
    pub context: String,
    pub temporal_pattern: String,
    pub metadata: String,
    pub content_hash: String,
    pub tier: String,
    pub compressed: i64,
    pub summary_only: i64,
    pub access_count: i64,
    pub last_accessed: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Memory {
    pub fn keyword_list(&self) -> Vec<String> {
        serde_json::from_str(&self.keywords).unwrap_or_default()
    }

    pub fn tier(&self) -> Tier {
        Tier::parse(&self.tier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMemory {
    pub user_id: String,
    pub content: String,
    pub memory_type: String,
    pub category: String,
    pub importance: f64,
    pub confidence: f64,
    pub keywords: Vec<String>,
    pub context: String,
    pub temporal_pattern: String,
    pub metadata: String,
    pub related_memories: Vec<String>,
}

impl NewMemory {
    pub fn new(user_id: &str, content: &str, memory_type: &str, importance: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            content: content.to_string(),
            memory_type: memory_type.to_string(),
            category: String::new(),
            importance,
            confidence: 0.8,
            keywords: Vec::new(),
            context: String::new(),
            temporal_pattern: String::new(),
            metadata: "{}".to_string(),
            related_memories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRelation {
    pub id: String,
    pub user_id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub relation_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryGraph {
    pub root_memory_id: String,
    pub nodes: Vec<Memory>,
    pub edges: Vec<MemoryRelation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub communication_style: String,
    pub interests: String,
    pub expertise_areas: String,
    pub personality_traits: String,
    pub preferences: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub message_count: i64,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub position: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub position: i64,
}

/// One turn of a chat as carried through the learning queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PendingChat {
    pub id: String,
    pub user_id: String,
    pub chat_id: String,
    pub messages: String,
    pub created_at: String,
    pub processed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LearningQueueRow {
    pub id: i64,
    pub user_id: String,
    pub chat_id: String,
    pub messages: String,
    pub created_at: String,
    pub processed: i64,
    pub process_started_at: Option<String>,
}

/// Queue row processing states.
pub mod processed_state {
    pub const UNPROCESSED: i64 = 0;
    pub const DONE: i64 = 1;
    pub const IN_PROGRESS: i64 = -1;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: i64,
    pub done: i64,
    pub failed: i64,
    pub worker_running: bool,
}

/// End-to-end latency budget for a retrieval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Instant,
    Normal,
    Comprehensive,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Instant => "instant",
            Urgency::Normal => "normal",
            Urgency::Comprehensive => "comprehensive",
        }
    }

    pub fn max_latency_ms(&self) -> u64 {
        match self {
            Urgency::Instant => 30,
            Urgency::Normal => 100,
            Urgency::Comprehensive => 300,
        }
    }
}

/// The strategy that actually produced a retrieval result. Reported
/// truthfully even after a downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    SqlKeyword,
    HybridSqlVector,
    VectorSemantic,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::SqlKeyword => "sql_keyword",
            SearchStrategy::HybridSqlVector => "hybrid_sql_vector",
            SearchStrategy::VectorSemantic => "vector_semantic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub memories: Vec<Memory>,
    pub search_strategy: SearchStrategy,
    pub latency_ms: f64,
    pub total_searched: usize,
    pub relevance_scores: Vec<f64>,
    pub query: String,
    pub urgency: Urgency,
}

/// Outcome of a memory store attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    Stored { id: String },
    SkippedImportance,
    SkippedDuplicate,
}

/// Filter for bulk memory deletion. Empty filter matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDeleteFilter {
    pub ids: Vec<String>,
    pub memory_types: Vec<String>,
    pub older_than_days: Option<i64>,
    pub importance_below: Option<f64>,
}

impl MemoryDeleteFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
            && self.memory_types.is_empty()
            && self.older_than_days.is_none()
            && self.importance_below.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTypeBreakdown {
    pub count: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub user_id: String,
    pub total_memories: i64,
    pub total_tokens: i64,
    pub total_size_bytes: i64,
    pub avg_importance: f64,
    pub type_breakdown: std::collections::HashMap<String, MemoryTypeBreakdown>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_transitions_only_advance() {
        assert!(Tier::Hot.advances_to(Tier::Warm));
        assert!(Tier::Hot.advances_to(Tier::Cold));
        assert!(Tier::Warm.advances_to(Tier::Cold));
        assert!(!Tier::Warm.advances_to(Tier::Hot));
        assert!(!Tier::Cold.advances_to(Tier::Cold));
    }

    #[test]
    fn tier_parse_defaults_to_hot() {
        assert_eq!(Tier::parse("warm"), Tier::Warm);
        assert_eq!(Tier::parse("nonsense"), Tier::Hot);
    }

    #[test]
    fn keyword_list_tolerates_bad_json() {
        let mut memory = Memory {
            id: "m1".to_string(),
            user_id: "u1".to_string(),
            content: "likes rust".to_string(),
            memory_type: "preference".to_string(),
            category: String::new(),
            importance: 0.5,
            confidence: 0.8,
            keywords: r#"["rust","systems"]"#.to_string(),
            context: String::new(),
            temporal_pattern: String::new(),
            metadata: "{}".to_string(),
            content_hash: String::new(),
            tier: "hot".to_string(),
            compressed: 0,
            summary_only: 0,
            access_count: 0,
            last_accessed: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(memory.keyword_list(), vec!["rust", "systems"]);

        memory.keywords = "not json".to_string();
        assert!(memory.keyword_list().is_empty());
    }
}
