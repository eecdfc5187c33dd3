//! The twelve extraction aspects, modeled as data: one prompt shape, one
//! response shape, dispatched uniformly over a shared context.

use serde_json::Value;

use crate::db::models::{ChatTurnMessage, NewMemory};
use crate::extraction::json_repair;

/// Shared input for every aspect pass over one chat.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub user_id: String,
    pub transcript: String,
}

impl ExtractionContext {
    pub fn from_messages(user_id: &str, messages: &[ChatTurnMessage]) -> Self {
        let mut transcript = String::new();
        for message in messages {
            match message.role.as_str() {
                "user" | "human" => {
                    transcript.push_str("User: ");
                    transcript.push_str(&message.content);
                    transcript.push('\n');
                }
                "assistant" | "ai" => {
                    transcript.push_str("AI: ");
                    transcript.push_str(&message.content);
                    transcript.push('\n');
                }
                _ => {}
            }
        }
        Self {
            user_id: user_id.to_string(),
            transcript,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.trim().is_empty()
    }

    fn context_snippet(&self) -> String {
        self.transcript.chars().take(500).collect()
    }
}

/// One named extraction strategy: what to look for, what key the model is
/// asked to emit, and which memory type the result becomes.
pub struct AspectStrategy {
    pub name: &'static str,
    pub memory_type: &'static str,
    content_key: &'static str,
    focus: &'static str,
    categories: &'static str,
    default_importance: f64,
}

pub const ASPECTS: [AspectStrategy; 12] = [
    AspectStrategy {
        name: "facts",
        memory_type: "fact",
        content_key: "fact",
        focus: "important factual information about the user. Focus on concrete, verifiable facts about their life, work, identity, location",
        categories: "personal_info|professional|location|identity|education|skills|family|possessions",
        default_importance: 0.8,
    },
    AspectStrategy {
        name: "preferences",
        memory_type: "preference",
        content_key: "preference",
        focus: "the user's preferences, opinions, likes, dislikes, and wants. Focus on things the user expresses positive or negative sentiment about",
        categories: "technology|food|entertainment|work|lifestyle|hobbies|communication|other",
        default_importance: 0.6,
    },
    AspectStrategy {
        name: "patterns",
        memory_type: "pattern",
        content_key: "pattern",
        focus: "recurring behavioral patterns in how the user works and interacts",
        categories: "communication|work_habits|learning|decision_making|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "skills",
        memory_type: "skill",
        content_key: "skill",
        focus: "the user's skills, competencies, and expertise levels",
        categories: "technical|creative|professional|interpersonal|other",
        default_importance: 0.6,
    },
    AspectStrategy {
        name: "goals",
        memory_type: "goal",
        content_key: "goal",
        focus: "the user's goals, plans, intentions, and objectives",
        categories: "career|learning|project|personal|health|other",
        default_importance: 0.7,
    },
    AspectStrategy {
        name: "events",
        memory_type: "event",
        content_key: "event",
        focus: "significant events, milestones, and occurrences mentioned by the user",
        categories: "milestone|deadline|meeting|life_event|other",
        default_importance: 0.6,
    },
    AspectStrategy {
        name: "emotional_context",
        memory_type: "emotional",
        content_key: "emotion",
        focus: "emotional states, reactions, and triggers the user expresses",
        categories: "frustration|excitement|stress|satisfaction|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "temporal_patterns",
        memory_type: "temporal",
        content_key: "pattern",
        focus: "time-based routines, schedules, and recurring timing the user mentions",
        categories: "daily|weekly|monthly|seasonal|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "context_info",
        memory_type: "context",
        content_key: "context",
        focus: "environmental and situational context: where and how the user works, tools and setup",
        categories: "environment|equipment|team|situation|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "meta_learning",
        memory_type: "meta",
        content_key: "insight",
        focus: "how the user learns and retains information best",
        categories: "learning_style|retention|explanation_preference|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "social_dynamics",
        memory_type: "social",
        content_key: "dynamic",
        focus: "relationships, collaboration, and social interactions the user describes",
        categories: "collaboration|mentorship|communication_style|other",
        default_importance: 0.5,
    },
    AspectStrategy {
        name: "procedures",
        memory_type: "procedural",
        content_key: "procedure",
        focus: "step-by-step processes and workflows the user follows or describes",
        categories: "workflow|debugging|deployment|review|other",
        default_importance: 0.6,
    },
];

impl AspectStrategy {
    pub fn prompt(&self, ctx: &ExtractionContext) -> String {
        format!(
            "Analyze this conversation and extract {focus}.\n\n\
             Conversation:\n{transcript}\n\n\
             Extract items and return them as a JSON list with this format:\n\
             [\n{{\n    \"{key}\": \"specific {key} about the user\",\n    \
             \"category\": \"{categories}\",\n    \
             \"importance\": 0.1-1.0,\n    \
             \"keywords\": [\"keyword1\", \"keyword2\"]\n}}\n]\n\n\
             IMPORTANT: Return only the JSON array, no other text. Do not repeat \
             content. If nothing is found, return []. Stop after the closing bracket ].",
            focus = self.focus,
            transcript = ctx.transcript,
            key = self.content_key,
            categories = self.categories,
        )
    }

    /// Turn one model response into memories. Unparseable items are dropped.
    pub fn memories_from_response(
        &self,
        ctx: &ExtractionContext,
        response: &str,
    ) -> Vec<NewMemory> {
        let items = json_repair::parse_array(response);
        let mut memories = Vec::new();

        for item in items {
            let Value::Object(map) = &item else { continue };

            let content = map
                .get(self.content_key)
                .or_else(|| map.get("content"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty());
            let Some(content) = content else { continue };

            let importance = match map.get("importance") {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(self.default_importance),
                Some(Value::String(s)) => s.parse().unwrap_or(self.default_importance),
                _ => self.default_importance,
            }
            .clamp(0.0, 1.0);

            let category = map
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("general")
                .to_string();

            let keywords: Vec<String> = match map.get("keywords") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect(),
                _ => vec![category.clone()],
            };

            let mut memory = NewMemory::new(&ctx.user_id, content, self.memory_type, importance);
            memory.category = category;
            memory.keywords = keywords;
            memory.context = ctx.context_snippet();
            memories.push(memory);
        }

        memories
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExtractionContext {
        ExtractionContext::from_messages(
            "u1",
            &[
                ChatTurnMessage {
                    role: "user".to_string(),
                    content: "I work as a firmware engineer".to_string(),
                },
                ChatTurnMessage {
                    role: "assistant".to_string(),
                    content: "Interesting!".to_string(),
                },
            ],
        )
    }

    #[test]
    fn transcript_labels_roles() {
        let ctx = ctx();
        assert!(ctx.transcript.contains("User: I work as a firmware engineer"));
        assert!(ctx.transcript.contains("AI: Interesting!"));
    }

    #[test]
    fn every_aspect_has_distinct_memory_type() {
        let mut types: Vec<&str> = ASPECTS.iter().map(|a| a.memory_type).collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), 12);
    }

    #[test]
    fn response_items_become_memories() {
        let ctx = ctx();
        let aspect = &ASPECTS[0];
        let response = r#"[
            {"fact": "User is a firmware engineer", "category": "professional",
             "importance": 0.9, "keywords": ["firmware", "engineer"]},
            {"not_the_key": "ignored"}
        ]"#;

        let memories = aspect.memories_from_response(&ctx, response);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].memory_type, "fact");
        assert_eq!(memories[0].importance, 0.9);
        assert_eq!(memories[0].keywords, vec!["firmware", "engineer"]);
        assert!(!memories[0].context.is_empty());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let ctx = ctx();
        let aspect = &ASPECTS[1];
        let memories =
            aspect.memories_from_response(&ctx, r#"[{"preference": "likes terse answers"}]"#);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].importance, 0.6);
        assert_eq!(memories[0].keywords, vec!["general"]);
    }
}
