//! Regex fast path: cheap fact extraction from a single (user, assistant)
//! turn, run inline at the end of a chat turn. The deep aspect pipeline
//! covers everything this misses, later and off the interactive path.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::models::NewMemory;

const IMPORTANCE_HIGH: f64 = 0.8;
const IMPORTANCE_MEDIUM: f64 = 0.5;

struct PatternGroup {
    label: &'static str,
    category: &'static str,
    memory_type: &'static str,
    importance: f64,
    confidence: f64,
    patterns: &'static Lazy<Vec<Regex>>,
}

macro_rules! regex_set {
    ($name:ident, $($pattern:expr),+ $(,)?) => {
        static $name: Lazy<Vec<Regex>> = Lazy::new(|| {
            vec![$(Regex::new($pattern).expect("regex"),)+]
        });
    };
}

regex_set!(
    NAME_PATTERNS,
    r"my name is (\w+(?:\s+\w+)*)",
    r"call me (\w+(?:\s+\w+)*)",
);
regex_set!(
    OCCUPATION_PATTERNS,
    r"i work (?:as|at) ([\w\s]+)",
    r"my job is ([\w\s]+)",
    r"i do ([\w\s]+) for work",
);
regex_set!(
    LOCATION_PATTERNS,
    r"i live in ([\w\s,]+)",
    r"i'm from ([\w\s,]+)",
    r"i'm based in ([\w\s,]+)",
);
regex_set!(
    LIKES_PATTERNS,
    r"i like ([\w\s,]+)",
    r"i love ([\w\s,]+)",
    r"i enjoy ([\w\s,]+)",
    r"i'm interested in ([\w\s,]+)",
);
regex_set!(
    DISLIKES_PATTERNS,
    r"i don't like ([\w\s,]+)",
    r"i hate ([\w\s,]+)",
    r"i dislike ([\w\s,]+)",
);
regex_set!(
    GOAL_PATTERNS,
    r"i want to ([\w\s,]+)",
    r"my goal is to ([\w\s,]+)",
    r"i plan to ([\w\s,]+)",
    r"i hope to ([\w\s,]+)",
    r"i'm trying to ([\w\s,]+)",
);
regex_set!(
    SKILL_PATTERNS,
    r"i know how to ([\w\s,]+)",
    r"i'm good at ([\w\s,]+)",
    r"i'm skilled in ([\w\s,]+)",
    r"i have experience (?:with|in) ([\w\s,]+)",
);
regex_set!(
    REMEMBER_PATTERNS,
    r"remember (?:that )?([\w\s,]+)",
    r"don't forget (?:that )?([\w\s,]+)",
    r"keep in mind (?:that )?([\w\s,]+)",
);
regex_set!(
    PROJECT_PATTERNS,
    r"i(?: am|'m)? working on (?:my |a )?project (?:called |named )?([\w\s]+)",
    r"my project (?:is |called |named )?([\w\s]+)",
    r"i'm building (?:an? )?([\w\s]+)",
    r"i'm developing (?:an? )?([\w\s]+)",
);

static GROUPS: [PatternGroup; 9] = [
    PatternGroup {
        label: "User's name",
        category: "identity",
        memory_type: "fact",
        importance: IMPORTANCE_HIGH,
        confidence: 0.9,
        patterns: &NAME_PATTERNS,
    },
    PatternGroup {
        label: "User's occupation",
        category: "professional",
        memory_type: "fact",
        importance: IMPORTANCE_HIGH,
        confidence: 0.9,
        patterns: &OCCUPATION_PATTERNS,
    },
    PatternGroup {
        label: "User's location",
        category: "location",
        memory_type: "fact",
        importance: IMPORTANCE_HIGH,
        confidence: 0.9,
        patterns: &LOCATION_PATTERNS,
    },
    PatternGroup {
        label: "User likes",
        category: "preferences_likes",
        memory_type: "preference",
        importance: IMPORTANCE_MEDIUM,
        confidence: 0.8,
        patterns: &LIKES_PATTERNS,
    },
    PatternGroup {
        label: "User dislikes",
        category: "preferences_dislikes",
        memory_type: "preference",
        importance: IMPORTANCE_MEDIUM,
        confidence: 0.8,
        patterns: &DISLIKES_PATTERNS,
    },
    PatternGroup {
        label: "User goal",
        category: "goals",
        memory_type: "goal",
        importance: IMPORTANCE_MEDIUM,
        confidence: 0.7,
        patterns: &GOAL_PATTERNS,
    },
    PatternGroup {
        label: "User skill",
        category: "skills",
        memory_type: "skill",
        importance: IMPORTANCE_MEDIUM,
        confidence: 0.7,
        patterns: &SKILL_PATTERNS,
    },
    PatternGroup {
        label: "Explicit memory request",
        category: "explicit_memory",
        memory_type: "fact",
        importance: IMPORTANCE_HIGH + 0.1,
        confidence: 0.95,
        patterns: &REMEMBER_PATTERNS,
    },
    PatternGroup {
        label: "User project",
        category: "projects",
        memory_type: "goal",
        importance: IMPORTANCE_HIGH,
        confidence: 0.9,
        patterns: &PROJECT_PATTERNS,
    },
];

/// Scan one user message for storable facts. Returns at most the ten most
/// important candidates, each already carrying importance and confidence.
pub fn extract_important_facts(user_message: &str, user_id: &str) -> Vec<NewMemory> {
    let user_lower = user_message.to_lowercase();
    let mut facts: Vec<NewMemory> = Vec::new();

    for group in &GROUPS {
        for pattern in group.patterns.iter() {
            for captures in pattern.captures_iter(&user_lower) {
                let Some(matched) = captures.get(1) else { continue };
                let value = matched.as_str().trim().trim_end_matches([',', '.']);
                if value.len() < 3 {
                    continue;
                }

                let content = format!("{}: {}", group.label, value);
                let mut memory =
                    NewMemory::new(user_id, &content, group.memory_type, group.importance);
                memory.category = group.category.to_string();
                memory.confidence = group.confidence;
                memory.keywords = value
                    .split_whitespace()
                    .take(4)
                    .map(String::from)
                    .collect();
                facts.push(memory);
            }
        }
    }

    facts.retain(|fact| fact.content.len() > 10);
    facts.sort_by(|a, b| {
        (b.importance, b.confidence)
            .partial_cmp(&(a.importance, a.confidence))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    facts.truncate(10);
    facts
}
