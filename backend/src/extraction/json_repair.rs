//! Repair and recovery parsing for model-generated JSON. Small local models
//! produce fenced, truncated, or malformed arrays; this module recovers what
//! it can and returns nothing rather than failing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const END_TOKENS: [&str; 4] = ["<|eot_id|>", "<|end_of_text|>", "</s>", "<|im_end|>"];

static UNQUOTED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w+):"#).expect("regex"));
static DOUBLED_QUOTE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#""+(\w+)":"#).expect("regex"));
static TRAILING_COMMA_OBJ: Lazy<Regex> = Lazy::new(|| Regex::new(r#",\s*\}"#).expect("regex"));
static TRAILING_COMMA_ARR: Lazy<Regex> = Lazy::new(|| Regex::new(r#",\s*\]"#).expect("regex"));
static LINE_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{[^{}]*"[^"]*"\s*:[^{}]*\}"#).expect("regex"));

/// Strip model end tokens, markdown fences, and a stray leading "json".
pub fn clean_response(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for token in END_TOKENS {
        text = text.replace(token, "");
    }

    let mut text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    let text = text.trim();
    let text = text.strip_prefix("json").unwrap_or(text);
    text.trim().to_string()
}

/// Best-effort repair of a JSON fragment: trailing commas, unquoted keys,
/// single quotes, unbalanced brackets, junk after the closing bracket.
pub fn repair(fragment: &str) -> String {
    let mut text = fragment.to_string();

    // Single quotes first so the key-quoting pass sees double quotes.
    text = text.replace('\'', "\"");

    text = UNQUOTED_KEY.replace_all(&text, "\"$1\":").to_string();
    text = DOUBLED_QUOTE_KEY.replace_all(&text, "\"$1\":").to_string();

    text = TRAILING_COMMA_OBJ.replace_all(&text, "}").to_string();
    text = TRAILING_COMMA_ARR.replace_all(&text, "]").to_string();

    let open_braces = text.matches('{').count() as i64 - text.matches('}').count() as i64;
    for _ in 0..open_braces.max(0) {
        text.push('}');
    }
    let open_brackets = text.matches('[').count() as i64 - text.matches(']').count() as i64;
    for _ in 0..open_brackets.max(0) {
        text.push(']');
    }

    text
}

/// Parse a model response expected to be a JSON array of objects. Accepts a
/// bare object as a one-element array. Falls back to per-line and regex
/// object recovery, and finally to an empty list.
pub fn parse_array(raw: &str) -> Vec<Value> {
    let text = clean_response(raw);
    if text.is_empty() {
        return Vec::new();
    }

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return into_array(value);
    }

    // Isolate the outermost array and repair it.
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            let repaired = repair(&text[start..=end]);
            if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
                return into_array(value);
            }
        }
    }

    fallback_objects(&text)
}

/// Parse a response expected to be a single JSON object.
pub fn parse_object(raw: &str) -> Option<Value> {
    let text = clean_response(raw);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start >= end {
        return None;
    }
    let fragment = &text[start..=end];
    serde_json::from_str(fragment)
        .or_else(|_| serde_json::from_str(&repair(fragment)))
        .ok()
}

fn into_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}

/// Recovery pass over responses where the array itself is unsalvageable:
/// whole objects on single lines, then regex-isolated objects.
fn fallback_objects(text: &str) -> Vec<Value> {
    let mut objects = Vec::new();

    for line in text.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                objects.push(value);
            }
        }
    }
    if !objects.is_empty() {
        return objects;
    }

    for m in LINE_OBJECT.find_iter(text) {
        let fragment = m.as_str();
        if let Ok(value) =
            serde_json::from_str::<Value>(fragment).or_else(|_| serde_json::from_str(&repair(fragment)))
        {
            objects.push(value);
        }
    }

    objects
}

/// Streaming runaway detection for small-model output: repeated 50-char
/// windows, a 20-char pattern recurring through the text, hard caps on
/// length and chunk count, and junk piling up after a closed JSON array.
pub struct RunawayDetector {
    response: String,
    chunk_count: usize,
    last_window: String,
    repetition_count: usize,
    max_chunks: usize,
    max_length: usize,
    repetition_threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Continue,
    Stop,
}

impl RunawayDetector {
    pub fn new() -> Self {
        Self {
            response: String::new(),
            chunk_count: 0,
            last_window: String::new(),
            repetition_count: 0,
            max_chunks: 300,
            max_length: 5000,
            repetition_threshold: 2,
        }
    }

    pub fn text(&self) -> &str {
        &self.response
    }

    pub fn into_text(self) -> String {
        self.response
    }

    pub fn feed(&mut self, chunk: &str) -> FeedOutcome {
        self.response.push_str(chunk);
        self.chunk_count += 1;

        // Junk accumulating after a closed array means the model kept going.
        if chunk.contains(']') && self.response.len() > 50 {
            if let Some(bracket) = self.response.rfind(']') {
                if self.response[bracket + 1..].trim().len() > 100 {
                    self.response.truncate(bracket + 1);
                    return FeedOutcome::Stop;
                }
            }
        }

        if self.response.len() > 100 {
            let window: String = tail_chars(&self.response, 50);
            if window == self.last_window {
                self.repetition_count += 1;
                if self.repetition_count > self.repetition_threshold {
                    return FeedOutcome::Stop;
                }
            } else {
                self.repetition_count = 0;
                self.last_window = window;
            }
        }

        if self.response.len() > 200 {
            let pattern: String = tail_chars(&self.response, 20);
            if !pattern.trim().is_empty() && self.response.matches(&pattern).count() > 3 {
                return FeedOutcome::Stop;
            }
        }

        if self.response.len() > self.max_length || self.chunk_count > self.max_chunks {
            return FeedOutcome::Stop;
        }

        FeedOutcome::Continue
    }
}

impl Default for RunawayDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn tail_chars(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_array() {
        let items = parse_array(r#"[{"fact": "likes rust", "importance": 0.7}]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["fact"], "likes rust");
    }

    #[test]
    fn strips_markdown_fence_and_end_tokens() {
        let raw = "```json\n[{\"fact\": \"x\"}]\n```<|eot_id|>";
        let items = parse_array(raw);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn single_object_becomes_one_element_array() {
        let items = parse_array(r#"{"fact": "only one"}"#);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn repairs_trailing_commas() {
        let items = parse_array(r#"[{"fact": "a", "importance": 0.5,},]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["importance"], 0.5);
    }

    #[test]
    fn repairs_unquoted_keys_and_single_quotes() {
        let items = parse_array(r#"[{fact: 'likes tea', importance: 0.4}]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["fact"], "likes tea");
    }

    #[test]
    fn balances_missing_brackets() {
        let items = parse_array(r#"[{"fact": "cut off", "importance": 0.6}"#);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn recovers_objects_from_lines() {
        let raw = "noise before\n{\"fact\": \"a\"}\n{\"fact\": \"b\"}\ntrailing garbage";
        let items = parse_array(raw);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn recovers_objects_by_regex() {
        let raw = r#"The answer is {"fact": "inline"} and that is all."#;
        let items = parse_array(raw);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["fact"], "inline");
    }

    #[test]
    fn unparseable_garbage_yields_empty() {
        assert!(parse_array("complete nonsense with no structure").is_empty());
        assert!(parse_array("").is_empty());
    }

    #[test]
    fn parse_object_repairs() {
        let value = parse_object("```json\n{style: 'casual'}\n```").expect("object");
        assert_eq!(value["style"], "casual");
    }

    #[test]
    fn detector_stops_on_repeated_window() {
        let mut detector = RunawayDetector::new();
        let window = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN"; // 50 chars
        assert_eq!(detector.feed("prefix text that is long enough to matter here"), FeedOutcome::Continue);
        let mut stopped = false;
        for _ in 0..6 {
            if detector.feed(window) == FeedOutcome::Stop {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "repeated window should stop the stream");
    }

    #[test]
    fn detector_stops_on_length_cap() {
        let mut detector = RunawayDetector::new();
        let filler = "x".repeat(400);
        let mut stopped = false;
        for i in 0..20 {
            // Vary the chunk so repetition checks do not fire first.
            let chunk = format!("{filler}{i}");
            if detector.feed(&chunk) == FeedOutcome::Stop {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
    }

    #[test]
    fn detector_truncates_junk_after_closed_array() {
        let mut detector = RunawayDetector::new();
        detector.feed(r#"[{"fact": "real data goes here for the test"}]"#);
        let junk = format!("]{}", "junk after the array ".repeat(10));
        detector.feed(&junk);
        assert!(detector.text().ends_with(']'));
    }
}
