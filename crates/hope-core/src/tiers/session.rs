//! Session cache: per-conversation context.
//!
//! Holds recent turns, the detected topic, and terms the user defined
//! during the conversation. Contexts live in a [`BoundedCache`] bounded by
//! `max_sessions` and expire after `session_timeout_minutes` without
//! access; they are never deleted explicitly except by `clear_session`.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{BoundedCache, EvictionCause, EvictionHook, TtlLruCache};
use crate::clock::SharedClock;
use crate::config::SessionCacheConfig;
use crate::text;

/// Checked in order; the first keyword present becomes the topic.
const TOPIC_KEYWORDS: &[&str] = &[
    "RAG", "检索", "索引", "向量", "LLM", "大模型", "AI", "人工智能", "Spring", "Java",
    "Python", "代码", "配置", "部署", "API", "文档", "知识库", "问答", "搜索", "查询",
    "Rust", "Docker", "Kubernetes",
];

const PRONOUNS: &[&str] = &[
    "it", "this", "that", "these", "those", "they", "them", "above", "earlier", "previous",
    "这", "那", "它", "上面", "刚才", "之前",
];

/// "X refers to Y"-style statements, tried in order; only the first
/// pattern that matches is used.
static DEFINITION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(.+?)\s+refers\s+to\s+(.+)$",
        r"(?i)^(.+?)\s+is\s+defined\s+as\s+(.+)$",
        r"(?i)^(.+?)\s+means\s+(.+)$",
        r"(?i)^(.+?)\s+stands\s+for\s+(.+)$",
        r"(.+?)\s*是指\s*(.+)",
        r"(.+?)\s*指的是\s*(.+)",
        r"(.+?)\s*定义为\s*(.+)",
        r"(.+?)\s*就是\s*(.+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("definition pattern is valid"))
    .collect()
});

const SUMMARY_TURNS: usize = 5;
const SUMMARY_TURN_CHARS: usize = 200;

/// Who spoke a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A term the user defined during the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempDefinition {
    pub term: String,
    pub definition: String,
    pub defined_at: DateTime<Utc>,
}

/// Context of one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub history: Vec<Turn>,
    pub temp_definitions: Vec<TempDefinition>,
    pub current_topic: Option<String>,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_active_at: now,
            history: Vec::new(),
            temp_definitions: Vec::new(),
            current_topic: None,
        }
    }

    /// Number of completed question/answer exchanges
    pub fn turn_count(&self) -> usize {
        self.history.len() / 2
    }

    /// The last `n` history entries
    pub fn recent(&self, n: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    pub fn definition(&self, term: &str) -> Option<&str> {
        self.temp_definitions
            .iter()
            .find(|d| d.term.eq_ignore_ascii_case(term))
            .map(|d| d.definition.as_str())
    }

    /// Add or replace a definition.
    pub fn define(&mut self, term: &str, definition: &str, now: DateTime<Utc>) {
        self.temp_definitions.retain(|d| !d.term.eq_ignore_ascii_case(term));
        self.temp_definitions.push(TempDefinition {
            term: term.to_string(),
            definition: definition.to_string(),
            defined_at: now,
        });
    }

    /// Topic, definitions, and the last few turns as prompt context.
    /// Empty when there is no history.
    pub fn summary(&self) -> String {
        if self.history.is_empty() {
            return String::new();
        }

        let mut summary = String::new();
        if let Some(topic) = &self.current_topic {
            summary.push_str(&format!("Current topic: {topic}\n\n"));
        }
        if !self.temp_definitions.is_empty() {
            summary.push_str("Session definitions:\n");
            for def in &self.temp_definitions {
                summary.push_str(&format!("- {}: {}\n", def.term, def.definition));
            }
            summary.push('\n');
        }
        summary.push_str("Recent conversation:\n");
        for turn in self.recent(SUMMARY_TURNS) {
            summary.push_str(&format!(
                "{}: {}\n",
                turn.speaker.label(),
                text::truncate_chars(&turn.content, SUMMARY_TURN_CHARS)
            ));
        }
        summary
    }
}

/// What the session cache knows that is relevant to a question
#[derive(Debug, Clone, Default)]
pub struct SessionQueryResult {
    /// A live context exists for the session
    pub found: bool,
    /// "term: definition" lines for terms mentioned in the question
    pub relevant_definitions: Vec<String>,
    pub conversation_summary: Option<String>,
    pub topic_continuation: bool,
    pub current_topic: Option<String>,
}

impl SessionQueryResult {
    pub fn has_relevant_context(&self) -> bool {
        !self.relevant_definitions.is_empty() || self.conversation_summary.is_some()
    }
}

/// Session cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCacheStats {
    pub active_sessions: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

/// Bounded, expiring store of conversation contexts
pub struct SessionCache<C = TtlLruCache<String, ConversationContext>> {
    config: SessionCacheConfig,
    clock: SharedClock,
    cache: C,
}

impl SessionCache {
    /// Session cache backed by the default TTL+LRU cache.
    pub fn new(config: SessionCacheConfig, clock: SharedClock) -> Self {
        let hook: EvictionHook<String, ConversationContext> =
            Arc::new(|id: &String, _: &ConversationContext, cause: EvictionCause| {
                debug!(session_id = %id, ?cause, "Conversation context evicted");
            });
        let cache = TtlLruCache::new(
            config.max_sessions,
            Duration::minutes(config.session_timeout_minutes),
            clock.clone(),
        )
        .with_eviction_hook(hook);
        Self::with_cache(config, clock, cache)
    }
}

impl<C> SessionCache<C>
where
    C: BoundedCache<String, ConversationContext>,
{
    pub fn with_cache(config: SessionCacheConfig, clock: SharedClock, cache: C) -> Self {
        Self {
            config,
            clock,
            cache,
        }
    }

    /// Fetch a context, creating it on first use.
    pub fn get_or_create(&self, session_id: &str) -> ConversationContext {
        let now = self.clock.now();
        self.cache.get_or_insert_with(session_id.to_string(), || {
            debug!(session_id = %session_id, "Conversation context created");
            ConversationContext::new(session_id, now)
        })
    }

    pub fn get(&self, session_id: &str) -> Option<ConversationContext> {
        self.cache.get(&session_id.to_string())
    }

    /// Record a question/answer turn, refreshing topic and definitions.
    pub fn update_context(&self, session_id: &str, question: &str, answer: &str) -> ConversationContext {
        let now = self.clock.now();
        let max_entries = self.config.max_history_per_session * 2;
        self.cache.upsert_with(
            session_id.to_string(),
            || ConversationContext::new(session_id, now),
            |context| {
                context.history.push(Turn {
                    speaker: Speaker::User,
                    content: question.to_string(),
                    at: now,
                });
                context.history.push(Turn {
                    speaker: Speaker::Assistant,
                    content: answer.to_string(),
                    at: now,
                });
                if context.history.len() > max_entries {
                    let excess = context.history.len() - max_entries;
                    context.history.drain(..excess);
                }

                if let Some(topic) = detect_topic(question) {
                    context.current_topic = Some(topic);
                }
                if let Some((term, definition)) = extract_definition(question) {
                    debug!(session_id = %session_id, term = %term, "Captured session definition");
                    context.define(&term, &definition, now);
                }
                context.last_active_at = now;
                debug!(session_id = %session_id, turns = context.turn_count(), "Conversation updated");
                context.clone()
            },
        )
    }

    /// Definitions, summary, and topic continuation for a question.
    pub fn query(&self, session_id: &str, question: &str) -> SessionQueryResult {
        let mut result = SessionQueryResult::default();
        if session_id.is_empty() {
            return result;
        }
        let Some(context) = self.get(session_id) else {
            return result;
        };
        result.found = true;

        let lowered = question.to_lowercase();
        result.relevant_definitions = context
            .temp_definitions
            .iter()
            .filter(|d| lowered.contains(&d.term.to_lowercase()))
            .map(|d| format!("{}: {}", d.term, d.definition))
            .collect();

        let summary = context.summary();
        if !summary.is_empty() {
            result.conversation_summary = Some(summary);
        }

        if is_topic_continuation(context.current_topic.as_deref(), question) {
            result.topic_continuation = true;
            result.current_topic = context.current_topic.clone();
        }
        result
    }

    pub fn add_temp_definition(&self, session_id: &str, term: &str, definition: &str) {
        let now = self.clock.now();
        self.cache.upsert_with(
            session_id.to_string(),
            || ConversationContext::new(session_id, now),
            |context| context.define(term, definition, now),
        );
        debug!(session_id = %session_id, term = %term, "Definition added");
    }

    pub fn clear_session(&self, session_id: &str) -> bool {
        let removed = self.cache.invalidate(&session_id.to_string());
        debug!(session_id = %session_id, removed, "Session cleared");
        removed
    }

    /// Drop expired contexts.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn stats(&self) -> SessionCacheStats {
        let stats = self.cache.stats();
        SessionCacheStats {
            active_sessions: stats.size,
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            evictions: stats.evictions,
        }
    }
}

fn contains_word(lowered: &str, word: &str) -> bool {
    if word.is_ascii() {
        text::words(lowered).any(|w| w == word)
    } else {
        lowered.contains(word)
    }
}

/// First fixed topic keyword present, else the longest word of two or
/// more characters.
pub fn detect_topic(question: &str) -> Option<String> {
    let lowered = question.to_lowercase();
    if let Some(keyword) = TOPIC_KEYWORDS
        .iter()
        .find(|k| contains_word(&lowered, &k.to_lowercase()))
    {
        return Some(keyword.to_string());
    }

    let mut longest: Option<&str> = None;
    for word in text::words(question) {
        let len = word.chars().count();
        if len >= 2 && longest.is_none_or(|l| len > l.chars().count()) {
            longest = Some(word);
        }
    }
    longest.map(str::to_string)
}

/// Term and definition from the first definition pattern that matches.
pub fn extract_definition(question: &str) -> Option<(String, String)> {
    let trimmed = question.trim();
    let captures = DEFINITION_PATTERNS.iter().find_map(|re| re.captures(trimmed))?;

    let term = captures.get(1)?.as_str().trim();
    let definition = captures
        .get(2)?
        .as_str()
        .trim()
        .trim_end_matches(['.', '!', '?', '。', '！', '？']);
    let term_len = term.chars().count();
    if (2..=20).contains(&term_len) && definition.chars().count() >= 2 {
        Some((term.to_string(), definition.to_string()))
    } else {
        None
    }
}

fn is_topic_continuation(topic: Option<&str>, question: &str) -> bool {
    let Some(topic) = topic else {
        return false;
    };
    let lowered = question.to_lowercase();
    if PRONOUNS.iter().any(|p| contains_word(&lowered, p)) {
        return true;
    }
    topic
        .to_lowercase()
        .split_whitespace()
        .any(|word| word.chars().count() >= 2 && lowered.contains(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn cache(clock: &ManualClock) -> SessionCache {
        SessionCache::new(SessionCacheConfig::default(), clock.shared())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Context updates
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_update_context_appends_turns() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);

        let context = cache.update_context("s1", "How does Docker networking work?", "Bridges.");
        assert_eq!(context.turn_count(), 1);
        assert_eq!(context.history[0].speaker, Speaker::User);
        assert_eq!(context.history[1].content, "Bridges.");
        assert_eq!(context.current_topic.as_deref(), Some("Docker"));
    }

    #[test]
    fn test_history_trimmed_to_max_turns() {
        let clock = ManualClock::starting_now();
        let config = SessionCacheConfig {
            max_history_per_session: 2,
            ..SessionCacheConfig::default()
        };
        let cache = SessionCache::new(config, clock.shared());

        for i in 0..5 {
            cache.update_context("s1", &format!("question {i}"), &format!("answer {i}"));
        }
        let context = cache.get("s1").unwrap();
        assert_eq!(context.history.len(), 4);
        assert_eq!(context.history[0].content, "question 3");
    }

    #[test]
    fn test_topic_detection() {
        // Fixed list wins, in list order.
        assert_eq!(detect_topic("Deploy the Rust API with Docker").as_deref(), Some("API"));
        assert_eq!(detect_topic("LLM 检索 pipeline").as_deref(), Some("检索"));
        assert_eq!(detect_topic("Ship it with Docker on Kubernetes").as_deref(), Some("Docker"));
        // Whole words only: "explain" does not contain the AI topic.
        assert_eq!(detect_topic("explain borrowing").as_deref(), Some("borrowing"));
        assert_eq!(detect_topic("a b").as_deref(), None);
    }

    #[test]
    fn test_definition_first_pattern_wins() {
        let (term, definition) = extract_definition("ctx refers to the request context.").unwrap();
        assert_eq!(term, "ctx");
        assert_eq!(definition, "the request context");

        // Both "refers to" and "means" would match; "refers to" is tried first.
        let (term, definition) = extract_definition("MVP refers to what the team means by v1").unwrap();
        assert_eq!(term, "MVP");
        assert_eq!(definition, "what the team means by v1");

        let (term, _) = extract_definition("向量库是指存储向量的数据库").unwrap();
        assert_eq!(term, "向量库");
    }

    #[test]
    fn test_definition_length_limits() {
        assert!(extract_definition("x refers to something").is_none());
        assert!(extract_definition("this is a very long term indeed friends refers to it all").is_none());
        assert!(extract_definition("how do I use tokio").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_query_returns_definitions_summary_and_continuation() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);
        cache.update_context("s1", "ctx refers to the request context", "Noted.");
        cache.update_context("s1", "How is Docker different from a VM?", "Containers share a kernel.");

        let result = cache.query("s1", "Where is ctx created in it?");
        assert!(result.found);
        assert_eq!(result.relevant_definitions, vec!["ctx: the request context"]);
        let summary = result.conversation_summary.unwrap();
        assert!(summary.contains("Current topic: Docker"));
        assert!(summary.contains("- ctx: the request context"));
        assert!(summary.contains("Assistant: Containers share a kernel."));
        assert!(result.topic_continuation);
        assert_eq!(result.current_topic.as_deref(), Some("Docker"));
    }

    #[test]
    fn test_query_unknown_session() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);

        let result = cache.query("nope", "anything");
        assert!(!result.found);
        assert!(!result.has_relevant_context());
        assert!(!cache.query("", "anything").found);
    }

    #[test]
    fn test_summary_truncates_long_turns() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);
        cache.update_context("s1", "question", &"x".repeat(500));

        let summary = cache.get("s1").unwrap().summary();
        assert!(summary.contains(&format!("{}...", "x".repeat(200))));
        assert!(!summary.contains(&"x".repeat(201)));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_context_expires_after_inactivity() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);
        cache.update_context("s1", "question", "answer");

        clock.advance(Duration::minutes(29));
        assert!(cache.get("s1").is_some());
        clock.advance(Duration::minutes(29));
        assert!(cache.get("s1").is_some(), "access refreshes the timeout");

        clock.advance(Duration::minutes(31));
        assert!(cache.get("s1").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_bound() {
        let clock = ManualClock::starting_now();
        let config = SessionCacheConfig {
            max_sessions: 2,
            ..SessionCacheConfig::default()
        };
        let cache = SessionCache::new(config, clock.shared());

        cache.get_or_create("a");
        cache.get_or_create("b");
        cache.get_or_create("c");
        assert_eq!(cache.stats().active_sessions, 2);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_manual_definition_and_clear() {
        let clock = ManualClock::starting_now();
        let cache = cache(&clock);

        cache.add_temp_definition("s1", "SLA", "service level agreement");
        cache.add_temp_definition("s1", "sla", "99.9 percent uptime");
        let context = cache.get_or_create("s1");
        assert_eq!(context.temp_definitions.len(), 1);
        assert_eq!(context.definition("SLA"), Some("99.9 percent uptime"));

        assert!(cache.clear_session("s1"));
        assert!(cache.get("s1").is_none());
    }
}
