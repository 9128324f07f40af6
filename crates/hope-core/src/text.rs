//! Text utilities: normalization, keyword extraction, similarity.
//!
//! Keyword sets drive both the Ordinary tier's inverted index and its
//! Jaccard similarity, so extraction must be deterministic for a given
//! input.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static WORD_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\s,.;:?!，。；：？！]+").expect("word split regex is valid")
});

static PATTERN_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s?？]+").expect("pattern split regex is valid"));

const STOP_WORDS: &[&str] = &[
    // English
    "a", "an", "the", "is", "are", "what", "how", "why", "which",
    // Chinese
    "的", "是", "在", "了", "和", "有", "我", "你", "这", "那", "什么", "怎么", "如何", "为什么",
    "哪", "吗", "呢", "啊",
];

/// Lowercase and trim a question for matching.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Split text into raw words on whitespace and punctuation (ASCII and CJK).
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    WORD_SPLIT.split(text).filter(|w| !w.is_empty())
}

/// Extract the keyword list of a text.
///
/// Lowercases, splits on whitespace/punctuation, and keeps tokens of at
/// least two characters that are not stop words. Order of first
/// occurrence is preserved and duplicates are dropped.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = HashSet::new();
    words(&lowered)
        .filter(|w| w.chars().count() >= 2 && !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

/// Jaccard index |A ∩ B| / |A ∪ B|. Empty input on either side scores 0.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Similarity between two questions.
///
/// An exact case-insensitive match scores 1.0; otherwise the Jaccard
/// index of the two keyword sets.
pub fn question_similarity(
    question_a: &str,
    keywords_a: &HashSet<String>,
    question_b: &str,
    keywords_b: &HashSet<String>,
) -> f64 {
    if question_a.trim().to_lowercase() == question_b.trim().to_lowercase() {
        return 1.0;
    }
    jaccard(keywords_a, keywords_b)
}

/// Build a loose full-match regex from a question.
///
/// "How do I use Docker?" becomes `.*how.*do.*i.*use.*docker.*`. Words are
/// escaped so user text never produces an invalid pattern.
pub fn loose_pattern(question: &str) -> String {
    let lowered = question.to_lowercase();
    let parts: Vec<String> = PATTERN_SPLIT
        .split(&lowered)
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if parts.is_empty() {
        return ".*".to_string();
    }
    format!(".*{}.*", parts.join(".*"))
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_extract_keywords_drops_stop_words_and_short_tokens() {
        let keywords = extract_keywords("What is the Docker container, and a VM?");
        assert_eq!(keywords, vec!["docker", "container", "and", "vm"]);
    }

    #[test]
    fn test_extract_keywords_dedupes() {
        let keywords = extract_keywords("rust rust RUST cargo");
        assert_eq!(keywords, vec!["rust", "cargo"]);
    }

    #[test]
    fn test_extract_keywords_cjk_punctuation() {
        let keywords = extract_keywords("向量检索，索引。");
        assert_eq!(keywords, vec!["向量检索", "索引"]);
    }

    #[test]
    fn test_jaccard_known_values() {
        assert_eq!(jaccard(&set(&["a1", "b1"]), &set(&["a1", "b1"])), 1.0);
        assert_eq!(jaccard(&set(&["a1"]), &set(&["b1"])), 0.0);
        assert!((jaccard(&set(&["a1", "b1", "c1"]), &set(&["a1", "b1"])) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&HashSet::new(), &set(&["a1"])), 0.0);
    }

    #[test]
    fn test_question_similarity_exact_match_ignores_case() {
        let empty = HashSet::new();
        assert_eq!(question_similarity("What is Docker", &empty, "what is docker ", &empty), 1.0);
    }

    #[test]
    fn test_loose_pattern_matches_original_question() {
        let pattern = loose_pattern("How do I use Docker?");
        assert_eq!(pattern, ".*how.*do.*i.*use.*docker.*");

        let re = Regex::new(&format!("^(?:{pattern})$")).unwrap();
        assert!(re.is_match("so how do i use docker compose?"));
    }

    #[test]
    fn test_loose_pattern_escapes_metacharacters() {
        let pattern = loose_pattern("what does (a+b)* mean");
        assert!(Regex::new(&pattern).is_ok());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello...");
        assert_eq!(truncate_chars("向量检索系统", 2), "向量...");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Similarity laws
    // ─────────────────────────────────────────────────────────────────────

    fn keyword_set() -> impl Strategy<Value = HashSet<String>> {
        prop::collection::hash_set("[a-z]{2,6}", 1..12)
    }

    proptest! {
        #[test]
        fn prop_jaccard_reflexive(a in keyword_set()) {
            prop_assert_eq!(jaccard(&a, &a), 1.0);
        }

        #[test]
        fn prop_jaccard_symmetric(a in keyword_set(), b in keyword_set()) {
            prop_assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        }

        #[test]
        fn prop_jaccard_bounded(a in keyword_set(), b in keyword_set()) {
            let score = jaccard(&a, &b);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn prop_jaccard_disjoint_is_zero(a in keyword_set()) {
            let b: HashSet<String> = a.iter().map(|w| format!("{w}_x")).collect();
            prop_assert_eq!(jaccard(&a, &b), 0.0);
        }
    }
}
