//! Ordinary tier: recent question/answer pairs.
//!
//! Entries are found through a keyword inverted index and ranked by
//! Jaccard similarity over keyword sets. When the index yields fewer than
//! three usable candidates the remaining entries are scanned as well.
//! Well-rated, frequently used entries graduate into the permanent tier.
//!
//! Reads go straight to the concurrent maps; compound mutations (save,
//! evict, sweep, promote) are serialized by a write lock so the map, the
//! index, and the snapshot file stay in step.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::OrdinaryConfig;
use crate::error::{Error, Result};
use crate::persistence::JsonSnapshot;
use crate::text;
use crate::tiers::permanent::{FactualEntry, NewFact, PermanentTier};

const RECENT_QA_FILE: &str = "recent_qa.json";

/// Ranked candidates below this count trigger a full scan.
const MIN_INDEXED_MATCHES: usize = 3;

/// Highest value on the rating scale.
pub const MAX_RATING: f64 = 5.0;

/// A cached question/answer pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQA {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub keywords: Vec<String>,
    /// Latest average on the 1-5 scale; 0 means not yet rated
    pub rating: f64,
    /// Sum of weighted ratings
    pub total_rating: f64,
    /// Sum of rating weights
    pub rating_weight: f64,
    pub rating_count: u64,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub promoted: bool,
    /// Streaming session the answer came from, if any
    pub session_id: Option<String>,
}

impl CachedQA {
    /// A fresh entry awaiting feedback (rating 0, one access).
    pub fn new(question: impl Into<String>, answer: impl Into<String>, now: DateTime<Utc>) -> Self {
        let question = question.into();
        Self {
            id: format!("qa_{}", Uuid::new_v4().simple()),
            keywords: text::extract_keywords(&question),
            question,
            answer: answer.into(),
            rating: 0.0,
            total_rating: 0.0,
            rating_weight: 0.0,
            rating_count: 0,
            access_count: 1,
            created_at: now,
            last_accessed_at: Some(now),
            promoted: false,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Weighted mean rating, or the raw rating when nothing was recorded
    pub fn average_rating(&self) -> f64 {
        if self.rating_weight <= 0.0 {
            self.rating
        } else {
            self.total_rating / self.rating_weight
        }
    }

    /// Average rating as a fraction of the maximum
    pub fn rating_ratio(&self) -> f64 {
        (self.average_rating() / MAX_RATING).clamp(0.0, 1.0)
    }

    pub fn is_eligible_for_promotion(&self, min_access_count: u64, min_avg_rating: f64) -> bool {
        !self.promoted
            && self.access_count >= min_access_count
            && self.average_rating() >= min_avg_rating
    }

    pub fn is_expired(&self, retention_days: i64, now: DateTime<Utc>) -> bool {
        self.created_at + Duration::days(retention_days) < now
    }

    /// Eviction ordering key: last access, or creation if never accessed
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }

    fn apply_rating(&mut self, rating: f64, weight: f64) {
        self.total_rating += rating * weight;
        self.rating_weight += weight;
        self.rating_count += 1;
        self.rating = self.average_rating();
    }

    fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = Some(now);
    }

    fn keyword_set(&self) -> HashSet<String> {
        self.keywords.iter().map(|k| k.to_lowercase()).collect()
    }
}

/// One ranked candidate
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub entry: CachedQA,
    pub similarity: f64,
}

/// Outcome of an ordinary tier lookup
///
/// `direct_usable` and `as_reference` are exclusive: a match is reported
/// as a reference only when it falls short of direct use.
#[derive(Debug, Clone, Default)]
pub struct OrdinaryQueryResult {
    /// Ranked matches, best first
    pub matches: Vec<SimilarMatch>,
    pub direct_usable: bool,
    pub as_reference: bool,
}

impl OrdinaryQueryResult {
    pub fn found(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn best(&self) -> Option<&SimilarMatch> {
        self.matches.first()
    }

    pub fn similarity(&self) -> f64 {
        self.best().map(|m| m.similarity).unwrap_or(0.0)
    }
}

/// What `save` did with a question/answer pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Folded into an existing near-duplicate
    Merged(String),
    Inserted(String),
}

impl SaveOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Merged(id) | Self::Inserted(id) => id,
        }
    }
}

/// Ordinary tier statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrdinaryStats {
    pub total: usize,
    pub promoted: usize,
    pub rated: usize,
    pub average_rating: f64,
    pub total_accesses: u64,
}

/// Medium-confidence store of recent answers
pub struct OrdinaryTier {
    config: OrdinaryConfig,
    clock: SharedClock,
    entries: DashMap<String, CachedQA>,
    keyword_index: DashMap<String, HashSet<String>>,
    snapshot: JsonSnapshot<CachedQA>,
    write_lock: Mutex<()>,
}

impl OrdinaryTier {
    /// Load the tier from its storage directory.
    pub fn open(config: OrdinaryConfig, clock: SharedClock) -> Self {
        let snapshot = JsonSnapshot::in_dir(&config.storage_path, RECENT_QA_FILE);
        let tier = Self {
            config,
            clock,
            entries: DashMap::new(),
            keyword_index: DashMap::new(),
            snapshot,
            write_lock: Mutex::new(()),
        };
        for entry in tier.snapshot.load_or_empty() {
            tier.index(&entry.id, &entry.keywords);
            tier.entries.insert(entry.id.clone(), entry);
        }
        info!(entries = tier.entries.len(), "Ordinary tier ready");
        tier
    }

    pub fn config(&self) -> &OrdinaryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────

    /// Rank cached answers for a question and record an access on the best.
    pub fn query(&self, question: &str) -> OrdinaryQueryResult {
        let mut matches = self.rank(question);
        let Some(best) = matches.first_mut() else {
            return OrdinaryQueryResult::default();
        };

        if let Some(touched) = self.touch(&best.entry.id) {
            best.entry = touched;
        }
        let similarity = best.similarity;
        let direct_usable = similarity >= self.config.similarity_threshold;
        let as_reference = !direct_usable && similarity >= self.config.reference_threshold;
        debug!(
            qa_id = %best.entry.id,
            similarity,
            direct_usable,
            as_reference,
            "Ordinary tier match"
        );

        OrdinaryQueryResult {
            matches,
            direct_usable,
            as_reference,
        }
    }

    /// Best match at or above `min_similarity`, recording an access.
    pub fn find_similar(&self, question: &str, min_similarity: f64) -> Option<SimilarMatch> {
        let mut best = self.rank(question).into_iter().next()?;
        if best.similarity < min_similarity {
            return None;
        }
        if let Some(touched) = self.touch(&best.entry.id) {
            best.entry = touched;
        }
        Some(best)
    }

    /// Matches usable as reference material, without recording access.
    pub fn references(&self, question: &str) -> Vec<SimilarMatch> {
        let mut matches = self.rank(question);
        matches.retain(|m| m.similarity >= self.config.reference_threshold);
        matches
    }

    fn touch(&self, id: &str) -> Option<CachedQA> {
        let now = self.clock.now();
        self.entries.get_mut(id).map(|mut entry| {
            entry.record_access(now);
            entry.clone()
        })
    }

    fn rank(&self, question: &str) -> Vec<SimilarMatch> {
        let normalized = text::normalize(question);
        let query_keywords: HashSet<String> = text::extract_keywords(&normalized).into_iter().collect();
        let threshold = self.config.min_candidate_similarity;

        let mut candidate_ids: HashSet<String> = HashSet::new();
        for keyword in &query_keywords {
            if let Some(ids) = self.keyword_index.get(keyword) {
                candidate_ids.extend(ids.iter().cloned());
            }
        }

        let score = |entry: &CachedQA| -> Option<f64> {
            if entry.promoted {
                return None;
            }
            let similarity = text::question_similarity(
                &normalized,
                &query_keywords,
                &entry.question,
                &entry.keyword_set(),
            );
            (similarity >= threshold).then_some(similarity)
        };

        let mut matches: Vec<SimilarMatch> = candidate_ids
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                score(entry.value()).map(|similarity| SimilarMatch {
                    entry: entry.clone(),
                    similarity,
                })
            })
            .collect();

        if matches.len() < MIN_INDEXED_MATCHES {
            for entry in self.entries.iter() {
                if candidate_ids.contains(entry.key()) {
                    continue;
                }
                if let Some(similarity) = score(entry.value()) {
                    matches.push(SimilarMatch {
                        entry: entry.value().clone(),
                        similarity,
                    });
                }
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.entry.average_rating().total_cmp(&a.entry.average_rating()))
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        matches.truncate(self.config.max_results);
        matches
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────

    /// Save an answer, merging into a near-duplicate when one exists.
    ///
    /// `rating` is on the 1-5 scale; 0 saves the answer unrated.
    pub fn save(&self, question: &str, answer: &str, rating: u8) -> SaveOutcome {
        let rating = f64::from(rating).min(MAX_RATING);
        let _guard = self.lock();

        let existing = self.query(question);
        if let Some(best) = existing.best() {
            if best.similarity > self.config.merge_similarity {
                let id = best.entry.id.clone();
                if rating > 0.0 {
                    if let Some(mut entry) = self.entries.get_mut(&id) {
                        entry.apply_rating(rating, 1.0);
                    }
                }
                self.persist();
                debug!(qa_id = %id, similarity = best.similarity, "Merged into existing answer");
                return SaveOutcome::Merged(id);
            }
        }

        let mut entry = CachedQA::new(question, answer, self.clock.now());
        if rating > 0.0 {
            entry.apply_rating(rating, 1.0);
        }
        let id = entry.id.clone();
        self.index(&id, &entry.keywords);
        self.entries.insert(id.clone(), entry);
        self.enforce_max_entries();
        self.persist();
        info!(qa_id = %id, rating, "Saved answer to ordinary tier");
        SaveOutcome::Inserted(id)
    }

    /// Insert or replace an entry by id.
    pub fn insert(&self, mut entry: CachedQA) {
        if entry.keywords.is_empty() {
            entry.keywords = text::extract_keywords(&entry.question);
        }
        let _guard = self.lock();
        if let Some((_, previous)) = self.entries.remove(&entry.id) {
            self.unindex(&previous.id, &previous.keywords);
        }
        self.index(&entry.id, &entry.keywords);
        debug!(qa_id = %entry.id, "Stored answer");
        self.entries.insert(entry.id.clone(), entry);
        self.enforce_max_entries();
        self.persist();
    }

    /// Add a weighted rating (1-5 scale) to an entry.
    pub fn record_rating(&self, id: &str, rating: f64, weight: f64) -> Result<CachedQA> {
        let _guard = self.lock();
        let updated = {
            let mut entry = self
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::not_found("CachedQA", id))?;
            entry.apply_rating(rating.clamp(0.0, MAX_RATING), weight.max(0.0));
            entry.clone()
        };
        self.persist();
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Option<CachedQA> {
        let _guard = self.lock();
        let (_, entry) = self.entries.remove(id)?;
        self.unindex(&entry.id, &entry.keywords);
        self.persist();
        Some(entry)
    }

    /// Evict least-recently-touched entries until within capacity.
    /// Caller holds the write lock.
    fn enforce_max_entries(&self) {
        let excess = self.entries.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|e| (e.last_touched(), e.key().clone()))
            .collect();
        by_age.sort();

        for (_, id) in by_age.into_iter().take(excess) {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.unindex(&entry.id, &entry.keywords);
                info!(qa_id = %id, "Evicted least recently used answer");
            }
        }
    }

    /// Remove entries past retention or already promoted.
    pub fn cleanup_expired(&self) -> usize {
        let _guard = self.lock();
        let now = self.clock.now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.promoted || e.is_expired(self.config.retention_days, now))
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            if let Some((_, entry)) = self.entries.remove(id) {
                self.unindex(&entry.id, &entry.keywords);
            }
        }
        if !stale.is_empty() {
            self.persist();
            info!(removed = stale.len(), "Ordinary tier retention sweep");
        }
        stale.len()
    }

    /// Promote every eligible entry into the permanent tier.
    ///
    /// Each entry is promoted at most once: the `promoted` flag is set
    /// under the entry lock before the fact is created.
    pub fn check_and_promote(&self, permanent: &PermanentTier) -> Vec<FactualEntry> {
        let min_access = permanent.config().promotion_min_access_count;
        let min_rating = permanent.config().promotion_min_avg_rating;

        let _guard = self.lock();
        let eligible: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_eligible_for_promotion(min_access, min_rating))
            .map(|e| e.key().clone())
            .collect();

        let mut promoted = Vec::new();
        let mut changed = false;
        for id in eligible {
            let claimed = self.entries.get_mut(&id).and_then(|mut entry| {
                if !entry.is_eligible_for_promotion(min_access, min_rating) {
                    return None;
                }
                entry.promoted = true;
                Some(entry.clone())
            });
            let Some(entry) = claimed else { continue };
            changed = true;

            let source = format!("ordinary:{}", entry.id);
            if permanent.has_source(&source) {
                debug!(qa_id = %entry.id, "Already promoted in a previous run");
                continue;
            }

            let fact = NewFact {
                question_pattern: Some(text::loose_pattern(&entry.question)),
                keywords: entry.keywords.clone(),
                answer: entry.answer.clone(),
                source,
                confidence: entry.rating_ratio(),
            };
            match permanent.save_fact(fact) {
                Ok(fact) => {
                    info!(
                        qa_id = %entry.id,
                        fact_id = %fact.id,
                        access_count = entry.access_count,
                        average_rating = entry.average_rating(),
                        "Promoted answer to permanent tier"
                    );
                    promoted.push(fact);
                }
                Err(e) => {
                    error!(qa_id = %entry.id, error = %e, "Promotion failed");
                    if let Some(mut entry) = self.entries.get_mut(&id) {
                        entry.promoted = false;
                    }
                }
            }
        }

        if changed {
            self.persist();
        }
        promoted
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<CachedQA> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Vec<CachedQA> {
        let mut entries: Vec<CachedQA> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    /// Ids currently indexed under a keyword.
    pub fn ids_for_keyword(&self, keyword: &str) -> HashSet<String> {
        self.keyword_index
            .get(&keyword.to_lowercase())
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> OrdinaryStats {
        let mut stats = OrdinaryStats::default();
        let mut rating_sum = 0.0;
        for entry in self.entries.iter() {
            stats.total += 1;
            stats.total_accesses += entry.access_count;
            if entry.promoted {
                stats.promoted += 1;
            }
            if entry.average_rating() > 0.0 {
                stats.rated += 1;
                rating_sum += entry.average_rating();
            }
        }
        if stats.rated > 0 {
            stats.average_rating = rating_sum / stats.rated as f64;
        }
        stats
    }

    /// Write the snapshot, returning any failure.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock();
        self.snapshot.write(&self.entries())
    }

    fn persist(&self) {
        self.snapshot.write_or_log(&self.entries());
    }

    fn index(&self, id: &str, keywords: &[String]) {
        for keyword in keywords {
            self.keyword_index
                .entry(keyword.to_lowercase())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn unindex(&self, id: &str, keywords: &[String]) {
        for keyword in keywords {
            let key = keyword.to_lowercase();
            if let Some(mut ids) = self.keyword_index.get_mut(&key) {
                ids.remove(id);
            }
            self.keyword_index.remove_if(&key, |_, ids| ids.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::PermanentConfig;
    use tempfile::{TempDir, tempdir};

    fn tier(dir: &TempDir, clock: &ManualClock) -> OrdinaryTier {
        tier_with(dir, clock, |_| {})
    }

    fn tier_with(
        dir: &TempDir,
        clock: &ManualClock,
        adjust: impl FnOnce(&mut OrdinaryConfig),
    ) -> OrdinaryTier {
        let mut config = OrdinaryConfig {
            storage_path: dir.path().join("ordinary"),
            ..OrdinaryConfig::default()
        };
        adjust(&mut config);
        OrdinaryTier::open(config, clock.shared())
    }

    fn permanent(dir: &TempDir, clock: &ManualClock, min_access: u64, min_rating: f64) -> PermanentTier {
        let config = PermanentConfig {
            storage_path: dir.path().join("permanent"),
            promotion_min_access_count: min_access,
            promotion_min_avg_rating: min_rating,
            seed_builtins: false,
            ..PermanentConfig::default()
        };
        PermanentTier::open(config, clock.shared())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_exact_question_is_direct_usable() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        tier.save("How do I configure tracing subscriber", "Use EnvFilter", 5);

        let result = tier.query("how do I configure tracing subscriber");
        assert!(result.found());
        assert_eq!(result.similarity(), 1.0);
        assert!(result.direct_usable);
        assert!(!result.as_reference);
        assert_eq!(result.best().unwrap().entry.access_count, 2);
    }

    #[test]
    fn test_partial_overlap_is_reference_only() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        tier.save("configure tracing subscriber filter levels", "answer", 4);

        // 4 shared of 5 distinct keywords
        let result = tier.query("configure tracing subscriber filter");
        assert!((result.similarity() - 0.8).abs() < 1e-9);
        assert!(!result.direct_usable);
        assert!(result.as_reference);
    }

    #[test]
    fn test_unrelated_question_misses() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        tier.save("configure tracing subscriber", "answer", 4);

        let result = tier.query("bake sourdough bread");
        assert!(!result.found());
        assert!(tier.find_similar("bake sourdough bread", 0.1).is_none());
    }

    #[test]
    fn test_query_skips_promoted_entries() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        let mut entry = CachedQA::new("tokio select macro", "answer", clock.now());
        entry.promoted = true;
        tier.insert(entry);

        assert!(!tier.query("tokio select macro").found());
    }

    #[test]
    fn test_results_ranked_and_capped() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        for i in 0..8 {
            tier.insert(CachedQA::new(format!("tokio runtime worker threads v{i}"), "a", clock.now()));
        }
        tier.insert(CachedQA::new("tokio runtime worker threads", "exact", clock.now()));

        let result = tier.query("tokio runtime worker threads");
        assert_eq!(result.matches.len(), 5);
        assert_eq!(result.best().unwrap().entry.answer, "exact");
        assert!(result.matches.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Save / merge / index
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_near_duplicate_save_merges() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);

        let first = tier.save("What is the borrow checker", "It enforces ownership", 3);
        let second = tier.save("what is the borrow checker?", "Different wording", 5);

        assert_eq!(second, SaveOutcome::Merged(first.id().to_string()));
        assert_eq!(tier.len(), 1);
        let entry = tier.get(first.id()).unwrap();
        assert_eq!(entry.rating_count, 2);
        assert_eq!(entry.average_rating(), 4.0);
        assert_eq!(entry.answer, "It enforces ownership");
    }

    #[test]
    fn test_distinct_save_inserts() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);

        tier.save("explain rust lifetimes", "a", 4);
        let outcome = tier.save("explain rust traits", "b", 4);
        assert!(matches!(outcome, SaveOutcome::Inserted(_)));
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_insert_same_id_updates_in_place_and_reindexes() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);

        let entry = CachedQA::new("docker compose volumes", "a", clock.now());
        let id = entry.id.clone();
        tier.insert(entry.clone());
        assert!(tier.ids_for_keyword("volumes").contains(&id));

        let mut updated = entry;
        updated.question = "kubernetes persistent claims".into();
        updated.keywords = text::extract_keywords(&updated.question);
        tier.insert(updated);

        assert_eq!(tier.len(), 1);
        assert!(tier.ids_for_keyword("volumes").is_empty());
        assert!(tier.ids_for_keyword("docker").is_empty());
        assert!(tier.ids_for_keyword("kubernetes").contains(&id));
        assert_eq!(tier.get(&id).unwrap().question, "kubernetes persistent claims");
    }

    #[test]
    fn test_weighted_rating() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        let id = tier.save("what is a future", "lazy computation", 0).id().to_string();

        tier.record_rating(&id, 5.0, 1.5).unwrap();
        let entry = tier.record_rating(&id, 2.0, 0.5).unwrap();
        assert!((entry.average_rating() - 4.25).abs() < 1e-9);
        assert_eq!(entry.rating_count, 2);

        assert!(tier.record_rating("missing", 5.0, 1.0).unwrap_err().is_not_found());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Capacity and retention
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_capacity_evicts_least_recently_accessed() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier_with(&dir, &clock, |c| c.max_entries = 2);

        let a = tier.save("alpha question about sockets", "a", 4).id().to_string();
        clock.advance(Duration::seconds(1));
        let b = tier.save("bravo question about threads", "b", 4).id().to_string();
        clock.advance(Duration::seconds(1));

        // Touch alpha so bravo becomes the least recently accessed.
        tier.query("alpha question about sockets");
        clock.advance(Duration::seconds(1));
        let c = tier.save("charlie question about channels", "c", 4).id().to_string();

        assert_eq!(tier.len(), 2);
        assert!(tier.get(&a).is_some());
        assert!(tier.get(&b).is_none());
        assert!(tier.get(&c).is_some());
        assert!(tier.ids_for_keyword("bravo").is_empty());
    }

    #[test]
    fn test_never_accessed_falls_back_to_created_at() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier_with(&dir, &clock, |c| c.max_entries = 1);

        let mut old = CachedQA::new("old question here", "a", clock.now());
        old.last_accessed_at = None;
        tier.insert(old.clone());
        clock.advance(Duration::seconds(5));
        tier.insert(CachedQA::new("new question here", "b", clock.now()));

        assert!(tier.get(&old.id).is_none());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_cleanup_removes_expired_and_promoted() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);

        let old = tier.save("ancient question", "a", 4).id().to_string();
        clock.advance(Duration::days(31));
        let fresh = tier.save("fresh question", "b", 4).id().to_string();
        let mut promoted = CachedQA::new("promoted question", "c", clock.now());
        promoted.promoted = true;
        tier.insert(promoted);

        assert_eq!(tier.cleanup_expired(), 2);
        assert!(tier.get(&old).is_none());
        assert!(tier.get(&fresh).is_some());
        assert!(tier.ids_for_keyword("ancient").is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Promotion
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_promotion_creates_one_fact_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        let permanent = permanent(&dir, &clock, 10, 4.0);

        let mut entry = CachedQA::new("How do I pin a future?", "Use Box::pin or pin!", clock.now());
        entry.rating = 5.0;
        entry.access_count = 11;
        let id = entry.id.clone();
        tier.insert(entry);

        let facts = tier.check_and_promote(&permanent);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].confidence, 1.0);
        assert_eq!(facts[0].source, format!("ordinary:{id}"));
        assert!(tier.get(&id).unwrap().promoted);

        assert!(tier.check_and_promote(&permanent).is_empty());
        assert_eq!(permanent.stats().facts, 1);

        // The promoted fact now answers the original question.
        assert!(permanent.query("how do i pin a future?").direct_answer);
    }

    #[test]
    fn test_promotion_thresholds() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        let permanent = permanent(&dir, &clock, 10, 4.5);

        let mut low_rating = CachedQA::new("question one", "a", clock.now());
        low_rating.rating = 4.0;
        low_rating.access_count = 50;
        let mut low_access = CachedQA::new("question two", "b", clock.now());
        low_access.rating = 5.0;
        low_access.access_count = 9;
        tier.insert(low_rating);
        tier.insert(low_access);

        assert!(tier.check_and_promote(&permanent).is_empty());
    }

    #[test]
    fn test_promotion_skips_when_fact_already_exists() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let tier = tier(&dir, &clock);
        let permanent = permanent(&dir, &clock, 1, 1.0);

        let mut entry = CachedQA::new("restart safe promotion", "a", clock.now());
        entry.rating = 5.0;
        permanent
            .save_fact(NewFact {
                answer: "a".into(),
                source: format!("ordinary:{}", entry.id),
                confidence: 1.0,
                ..Default::default()
            })
            .unwrap();
        let id = entry.id.clone();
        tier.insert(entry);

        assert!(tier.check_and_promote(&permanent).is_empty());
        assert!(tier.get(&id).unwrap().promoted);
        assert_eq!(permanent.stats().facts, 1);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_snapshot_reload() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let id = {
            let tier = tier(&dir, &clock);
            tier.save("persist me please", "ok", 5).id().to_string()
        };
        assert!(dir.path().join("ordinary").join(RECENT_QA_FILE).exists());

        let tier = tier(&dir, &clock);
        assert_eq!(tier.get(&id).unwrap().answer, "ok");
        assert!(tier.ids_for_keyword("persist").contains(&id));
    }
}
