//! KnowledgeManager: the tiers behind one facade.
//!
//! Owns the permanent tier, the ordinary tier and the session cache and
//! exposes the operations callers need: a full tiered query, learning
//! from answers, feedback, prompt construction and periodic maintenance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::clock::SharedClock;
use crate::config::HopeConfig;
use crate::error::Result;
use crate::feedback::{FeedbackWeigher, UserContext};
use crate::router::{DisabledRouter, FastPath, TierRouter};
use crate::tiers::{
    CachedQA, FactualEntry, OrdinaryStats, OrdinaryTier, PermanentStats, PermanentTier, SaveOutcome,
    SessionCache, SessionCacheStats, SkillTemplate,
};

/// Ratings at or above this are learned into the ordinary tier.
const LEARN_MIN_RATING: u8 = 4;

/// Where a smart query's answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Permanent,
    Ordinary,
    /// No cached answer; generation is needed
    Generation,
    /// The knowledge cache is turned off
    Disabled,
}

impl AnswerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Ordinary => "ordinary",
            Self::Generation => "generation",
            Self::Disabled => "disabled",
        }
    }
}

/// A previous answer offered to the generator as reference material
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceAnswer {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub similarity: f64,
    pub rating: f64,
}

/// Everything the tiers know about a question
#[derive(Debug, Clone, Serialize)]
pub struct SmartQueryResult {
    pub answer: Option<String>,
    pub source: AnswerSource,
    pub confidence: f64,
    pub needs_generation: bool,
    /// Session definitions and conversation summary
    pub contexts: Vec<String>,
    pub current_topic: Option<String>,
    #[serde(skip)]
    pub fact: Option<FactualEntry>,
    #[serde(skip)]
    pub skill_template: Option<SkillTemplate>,
    pub references: Vec<ReferenceAnswer>,
    pub elapsed_ms: u64,
}

impl SmartQueryResult {
    fn needs_generation(source: AnswerSource) -> Self {
        Self {
            answer: None,
            source,
            confidence: 0.0,
            needs_generation: true,
            contexts: Vec::new(),
            current_topic: None,
            fact: None,
            skill_template: None,
            references: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn best_reference(&self) -> Option<&ReferenceAnswer> {
        self.references
            .iter()
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
    }
}

/// How a question should be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStrategy {
    /// Serve the cached answer as is
    DirectAnswer,
    /// Generate with a skill template's prompt
    TemplateAnswer,
    /// Generate with similar past answers as references
    ReferenceAnswer,
    FullGeneration,
}

impl ResponseStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectAnswer => "direct_answer",
            Self::TemplateAnswer => "template_answer",
            Self::ReferenceAnswer => "reference_answer",
            Self::FullGeneration => "full_generation",
        }
    }

    pub fn requires_generation(&self) -> bool {
        !matches!(self, Self::DirectAnswer)
    }
}

impl std::fmt::Display for ResponseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statistics across all tiers
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStats {
    pub enabled: bool,
    pub permanent: PermanentStats,
    pub ordinary: OrdinaryStats,
    pub session_cache: SessionCacheStats,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub promoted: usize,
    pub sessions_purged: usize,
}

/// Builds generation prompts and learns from finished conversations.
pub trait PromptSource: Send + Sync {
    fn build_prompt(&self, question: &str, session_id: Option<&str>) -> String;

    /// Record a finished question/answer turn for the conversation.
    fn record_turn(&self, session_id: &str, question: &str, answer: &str);
}

/// Prompt source used when the knowledge cache is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPrompt;

impl PromptSource for PlainPrompt {
    fn build_prompt(&self, question: &str, _session_id: Option<&str>) -> String {
        plain_prompt(question, "")
    }

    fn record_turn(&self, _session_id: &str, _question: &str, _answer: &str) {}
}

/// The default question-with-context prompt.
pub fn plain_prompt(question: &str, context: &str) -> String {
    if context.is_empty() {
        format!("Answer the following question.\n\nQuestion: {question}")
    } else {
        format!("Answer the question using the context below.\n\nContext:\n{context}\n\nQuestion: {question}")
    }
}

/// Facade over the three knowledge tiers
pub struct KnowledgeManager {
    config: HopeConfig,
    clock: SharedClock,
    permanent: Arc<PermanentTier>,
    ordinary: Arc<OrdinaryTier>,
    sessions: Arc<SessionCache>,
    weigher: FeedbackWeigher,
}

impl KnowledgeManager {
    /// Validate the configuration and load every tier.
    pub fn open(config: HopeConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let permanent = Arc::new(PermanentTier::open(config.permanent.clone(), clock.clone()));
        let ordinary = Arc::new(OrdinaryTier::open(config.ordinary.clone(), clock.clone()));
        let sessions = Arc::new(SessionCache::new(config.session_cache.clone(), clock.clone()));
        info!(enabled = config.enabled, "Knowledge manager ready");
        Ok(Self {
            config,
            clock,
            permanent,
            ordinary,
            sessions,
            weigher: FeedbackWeigher,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &HopeConfig {
        &self.config
    }

    pub fn permanent(&self) -> &Arc<PermanentTier> {
        &self.permanent
    }

    pub fn ordinary(&self) -> &Arc<OrdinaryTier> {
        &self.ordinary
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Fast-path router over the tiers, or a no-op router when disabled.
    pub fn router(&self) -> Arc<dyn FastPath> {
        if self.config.enabled {
            Arc::new(TierRouter::new(
                self.config.router.clone(),
                self.permanent.clone(),
                self.ordinary.clone(),
            ))
        } else {
            Arc::new(DisabledRouter)
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query
    // ─────────────────────────────────────────────────────────────────────

    /// Consult session context, then the permanent tier, then the ordinary tier.
    pub fn smart_query(&self, question: &str, session_id: Option<&str>) -> SmartQueryResult {
        if !self.config.enabled {
            return SmartQueryResult::needs_generation(AnswerSource::Disabled);
        }
        let started = Instant::now();
        let mut result = SmartQueryResult::needs_generation(AnswerSource::Generation);

        if let Some(session_id) = session_id {
            let session = self.sessions.query(session_id, question);
            if session.has_relevant_context() {
                result.contexts = session.relevant_definitions;
                if session.topic_continuation {
                    if let Some(summary) = session.conversation_summary {
                        result.contexts = vec![summary];
                    }
                }
                result.current_topic = session.current_topic;
            }
        }

        let permanent = self.permanent.query(question);
        if let Some(answer) = permanent.direct_answer_text() {
            result.answer = Some(answer.to_string());
            result.source = AnswerSource::Permanent;
            result.confidence = permanent.confidence();
            result.needs_generation = false;
            result.fact = permanent.fact;
            return finish(result, started);
        }
        result.skill_template = permanent.skill_template;

        let ordinary = self.ordinary.query(question);
        if let Some(best) = ordinary.best() {
            if ordinary.direct_usable {
                result.answer = Some(best.entry.answer.clone());
                result.source = AnswerSource::Ordinary;
                result.confidence = best.similarity;
                result.needs_generation = false;
                return finish(result, started);
            }
            if ordinary.as_reference {
                result.references = ordinary
                    .matches
                    .iter()
                    .map(|m| ReferenceAnswer {
                        id: m.entry.id.clone(),
                        question: m.entry.question.clone(),
                        answer: m.entry.answer.clone(),
                        similarity: m.similarity,
                        rating: m.entry.average_rating(),
                    })
                    .collect();
                debug!(qa_id = %best.entry.id, similarity = best.similarity, "Using references");
            }
        }
        finish(result, started)
    }

    /// Choose how to answer given a smart query result.
    pub fn strategy(&self, result: &SmartQueryResult) -> ResponseStrategy {
        if !self.config.enabled {
            return ResponseStrategy::FullGeneration;
        }
        if !result.needs_generation
            && result.answer.is_some()
            && result.confidence >= self.config.permanent.direct_answer_confidence
        {
            return ResponseStrategy::DirectAnswer;
        }
        if result.skill_template.is_some() {
            return ResponseStrategy::TemplateAnswer;
        }
        if result
            .best_reference()
            .is_some_and(|r| r.similarity >= self.config.ordinary.reference_threshold)
        {
            return ResponseStrategy::ReferenceAnswer;
        }
        ResponseStrategy::FullGeneration
    }

    // ─────────────────────────────────────────────────────────────────────
    // Learning and feedback
    // ─────────────────────────────────────────────────────────────────────

    /// Learn from an answered question.
    ///
    /// Well-rated answers go into the ordinary tier and may trigger
    /// promotion; the conversation context is always updated.
    pub fn learn(
        &self,
        question: &str,
        answer: &str,
        rating: u8,
        session_id: Option<&str>,
    ) -> Option<SaveOutcome> {
        if !self.config.enabled {
            return None;
        }
        let mut outcome = None;
        if rating >= LEARN_MIN_RATING {
            outcome = Some(self.ordinary.save(question, answer, rating));
            self.ordinary.check_and_promote(&self.permanent);
        }
        if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
            self.sessions.update_context(session_id, question, answer);
        }
        debug!(rating, "Learned from answer");
        outcome
    }

    /// Feed a positive or negative verdict back to whatever served the result.
    pub fn record_feedback(&self, result: &SmartQueryResult, positive: bool) {
        if let Some(fact) = &result.fact {
            if let Err(e) = self.permanent.record_feedback(&fact.id, positive) {
                error!(fact_id = %fact.id, error = %e, "Failed to record fact feedback");
            }
        }
        if let Some(skill) = &result.skill_template {
            if let Err(e) = self.permanent.record_skill_feedback(&skill.id, positive) {
                error!(skill_id = %skill.id, error = %e, "Failed to record skill feedback");
            }
        }
    }

    /// Rate a cached answer, weighted by who rated it and how late.
    pub fn rate_answer(
        &self,
        qa_id: &str,
        rating: u8,
        user: &UserContext,
        answered_at: DateTime<Utc>,
    ) -> Result<CachedQA> {
        let age = self.clock.now() - answered_at;
        let weight = self.weigher.weight(user, age);
        let updated = self.ordinary.record_rating(qa_id, f64::from(rating), weight)?;
        debug!(qa_id = %qa_id, rating, weight, "Rated answer");
        Ok(updated)
    }

    pub fn add_temp_definition(&self, session_id: &str, term: &str, definition: &str) {
        if self.config.enabled {
            self.sessions.add_temp_definition(session_id, term, definition);
        }
    }

    pub fn clear_session(&self, session_id: &str) {
        if self.config.enabled {
            self.sessions.clear_session(session_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Retention sweep, promotion and session purge in one pass.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired: self.ordinary.cleanup_expired(),
            promoted: self.ordinary.check_and_promote(&self.permanent).len(),
            sessions_purged: self.sessions.purge_expired(),
        };
        info!(
            expired = report.expired,
            promoted = report.promoted,
            sessions_purged = report.sessions_purged,
            "Knowledge maintenance complete"
        );
        report
    }

    /// Run maintenance every `maintenance_interval_secs` until aborted.
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.ordinary.maintenance_interval_secs.max(1));
        info!(interval_secs = period.as_secs(), "Starting knowledge maintenance");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_maintenance();
            }
        })
    }

    pub fn stats(&self) -> KnowledgeStats {
        KnowledgeStats {
            enabled: self.config.enabled,
            permanent: self.permanent.stats(),
            ordinary: self.ordinary.stats(),
            session_cache: self.sessions.stats(),
        }
    }

    /// Write every tier's snapshot.
    pub fn flush(&self) -> Result<()> {
        self.permanent.flush()?;
        self.ordinary.flush()
    }

    fn reference_context(&self, question: &str) -> Vec<String> {
        self.ordinary
            .references(question)
            .into_iter()
            .map(|m| format!("Q: {}\nA: {}", m.entry.question, m.entry.answer))
            .collect()
    }
}

impl PromptSource for KnowledgeManager {
    /// Skill template if one matches, else the plain prompt, with session
    /// context and reference answers as the context block.
    fn build_prompt(&self, question: &str, session_id: Option<&str>) -> String {
        if !self.config.enabled {
            return plain_prompt(question, "");
        }

        let mut context: Vec<String> = Vec::new();
        if let Some(session_id) = session_id {
            let session = self.sessions.query(session_id, question);
            context.extend(session.relevant_definitions);
            if let Some(summary) = session.conversation_summary {
                context.push(summary);
            }
        }
        context.extend(self.reference_context(question));
        let context = context.join("\n\n");

        match self.permanent.find_skill_template(question) {
            Some(skill) => {
                debug!(skill_id = %skill.id, "Building prompt from skill template");
                skill.render(question, &context)
            }
            None => plain_prompt(question, &context),
        }
    }

    fn record_turn(&self, session_id: &str, question: &str, answer: &str) {
        if self.config.enabled {
            self.sessions.update_context(session_id, question, answer);
        }
    }
}

fn finish(mut result: SmartQueryResult, started: Instant) -> SmartQueryResult {
    result.elapsed_ms = started.elapsed().as_millis() as u64;
    debug!(
        source = result.source.as_str(),
        needs_generation = result.needs_generation,
        elapsed_ms = result.elapsed_ms,
        "Smart query complete"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::feedback::UserRole;
    use tempfile::TempDir;

    fn manager() -> (KnowledgeManager, ManualClock, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let manager = KnowledgeManager::open(HopeConfig::with_data_dir(dir.path()), clock.shared()).unwrap();
        (manager, clock, dir)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Smart query
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_smart_query_direct_from_permanent() {
        let (manager, _clock, _dir) = manager();

        let result = manager.smart_query("What is Rust?", None);
        assert_eq!(result.source, AnswerSource::Permanent);
        assert!(!result.needs_generation);
        assert!(result.answer.unwrap().starts_with("Rust is"));
        assert_eq!(manager.strategy(&manager.smart_query("What is Rust?", None)), ResponseStrategy::DirectAnswer);
    }

    #[test]
    fn test_smart_query_direct_from_ordinary() {
        let (manager, _clock, _dir) = manager();
        manager.learn("how do I pin a tokio version", "use tokio = \"=1.40\"", 5, None);

        let result = manager.smart_query("how do I pin a tokio version", None);
        assert_eq!(result.source, AnswerSource::Ordinary);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(manager.strategy(&result), ResponseStrategy::DirectAnswer);
    }

    #[test]
    fn test_smart_query_references_and_template() {
        let (manager, _clock, _dir) = manager();
        manager.learn("configure tracing subscriber env filter", "use EnvFilter", 5, None);

        let result = manager.smart_query("configure tracing subscriber filter", None);
        assert!(result.needs_generation);
        assert_eq!(result.references.len(), 1);
        assert_eq!(manager.strategy(&result), ResponseStrategy::ReferenceAnswer);

        let result = manager.smart_query("please summarize the release notes", None);
        assert!(result.skill_template.is_some());
        assert_eq!(manager.strategy(&result), ResponseStrategy::TemplateAnswer);
    }

    #[test]
    fn test_smart_query_miss() {
        let (manager, _clock, _dir) = manager();

        let result = manager.smart_query("why is the build cache cold", None);
        assert_eq!(result.source, AnswerSource::Generation);
        assert!(result.needs_generation);
        assert_eq!(manager.strategy(&result), ResponseStrategy::FullGeneration);
    }

    #[test]
    fn test_disabled_manager() {
        let dir = TempDir::new().unwrap();
        let mut config = HopeConfig::with_data_dir(dir.path());
        config.enabled = false;
        let manager = KnowledgeManager::open(config, ManualClock::starting_now().shared()).unwrap();

        let result = manager.smart_query("What is Rust?", None);
        assert_eq!(result.source, AnswerSource::Disabled);
        assert_eq!(manager.strategy(&result), ResponseStrategy::FullGeneration);
        assert!(manager.learn("q", "a", 5, None).is_none());
        assert!(!manager.router().lookup("What is Rust?").is_hit());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = HopeConfig::with_data_dir(dir.path());
        config.ordinary.similarity_threshold = 1.5;

        let err = KnowledgeManager::open(config, ManualClock::starting_now().shared()).err().unwrap();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Learning and feedback
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_learn_skips_low_ratings_but_updates_session() {
        let (manager, _clock, _dir) = manager();

        assert!(manager.learn("explain docker volumes", "they persist data", 2, Some("s1")).is_none());
        assert!(manager.ordinary().is_empty());
        assert_eq!(manager.sessions().get("s1").unwrap().turn_count(), 1);
    }

    #[test]
    fn test_session_context_flows_into_query_and_prompt() {
        let (manager, _clock, _dir) = manager();
        manager.learn("ctx refers to the request context", "Noted.", 0, Some("s1"));

        let result = manager.smart_query("where is ctx dropped", Some("s1"));
        assert_eq!(result.contexts, vec!["ctx: the request context"]);

        let prompt = manager.build_prompt("where is ctx dropped", Some("s1"));
        assert!(prompt.contains("ctx: the request context"));
        assert!(prompt.contains("Question: where is ctx dropped"));
    }

    #[test]
    fn test_prompt_uses_skill_template() {
        let (manager, _clock, _dir) = manager();

        let prompt = manager.build_prompt("summarize this design doc", None);
        assert!(prompt.starts_with("Summarize the material below."));
        assert!(prompt.contains("Request: summarize this design doc"));
    }

    #[test]
    fn test_feedback_reaches_fact() {
        let (manager, _clock, _dir) = manager();

        let result = manager.smart_query("What is Docker", None);
        manager.record_feedback(&result, false);
        let fact = manager.permanent().get_fact("builtin_docker").unwrap();
        assert_eq!(fact.negative_feedback, 1);
    }

    #[test]
    fn test_rate_answer_is_weighted() {
        let (manager, clock, _dir) = manager();
        let id = manager
            .learn("how to bound an mpsc channel", "mpsc::channel(n)", 4, None)
            .unwrap()
            .id()
            .to_string();
        let answered_at = clock.now();
        clock.advance(chrono::Duration::minutes(5));

        let expert = UserContext::default().with_role(UserRole::Expert);
        let updated = manager.rate_answer(&id, 1, &expert, answered_at).unwrap();
        // (4 * 1.0 + 1 * 1.5) / 2.5
        assert!((updated.average_rating() - 2.2).abs() < 1e-9);

        assert!(manager.rate_answer("qa_missing", 5, &expert, answered_at).unwrap_err().is_not_found());
    }

    #[test]
    fn test_maintenance_promotes_and_sweeps() {
        let (manager, clock, _dir) = manager();
        let mut entry = CachedQA::new("how to read env vars in rust", "std::env::var", clock.now());
        entry.access_count = 10;
        entry.rating = 5.0;
        manager.ordinary().insert(entry);

        let report = manager.run_maintenance();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.expired, 0);

        // The promoted entry is swept on the next pass.
        let report = manager.run_maintenance();
        assert_eq!(report.expired, 1);
        assert!(manager.ordinary().is_empty());
        assert!(manager.permanent().facts().iter().any(|f| f.source.starts_with("ordinary:")));
    }

    #[test]
    fn test_stats_cover_every_tier() {
        let (manager, _clock, _dir) = manager();
        manager.learn("what is a oneshot channel", "single value channel", 5, Some("s1"));

        let stats = manager.stats();
        assert!(stats.enabled);
        assert_eq!(stats.ordinary.total, 1);
        assert!(stats.permanent.facts >= 4);
        assert_eq!(stats.session_cache.active_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_maintenance_runs_on_interval() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let mut config = HopeConfig::with_data_dir(dir.path());
        config.ordinary.maintenance_interval_secs = 60;
        let manager = Arc::new(KnowledgeManager::open(config, clock.shared()).unwrap());

        let mut entry = CachedQA::new("stale question", "stale answer", clock.now());
        entry.promoted = true;
        manager.ordinary().insert(entry);

        let handle = manager.clone().spawn_maintenance();
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(manager.ordinary().is_empty());
        handle.abort();
    }
}
