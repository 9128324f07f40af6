//! Permanent tier: durable high-confidence facts and skill templates.
//!
//! Facts are looked up through a keyword inverted index and scored by a
//! full pattern match (1.0) or keyword coverage. Skill templates are
//! matched first-hit in declaration order and shape the prompt sent to
//! the generator rather than answering directly.
//!
//! ```text
//!   question ──► normalize ──► keyword index ∩ ──► score candidates ──► best ≥ match_threshold
//!                                     │ (no hit)                              │
//!                                     └──────► full scan ─────────────────────┘
//!                                                                             ▼
//!                                                   confidence ≥ direct_answer_confidence ?
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::PermanentConfig;
use crate::error::{Error, Result};
use crate::persistence::JsonSnapshot;
use crate::text;

const FACTS_FILE: &str = "factual_knowledge.json";
const SKILLS_FILE: &str = "skill_templates.json";

/// A high-confidence fact that can answer a question directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactualEntry {
    pub id: String,
    /// Full-match regex over the normalized question
    pub question_pattern: Option<String>,
    pub keywords: Vec<String>,
    pub answer: String,
    /// Where the fact came from ("builtin", "manual", "ordinary:<id>")
    pub source: String,
    pub confidence: f64,
    pub access_count: u64,
    pub positive_feedback: u64,
    pub negative_feedback: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FactualEntry {
    /// Fraction of feedback that was negative
    pub fn negative_ratio(&self) -> f64 {
        let total = self.positive_feedback + self.negative_feedback;
        if total == 0 {
            0.0
        } else {
            self.negative_feedback as f64 / total as f64
        }
    }
}

/// Input for a new fact
#[derive(Debug, Clone, Default)]
pub struct NewFact {
    pub question_pattern: Option<String>,
    pub keywords: Vec<String>,
    pub answer: String,
    pub source: String,
    pub confidence: f64,
}

/// A prompt template selected by question shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillTemplate {
    pub id: String,
    pub name: String,
    pub pattern: Option<String>,
    pub keywords: Vec<String>,
    /// Text with `{question}`, `{context}` and `{content}` placeholders
    pub prompt_template: String,
    pub confidence: f64,
    pub usage_count: u64,
    pub success_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
}

impl SkillTemplate {
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    /// Fill the template placeholders.
    pub fn render(&self, question: &str, context: &str) -> String {
        self.prompt_template
            .replace("{question}", question)
            .replace("{context}", context)
            .replace("{content}", context)
    }
}

/// Input for a new skill template
#[derive(Debug, Clone, Default)]
pub struct NewSkillTemplate {
    pub name: String,
    pub pattern: Option<String>,
    pub keywords: Vec<String>,
    pub prompt_template: String,
    pub confidence: f64,
}

/// Outcome of a permanent tier lookup
#[derive(Debug, Clone, Default)]
pub struct PermanentQueryResult {
    /// Best-scoring fact at or above the match threshold
    pub fact: Option<FactualEntry>,
    /// Match score of `fact`
    pub score: f64,
    /// True only when the fact's confidence clears `direct_answer_confidence`
    pub direct_answer: bool,
    pub skill_template: Option<SkillTemplate>,
}

impl PermanentQueryResult {
    /// The answer text, if this result may be served without generation
    pub fn direct_answer_text(&self) -> Option<&str> {
        match (&self.fact, self.direct_answer) {
            (Some(fact), true) => Some(&fact.answer),
            _ => None,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.fact.as_ref().map(|f| f.confidence).unwrap_or(0.0)
    }
}

/// Permanent tier statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermanentStats {
    pub facts: usize,
    pub enabled_facts: usize,
    pub skill_templates: usize,
    pub total_accesses: u64,
}

#[derive(Default)]
struct PermanentState {
    facts: HashMap<String, FactualEntry>,
    fact_patterns: HashMap<String, Regex>,
    keyword_index: HashMap<String, HashSet<String>>,
    skills: Vec<SkillTemplate>,
    skill_patterns: HashMap<String, Regex>,
}

impl PermanentState {
    fn index_fact(&mut self, fact: &FactualEntry) {
        for keyword in &fact.keywords {
            self.keyword_index
                .entry(keyword.to_lowercase())
                .or_default()
                .insert(fact.id.clone());
        }
    }

    fn unindex_fact(&mut self, fact: &FactualEntry) {
        for keyword in &fact.keywords {
            let key = keyword.to_lowercase();
            if let Some(ids) = self.keyword_index.get_mut(&key) {
                ids.remove(&fact.id);
                if ids.is_empty() {
                    self.keyword_index.remove(&key);
                }
            }
        }
    }

    fn insert_fact(&mut self, fact: FactualEntry, pattern: Option<Regex>) {
        if let Some(previous) = self.facts.remove(&fact.id) {
            self.unindex_fact(&previous);
        }
        self.index_fact(&fact);
        match pattern {
            Some(re) => self.fact_patterns.insert(fact.id.clone(), re),
            None => self.fact_patterns.remove(&fact.id),
        };
        self.facts.insert(fact.id.clone(), fact);
    }

    fn score(&self, fact: &FactualEntry, normalized: &str) -> f64 {
        if let Some(re) = self.fact_patterns.get(&fact.id) {
            if re.is_match(normalized) {
                return 1.0;
            }
        }
        if fact.keywords.is_empty() {
            return 0.0;
        }
        let matched = fact
            .keywords
            .iter()
            .filter(|k| normalized.contains(&k.to_lowercase()))
            .count();
        matched as f64 / fact.keywords.len() as f64
    }

    fn best_of<'a>(
        &self,
        ids: impl Iterator<Item = &'a String>,
        normalized: &str,
        threshold: f64,
    ) -> Option<(String, f64)> {
        let mut ids: Vec<&String> = ids.collect();
        ids.sort();
        let mut best: Option<(String, f64)> = None;
        for id in ids {
            let Some(fact) = self.facts.get(id) else { continue };
            if !fact.enabled {
                continue;
            }
            let score = self.score(fact, normalized);
            let better = best.as_ref().is_none_or(|(_, s)| score > *s);
            if score >= threshold && better {
                best = Some((id.clone(), score));
            }
        }
        best
    }

    fn find_fact(&self, normalized: &str, threshold: f64) -> Option<(String, f64)> {
        let mut candidates: Option<HashSet<String>> = None;
        for word in text::words(normalized) {
            if let Some(ids) = self.keyword_index.get(word) {
                candidates = Some(match candidates {
                    None => ids.clone(),
                    Some(current) => current.intersection(ids).cloned().collect(),
                });
            }
        }

        candidates
            .and_then(|ids| self.best_of(ids.iter(), normalized, threshold))
            .or_else(|| self.best_of(self.facts.keys(), normalized, threshold))
    }

    fn find_skill(&self, normalized: &str) -> Option<usize> {
        self.skills.iter().position(|skill| {
            skill.enabled
                && (self
                    .skill_patterns
                    .get(&skill.id)
                    .is_some_and(|re| re.is_match(normalized))
                    || skill
                        .keywords
                        .iter()
                        .any(|k| normalized.contains(&k.to_lowercase())))
        })
    }
}

/// Compile a stored pattern as a case-insensitive full match.
fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i)^(?:{pattern})$"))
        .map_err(|e| Error::invalid_pattern(pattern, e.to_string()))
}

fn compile_or_warn(id: &str, pattern: Option<&str>) -> Option<Regex> {
    let pattern = pattern?;
    match compile_pattern(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(id = %id, error = %e, "Ignoring invalid stored pattern");
            None
        }
    }
}

fn short_id(prefix: &str) -> String {
    format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Durable, read-mostly store of facts and skill templates
pub struct PermanentTier {
    config: PermanentConfig,
    clock: SharedClock,
    state: RwLock<PermanentState>,
    facts_file: JsonSnapshot<FactualEntry>,
    skills_file: JsonSnapshot<SkillTemplate>,
}

impl PermanentTier {
    /// Load the tier from its storage directory, seeding builtins when
    /// configured and absent.
    pub fn open(config: PermanentConfig, clock: SharedClock) -> Self {
        let facts_file: JsonSnapshot<FactualEntry> =
            JsonSnapshot::in_dir(&config.storage_path, FACTS_FILE);
        let skills_file: JsonSnapshot<SkillTemplate> =
            JsonSnapshot::in_dir(&config.storage_path, SKILLS_FILE);

        let mut state = PermanentState::default();
        for fact in facts_file.load_or_empty() {
            let pattern = compile_or_warn(&fact.id, fact.question_pattern.as_deref());
            state.insert_fact(fact, pattern);
        }
        for skill in skills_file.load_or_empty() {
            if let Some(re) = compile_or_warn(&skill.id, skill.pattern.as_deref()) {
                state.skill_patterns.insert(skill.id.clone(), re);
            }
            state.skills.push(skill);
        }

        let tier = Self {
            config,
            clock,
            state: RwLock::new(state),
            facts_file,
            skills_file,
        };
        if tier.config.seed_builtins {
            tier.seed_builtins();
        }

        let stats = tier.stats();
        info!(
            facts = stats.facts,
            skill_templates = stats.skill_templates,
            "Permanent tier ready"
        );
        tier
    }

    fn read(&self) -> RwLockReadGuard<'_, PermanentState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PermanentState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &PermanentConfig {
        &self.config
    }

    /// Look up a fact and a skill template for a question.
    pub fn query(&self, question: &str) -> PermanentQueryResult {
        let normalized = text::normalize(question);
        let (hit, skill_idx) = {
            let state = self.read();
            (
                state.find_fact(&normalized, self.config.match_threshold),
                state.find_skill(&normalized),
            )
        };

        let mut result = PermanentQueryResult::default();
        if hit.is_none() && skill_idx.is_none() {
            return result;
        }

        let now = self.clock.now();
        let mut state = self.write();
        if let Some((id, score)) = hit {
            if let Some(fact) = state.facts.get_mut(&id) {
                result.score = score;
                result.direct_answer = fact.confidence >= self.config.direct_answer_confidence;
                if result.direct_answer {
                    fact.access_count += 1;
                    debug!(fact_id = %id, score, confidence = fact.confidence, "Permanent fact hit");
                }
                result.fact = Some(fact.clone());
            }
        }
        if let Some(idx) = skill_idx {
            if let Some(skill) = state.skills.get_mut(idx) {
                skill.last_used = Some(now);
                debug!(skill_id = %skill.id, "Skill template hit");
                result.skill_template = Some(skill.clone());
            }
        }
        result
    }

    /// First enabled skill template matching the question, in declaration order.
    pub fn find_skill_template(&self, question: &str) -> Option<SkillTemplate> {
        let normalized = text::normalize(question);
        let state = self.read();
        state.find_skill(&normalized).map(|idx| state.skills[idx].clone())
    }

    /// Add a fact.
    pub fn save_fact(&self, input: NewFact) -> Result<FactualEntry> {
        let pattern = input.question_pattern.as_deref().map(compile_pattern).transpose()?;
        let now = self.clock.now();
        let fact = FactualEntry {
            id: short_id("fact"),
            question_pattern: input.question_pattern,
            keywords: input.keywords.iter().map(|k| k.to_lowercase()).collect(),
            answer: input.answer,
            source: input.source,
            confidence: input.confidence.clamp(0.0, 1.0),
            access_count: 0,
            positive_feedback: 0,
            negative_feedback: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        self.write().insert_fact(fact.clone(), pattern);
        self.persist_facts();
        info!(fact_id = %fact.id, source = %fact.source, "Saved permanent fact");
        Ok(fact)
    }

    /// Append a skill template; it is matched after all existing ones.
    pub fn save_skill_template(&self, input: NewSkillTemplate) -> Result<SkillTemplate> {
        let pattern = input.pattern.as_deref().map(compile_pattern).transpose()?;
        let skill = SkillTemplate {
            id: short_id("skill"),
            name: input.name,
            pattern: input.pattern,
            keywords: input.keywords.iter().map(|k| k.to_lowercase()).collect(),
            prompt_template: input.prompt_template,
            confidence: input.confidence.clamp(0.0, 1.0),
            usage_count: 0,
            success_count: 0,
            last_used: None,
            created_at: self.clock.now(),
            enabled: true,
        };

        {
            let mut state = self.write();
            if let Some(re) = pattern {
                state.skill_patterns.insert(skill.id.clone(), re);
            }
            state.skills.push(skill.clone());
        }
        self.persist_skills();
        info!(skill_id = %skill.id, name = %skill.name, "Saved skill template");
        Ok(skill)
    }

    /// Record feedback on a fact, disabling it once the negative ratio
    /// exceeds the configured maximum over enough samples.
    pub fn record_feedback(&self, id: &str, positive: bool) -> Result<FactualEntry> {
        let fact = {
            let mut state = self.write();
            let fact = state
                .facts
                .get_mut(id)
                .ok_or_else(|| Error::not_found("FactualEntry", id))?;
            if positive {
                fact.positive_feedback += 1;
            } else {
                fact.negative_feedback += 1;
            }
            fact.updated_at = self.clock.now();

            let samples = fact.positive_feedback + fact.negative_feedback;
            if fact.enabled
                && samples >= self.config.feedback_min_samples
                && fact.negative_ratio() > self.config.max_negative_ratio
            {
                fact.enabled = false;
                warn!(
                    fact_id = %id,
                    negative_ratio = fact.negative_ratio(),
                    "Disabled fact after negative feedback"
                );
            }
            fact.clone()
        };
        self.persist_facts();
        Ok(fact)
    }

    /// Manually re-enable a disabled fact, clearing its feedback counters.
    pub fn reset_fact(&self, id: &str) -> Result<FactualEntry> {
        let fact = {
            let mut state = self.write();
            let fact = state
                .facts
                .get_mut(id)
                .ok_or_else(|| Error::not_found("FactualEntry", id))?;
            fact.enabled = true;
            fact.positive_feedback = 0;
            fact.negative_feedback = 0;
            fact.updated_at = self.clock.now();
            fact.clone()
        };
        self.persist_facts();
        info!(fact_id = %id, "Fact manually reset");
        Ok(fact)
    }

    pub fn record_skill_feedback(&self, id: &str, success: bool) -> Result<SkillTemplate> {
        let skill = {
            let mut state = self.write();
            let skill = state
                .skills
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::not_found("SkillTemplate", id))?;
            skill.usage_count += 1;
            if success {
                skill.success_count += 1;
            }
            skill.last_used = Some(self.clock.now());
            skill.clone()
        };
        self.persist_skills();
        Ok(skill)
    }

    pub fn get_fact(&self, id: &str) -> Option<FactualEntry> {
        self.read().facts.get(id).cloned()
    }

    /// Whether any fact was created from the given source tag.
    pub fn has_source(&self, source: &str) -> bool {
        self.read().facts.values().any(|f| f.source == source)
    }

    /// All facts, oldest first.
    pub fn facts(&self) -> Vec<FactualEntry> {
        let mut facts: Vec<FactualEntry> = self.read().facts.values().cloned().collect();
        facts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        facts
    }

    /// All skill templates in match order.
    pub fn skill_templates(&self) -> Vec<SkillTemplate> {
        self.read().skills.clone()
    }

    pub fn stats(&self) -> PermanentStats {
        let state = self.read();
        PermanentStats {
            facts: state.facts.len(),
            enabled_facts: state.facts.values().filter(|f| f.enabled).count(),
            skill_templates: state.skills.len(),
            total_accesses: state.facts.values().map(|f| f.access_count).sum(),
        }
    }

    /// Write both snapshot files, returning the first failure.
    pub fn flush(&self) -> Result<()> {
        let (facts, skills) = {
            let state = self.read();
            (
                state.facts.values().cloned().collect::<Vec<_>>(),
                state.skills.clone(),
            )
        };
        self.facts_file.write(&facts)?;
        self.skills_file.write(&skills)
    }

    fn persist_facts(&self) {
        let facts = self.facts();
        self.facts_file.write_or_log(&facts);
    }

    fn persist_skills(&self) {
        let skills = self.skill_templates();
        self.skills_file.write_or_log(&skills);
    }

    fn seed_builtins(&self) {
        let now = self.clock.now();
        let mut facts_added = 0;
        let mut skills_added = 0;
        {
            let mut state = self.write();
            for (id, pattern, keywords, answer, confidence) in builtin::FACTS {
                if state.facts.contains_key(*id) {
                    continue;
                }
                let fact = FactualEntry {
                    id: id.to_string(),
                    question_pattern: Some(pattern.to_string()),
                    keywords: keywords.iter().map(|k| k.to_string()).collect(),
                    answer: answer.to_string(),
                    source: "builtin".to_string(),
                    confidence: *confidence,
                    access_count: 0,
                    positive_feedback: 0,
                    negative_feedback: 0,
                    enabled: true,
                    created_at: now,
                    updated_at: now,
                };
                let re = compile_or_warn(id, Some(*pattern));
                state.insert_fact(fact, re);
                facts_added += 1;
            }
            for (id, name, pattern, keywords, template) in builtin::SKILLS {
                if state.skills.iter().any(|s| s.id == *id) {
                    continue;
                }
                if let Some(re) = compile_or_warn(id, Some(*pattern)) {
                    state.skill_patterns.insert(id.to_string(), re);
                }
                state.skills.push(SkillTemplate {
                    id: id.to_string(),
                    name: name.to_string(),
                    pattern: Some(pattern.to_string()),
                    keywords: keywords.iter().map(|k| k.to_string()).collect(),
                    prompt_template: template.to_string(),
                    confidence: 0.9,
                    usage_count: 0,
                    success_count: 0,
                    last_used: None,
                    created_at: now,
                    enabled: true,
                });
                skills_added += 1;
            }
        }
        if facts_added > 0 {
            self.persist_facts();
        }
        if skills_added > 0 {
            self.persist_skills();
        }
        if facts_added + skills_added > 0 {
            debug!(facts_added, skills_added, "Seeded builtin knowledge");
        }
    }
}

mod builtin {
    /// (id, pattern, keywords, answer, confidence)
    pub(super) const FACTS: &[(&str, &str, &[&str], &str, f64)] = &[
        (
            "builtin_docker",
            r"(what is|what's|define|explain) docker( containers?)?[?.!]?",
            &["what is", "docker"],
            "Docker is a platform for packaging applications and their dependencies into \
             lightweight, portable containers that share the host kernel. Images are built \
             from a Dockerfile and run as isolated containers via the Docker Engine.",
            1.0,
        ),
        (
            "builtin_rust",
            r"(what is|what's|define|explain) (the )?rust( programming)?( language)?[?.!]?",
            &["what is", "rust", "language"],
            "Rust is a systems programming language focused on memory safety, fearless \
             concurrency and zero-cost abstractions. Its ownership and borrowing rules are \
             checked at compile time, so it needs no garbage collector.",
            1.0,
        ),
        (
            "builtin_kubernetes",
            r"(what is|what's|define|explain) (kubernetes|k8s)[?.!]?",
            &["what is", "kubernetes"],
            "Kubernetes is an open-source container orchestration system that automates \
             deployment, scaling and management of containerized workloads across a cluster.",
            0.95,
        ),
        (
            "builtin_hope",
            r"(what is|what's|explain) (the )?hope( cache| system)?[?.!]?",
            &["hope", "cache"],
            "HOPE is a tiered knowledge cache. The permanent tier holds vetted facts and \
             skill templates, the ordinary tier holds recent rated answers, and the session \
             cache holds per-conversation context. Questions are answered from the cache \
             when confident and otherwise streamed from the generative model.",
            1.0,
        ),
    ];

    /// (id, name, pattern, keywords, prompt template)
    pub(super) const SKILLS: &[(&str, &str, &str, &[&str], &str)] = &[
        (
            "code-explain",
            "Code explanation",
            r".*(explain|what does).*(code|function|snippet).*|.*解释.*代码.*|.*这段代码.*",
            &["explain this code", "explain the code", "什么意思"],
            "You are a senior engineer. Explain the following code clearly.\n\n\
             Question: {question}\n\n\
             Code and context:\n{content}\n\n\
             Cover: 1. what it does overall 2. the key steps 3. any pitfalls.",
        ),
        (
            "doc-summary",
            "Document summary",
            r".*(summarize|summarise|summary|tl;?dr|key points).*|.*(总结|摘要|概括|要点).*",
            &["summarize", "summary", "归纳"],
            "Summarize the material below.\n\n\
             Request: {question}\n\n\
             Material:\n{content}\n\n\
             Give a one-sentence overview followed by the key points as a list.",
        ),
        (
            "compare",
            "Comparison",
            r".*(compare|comparison|difference between|differences between|versus| vs\.? ).*|.*(比较|对比|区别|差异).*",
            &["compare", "difference between", "pros and cons", "优缺点"],
            "Compare the subjects in the question below.\n\n\
             Question: {question}\n\n\
             Context:\n{context}\n\n\
             Present similarities, differences, and when to choose each.",
        ),
    ];
}
