//! Fast-path router.
//!
//! Queries the permanent tier, then the ordinary tier, and returns the
//! first answer confident enough to serve without generation. The lookup
//! is purely in-memory; the latency target is advisory and not enforced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::tiers::{OrdinaryTier, PermanentTier};

/// Which tier produced a fast answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FastSource {
    Permanent,
    Ordinary,
    None,
}

impl FastSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Ordinary => "ordinary",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for FastSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a fast-path lookup
#[derive(Debug, Clone, Serialize)]
pub struct FastAnswer {
    pub source: FastSource,
    pub answer: Option<String>,
    /// Fact confidence, or normalized rating for ordinary answers
    pub confidence: f64,
    /// Set for ordinary answers only
    pub similarity: Option<f64>,
    /// Fact or cached answer id
    pub entry_id: Option<String>,
    /// True only for permanent facts; ordinary answers are near matches
    pub direct: bool,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl FastAnswer {
    pub fn miss(elapsed: Duration) -> Self {
        Self {
            source: FastSource::None,
            answer: None,
            confidence: 0.0,
            similarity: None,
            entry_id: None,
            direct: false,
            elapsed,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.answer.is_some()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// A synchronous cache lookup run alongside generation.
pub trait FastPath: Send + Sync {
    fn lookup(&self, question: &str) -> FastAnswer;
}

/// Permanent-then-ordinary router
pub struct TierRouter {
    config: RouterConfig,
    permanent: Arc<PermanentTier>,
    ordinary: Arc<OrdinaryTier>,
}

impl TierRouter {
    pub fn new(config: RouterConfig, permanent: Arc<PermanentTier>, ordinary: Arc<OrdinaryTier>) -> Self {
        Self {
            config,
            permanent,
            ordinary,
        }
    }

    fn from_permanent(&self, question: &str, started: Instant) -> Option<FastAnswer> {
        let result = self.permanent.query(question);
        let fact = result.fact.filter(|_| result.direct_answer)?;
        if fact.confidence < self.config.permanent_min_confidence {
            return None;
        }
        Some(FastAnswer {
            source: FastSource::Permanent,
            answer: Some(fact.answer),
            confidence: fact.confidence,
            similarity: None,
            entry_id: Some(fact.id),
            direct: true,
            elapsed: started.elapsed(),
        })
    }

    fn from_ordinary(&self, question: &str, started: Instant) -> Option<FastAnswer> {
        let found = self
            .ordinary
            .find_similar(question, self.config.ordinary_min_similarity)?;
        let rating_ratio = found.entry.rating_ratio();
        if rating_ratio < self.config.ordinary_min_rating_ratio {
            debug!(
                qa_id = %found.entry.id,
                rating_ratio,
                "Ordinary match rated too low for fast path"
            );
            return None;
        }
        Some(FastAnswer {
            source: FastSource::Ordinary,
            answer: Some(found.entry.answer),
            confidence: rating_ratio,
            similarity: Some(found.similarity),
            entry_id: Some(found.entry.id),
            direct: false,
            elapsed: started.elapsed(),
        })
    }
}

impl FastPath for TierRouter {
    fn lookup(&self, question: &str) -> FastAnswer {
        let started = Instant::now();

        if let Some(answer) = self.from_permanent(question, started) {
            info!(elapsed_ms = answer.elapsed.as_millis() as u64, "Permanent tier answered directly");
            return answer;
        }
        if let Some(answer) = self.from_ordinary(question, started) {
            info!(
                elapsed_ms = answer.elapsed.as_millis() as u64,
                similarity = answer.similarity.unwrap_or_default(),
                "Ordinary tier answered"
            );
            return answer;
        }

        let elapsed = started.elapsed();
        debug!(elapsed_ms = elapsed.as_millis() as u64, "No fast answer");
        FastAnswer::miss(elapsed)
    }
}

/// Router used when the knowledge cache is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRouter;

impl FastPath for DisabledRouter {
    fn lookup(&self, _question: &str) -> FastAnswer {
        FastAnswer::miss(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{OrdinaryConfig, PermanentConfig};
    use crate::tiers::CachedQA;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        permanent: Arc<PermanentTier>,
        ordinary: Arc<OrdinaryTier>,
        router: TierRouter,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let permanent = Arc::new(PermanentTier::open(
            PermanentConfig {
                storage_path: dir.path().join("permanent"),
                ..PermanentConfig::default()
            },
            clock.shared(),
        ));
        let ordinary = Arc::new(OrdinaryTier::open(
            OrdinaryConfig {
                storage_path: dir.path().join("ordinary"),
                ..OrdinaryConfig::default()
            },
            clock.shared(),
        ));
        let router = TierRouter::new(RouterConfig::default(), permanent.clone(), ordinary.clone());
        Fixture {
            _dir: dir,
            permanent,
            ordinary,
            router,
        }
    }

    fn rated(question: &str, answer: &str, rating: f64) -> CachedQA {
        let mut entry = CachedQA::new(question, answer, chrono::Utc::now());
        entry.rating = rating;
        entry.total_rating = rating;
        entry.rating_weight = 1.0;
        entry.rating_count = 1;
        entry
    }

    #[test]
    fn test_builtin_fact_answers_without_touching_ordinary() {
        let f = fixture();
        f.ordinary.insert(rated("What is Docker", "cached docker answer", 5.0));
        let cached_id = f.ordinary.entries()[0].id.clone();

        let answer = f.router.lookup("What is Docker");
        assert_eq!(answer.source, FastSource::Permanent);
        assert!(answer.direct);
        assert_eq!(answer.confidence, 1.0);
        assert_eq!(answer.entry_id.as_deref(), Some("builtin_docker"));
        assert_eq!(f.ordinary.get(&cached_id).unwrap().access_count, 1, "ordinary tier not queried");
    }

    #[test]
    fn test_ordinary_answer_requires_high_rating() {
        let f = fixture();
        f.ordinary.insert(rated("how to rotate tracing log files", "use tracing-appender", 4.5));
        f.ordinary.insert(rated("how to configure cargo workspace lints", "[workspace.lints]", 3.0));

        let answer = f.router.lookup("how to rotate tracing log files");
        assert_eq!(answer.source, FastSource::Ordinary);
        assert!(!answer.direct);
        assert_eq!(answer.answer.as_deref(), Some("use tracing-appender"));
        assert!((answer.confidence - 0.9).abs() < 1e-9);
        assert_eq!(answer.similarity, Some(1.0));

        let low = f.router.lookup("how to configure cargo workspace lints");
        assert!(!low.is_hit());
        assert_eq!(low.source, FastSource::None);
    }

    #[test]
    fn test_low_confidence_fact_is_not_served() {
        let f = fixture();
        f.permanent
            .save_fact(crate::tiers::NewFact {
                question_pattern: Some("what is the office wifi password".into()),
                keywords: vec!["wifi".into(), "password".into()],
                answer: "ask IT".into(),
                source: "manual".into(),
                confidence: 0.6,
            })
            .unwrap();

        let answer = f.router.lookup("what is the office wifi password");
        assert!(!answer.is_hit());
    }

    #[test]
    fn test_disabled_router_never_answers() {
        let answer = DisabledRouter.lookup("What is Docker");
        assert_eq!(answer.source, FastSource::None);
        assert!(answer.answer.is_none());
    }
}
