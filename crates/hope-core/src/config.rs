//! Knowledge Cache Configuration
//!
//! Defines configuration options for every tier and for the streaming
//! pipeline. All sections deserialize with defaults so a partial TOML
//! file is enough.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HopeConfig {
    /// Master switch; when false every lookup reports "needs generation"
    pub enabled: bool,

    /// Permanent tier configuration
    pub permanent: PermanentConfig,

    /// Ordinary tier configuration
    pub ordinary: OrdinaryConfig,

    /// Session cache configuration
    pub session_cache: SessionCacheConfig,

    /// Fast-path router configuration
    pub router: RouterConfig,

    /// Streaming fan-out configuration
    pub streaming: StreamingConfig,

    /// Session monitor configuration
    pub monitor: MonitorConfig,
}

impl Default for HopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            permanent: PermanentConfig::default(),
            ordinary: OrdinaryConfig::default(),
            session_cache: SessionCacheConfig::default(),
            router: RouterConfig::default(),
            streaming: StreamingConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Permanent tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermanentConfig {
    /// Directory holding skill_templates.json and factual_knowledge.json
    pub storage_path: PathBuf,

    /// Minimum access count before an ordinary entry is promoted (default: 10)
    pub promotion_min_access_count: u64,

    /// Minimum average rating (1-5 scale) for promotion (default: 4.5)
    pub promotion_min_avg_rating: f64,

    /// Minimum fact confidence to answer without generation (default: 0.9)
    pub direct_answer_confidence: f64,

    /// Minimum match score for a fact to be considered at all (default: 0.7)
    pub match_threshold: f64,

    /// Feedback samples required before auto-disable is evaluated (default: 5)
    pub feedback_min_samples: u64,

    /// Negative feedback ratio above which a fact is disabled (default: 0.5)
    pub max_negative_ratio: f64,

    /// Seed builtin facts and skill templates when absent (default: true)
    pub seed_builtins: bool,
}

impl Default for PermanentConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data/hope/permanent"),
            promotion_min_access_count: 10,
            promotion_min_avg_rating: 4.5,
            direct_answer_confidence: 0.9,
            match_threshold: 0.7,
            feedback_min_samples: 5,
            max_negative_ratio: 0.5,
            seed_builtins: true,
        }
    }
}

/// Ordinary tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdinaryConfig {
    /// Directory holding recent_qa.json
    pub storage_path: PathBuf,

    /// Days an entry is kept before the retention sweep removes it (default: 30)
    pub retention_days: i64,

    /// Similarity at which a cached answer is served directly (default: 0.95)
    pub similarity_threshold: f64,

    /// Similarity at which a cached answer is offered as a reference (default: 0.7)
    pub reference_threshold: f64,

    /// Capacity before least-recently-accessed eviction (default: 10000)
    pub max_entries: usize,

    /// Minimum similarity for a candidate to be ranked (default: 0.5)
    pub min_candidate_similarity: f64,

    /// Maximum ranked matches returned by a query (default: 5)
    pub max_results: usize,

    /// Similarity above which a save merges into an existing entry (default: 0.9)
    pub merge_similarity: f64,

    /// Interval between retention/promotion sweeps in seconds (default: 86400 = 1 day)
    pub maintenance_interval_secs: u64,
}

impl Default for OrdinaryConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data/hope/ordinary"),
            retention_days: 30,
            similarity_threshold: 0.95,
            reference_threshold: 0.7,
            max_entries: 10_000,
            min_candidate_similarity: 0.5,
            max_results: 5,
            merge_similarity: 0.9,
            maintenance_interval_secs: 86_400, // 1 day
        }
    }
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCacheConfig {
    /// Maximum live conversation contexts (default: 1000)
    pub max_sessions: usize,

    /// Inactivity before a context expires, in minutes (default: 30)
    pub session_timeout_minutes: i64,

    /// Turns kept per conversation (default: 20)
    pub max_history_per_session: usize,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_timeout_minutes: 30,
            max_history_per_session: 20,
        }
    }
}

/// Fast-path router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Minimum permanent-tier confidence for a fast answer (default: 0.9)
    pub permanent_min_confidence: f64,

    /// Minimum ordinary-tier similarity for a fast answer (default: 0.85)
    pub ordinary_min_similarity: f64,

    /// Minimum average rating as a fraction of the 5-point maximum (default: 0.8)
    pub ordinary_min_rating_ratio: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            permanent_min_confidence: 0.9,
            ordinary_min_similarity: 0.85,
            ordinary_min_rating_ratio: 0.8,
        }
    }
}

/// What a subscriber channel does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for the subscriber to catch up (slows generation forwarding)
    #[default]
    Block,
    /// Drop the chunk for that subscriber only
    Drop,
}

impl BackpressurePolicy {
    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "block" => Some(Self::Block),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Drop => "drop",
        }
    }
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Streaming fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Per-subscriber channel capacity (default: 64)
    pub subscriber_buffer: usize,

    /// Full-channel behaviour (default: block)
    pub backpressure: BackpressurePolicy,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

/// Session monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between staleness sweeps in seconds (default: 300 = 5 minutes)
    pub sweep_interval_secs: u64,

    /// Session age at which the sweep interrupts it, in seconds (default: 300)
    pub session_timeout_secs: i64,

    /// Minimum answer length for a completed session to be cached (default: 50)
    pub min_answer_length: usize,

    /// Minimum duration for a completed session to be cached, in seconds (default: 2)
    pub min_duration_secs: i64,

    /// Maximum drafts retained (default: 100)
    pub draft_capacity: usize,

    /// Received/expected chunk ratio that counts as mostly complete (default: 0.8)
    pub mostly_complete_ratio: f64,

    /// Answer length beyond which an interrupted answer may be kept (default: 200)
    pub long_answer_chars: usize,

    /// Duration beyond which a long interrupted answer is kept, in seconds (default: 10)
    pub dwell_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300, // 5 minutes
            session_timeout_secs: 300,
            min_answer_length: 50,
            min_duration_secs: 2,
            draft_capacity: 100,
            mostly_complete_ratio: 0.8,
            long_answer_chars: 200,
            dwell_secs: 10,
        }
    }
}

impl HopeConfig {
    /// Create a config rooted at a data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let mut config = Self::default();
        config.permanent.storage_path = data_dir.join("permanent");
        config.ordinary.storage_path = data_dir.join("ordinary");
        config
    }

    /// Set permanent tier configuration
    pub fn with_permanent(mut self, permanent: PermanentConfig) -> Self {
        self.permanent = permanent;
        self
    }

    /// Set ordinary tier configuration
    pub fn with_ordinary(mut self, ordinary: OrdinaryConfig) -> Self {
        self.ordinary = ordinary;
        self
    }

    /// Set session cache configuration
    pub fn with_session_cache(mut self, session_cache: SessionCacheConfig) -> Self {
        self.session_cache = session_cache;
        self
    }

    /// Set monitor configuration
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let ratios = [
            ("permanent.direct_answer_confidence", self.permanent.direct_answer_confidence),
            ("permanent.match_threshold", self.permanent.match_threshold),
            ("permanent.max_negative_ratio", self.permanent.max_negative_ratio),
            ("ordinary.similarity_threshold", self.ordinary.similarity_threshold),
            ("ordinary.reference_threshold", self.ordinary.reference_threshold),
            ("ordinary.min_candidate_similarity", self.ordinary.min_candidate_similarity),
            ("ordinary.merge_similarity", self.ordinary.merge_similarity),
            ("router.permanent_min_confidence", self.router.permanent_min_confidence),
            ("router.ordinary_min_similarity", self.router.ordinary_min_similarity),
            ("router.ordinary_min_rating_ratio", self.router.ordinary_min_rating_ratio),
            ("monitor.mostly_complete_ratio", self.monitor.mostly_complete_ratio),
        ];
        for (field, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::invalid(field, "must be between 0 and 1"));
            }
        }

        if self.ordinary.reference_threshold > self.ordinary.similarity_threshold {
            return Err(ConfigValidationError::invalid(
                "ordinary.reference_threshold",
                "must not exceed ordinary.similarity_threshold",
            ));
        }

        if !(1.0..=5.0).contains(&self.permanent.promotion_min_avg_rating) {
            return Err(ConfigValidationError::invalid(
                "permanent.promotion_min_avg_rating",
                "must be between 1 and 5",
            ));
        }

        let positives = [
            ("ordinary.retention_days", self.ordinary.retention_days),
            ("ordinary.max_entries", self.ordinary.max_entries as i64),
            ("ordinary.max_results", self.ordinary.max_results as i64),
            ("session_cache.max_sessions", self.session_cache.max_sessions as i64),
            (
                "session_cache.session_timeout_minutes",
                self.session_cache.session_timeout_minutes,
            ),
            (
                "session_cache.max_history_per_session",
                self.session_cache.max_history_per_session as i64,
            ),
            ("streaming.subscriber_buffer", self.streaming.subscriber_buffer as i64),
            ("ordinary.maintenance_interval_secs", as_secs(self.ordinary.maintenance_interval_secs)),
            ("monitor.sweep_interval_secs", as_secs(self.monitor.sweep_interval_secs)),
            ("monitor.session_timeout_secs", self.monitor.session_timeout_secs),
            ("monitor.draft_capacity", self.monitor.draft_capacity as i64),
        ];
        for (field, value) in positives {
            if value <= 0 {
                return Err(ConfigValidationError::invalid(field, "must be greater than 0"));
            }
        }

        let spans = [
            ("ordinary.retention_days", self.ordinary.retention_days.saturating_mul(86_400)),
            ("ordinary.maintenance_interval_secs", as_secs(self.ordinary.maintenance_interval_secs)),
            (
                "session_cache.session_timeout_minutes",
                self.session_cache.session_timeout_minutes.saturating_mul(60),
            ),
            ("monitor.sweep_interval_secs", as_secs(self.monitor.sweep_interval_secs)),
            ("monitor.session_timeout_secs", self.monitor.session_timeout_secs),
            ("monitor.min_duration_secs", self.monitor.min_duration_secs),
            ("monitor.dwell_secs", self.monitor.dwell_secs),
        ];
        for (field, secs) in spans {
            if !(0..=MAX_SPAN_SECS).contains(&secs) {
                return Err(ConfigValidationError::invalid(field, "must be between 0 and ten years"));
            }
        }

        Ok(())
    }
}

/// Upper bound for configured time spans, in seconds.
const MAX_SPAN_SECS: i64 = 10 * 365 * 86_400;

fn as_secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigValidationError {
    fn invalid(field: &str, message: &str) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HopeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.permanent.promotion_min_access_count, 10);
        assert_eq!(config.permanent.direct_answer_confidence, 0.9);
        assert_eq!(config.ordinary.retention_days, 30);
        assert_eq!(config.ordinary.max_entries, 10_000);
        assert_eq!(config.session_cache.max_sessions, 1000);
        assert_eq!(config.session_cache.session_timeout_minutes, 30);
        assert_eq!(config.monitor.draft_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_time_spans_are_bounded() {
        let mut config = HopeConfig::default();
        config.ordinary.retention_days = 3650;
        config.monitor.min_duration_secs = 0;
        assert!(config.validate().is_ok());

        config.ordinary.retention_days = i64::MAX / 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ordinary.retention_days"));

        let mut config = HopeConfig::default();
        config.session_cache.session_timeout_minutes = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = HopeConfig::default();
        config.monitor.session_timeout_secs = i64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitor.session_timeout_secs"));

        let mut config = HopeConfig::default();
        config.monitor.dwell_secs = -1;
        assert!(config.validate().is_err());

        let mut config = HopeConfig::default();
        config.monitor.sweep_interval_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_data_dir() {
        let config = HopeConfig::with_data_dir("/var/lib/hope");
        assert_eq!(config.permanent.storage_path, PathBuf::from("/var/lib/hope/permanent"));
        assert_eq!(config.ordinary.storage_path, PathBuf::from("/var/lib/hope/ordinary"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = HopeConfig::default();
        config.ordinary.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = HopeConfig::default();
        config.ordinary.reference_threshold = 0.99;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reference_threshold"));

        let mut config = HopeConfig::default();
        config.session_cache.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = HopeConfig::default();
        config.permanent.promotion_min_avg_rating = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HopeConfig = toml::from_str(
            r#"
            [ordinary]
            max_entries = 2

            [streaming]
            backpressure = "drop"
            "#,
        )
        .unwrap();

        assert_eq!(config.ordinary.max_entries, 2);
        assert_eq!(config.ordinary.retention_days, 30);
        assert_eq!(config.streaming.backpressure, BackpressurePolicy::Drop);
        assert_eq!(config.permanent.match_threshold, 0.7);
    }
}
