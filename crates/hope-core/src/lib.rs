//! hope-core - tiered knowledge cache
//!
//! Answers questions from a self-improving cache before falling back to a
//! generative model:
//!
//! - **tiers::permanent**: vetted facts and skill templates (direct answers)
//! - **tiers::ordinary**: recent rated answers with similarity search and promotion
//! - **tiers::session**: per-conversation context (history, topic, definitions)
//! - **router**: the fast-path lookup run alongside generation
//! - **manager**: the facade tying the tiers together
//!
//! ```text
//!                 ┌──────────────────┐
//!   question ───► │  SessionCache    │  context only
//!                 └──────────────────┘
//!                 ┌──────────────────┐  confidence ≥ 0.9
//!             ──► │  PermanentTier   │ ───────────────────► direct answer
//!                 └──────────────────┘
//!                 ┌──────────────────┐  similarity ≥ threshold
//!             ──► │  OrdinaryTier    │ ───────────────────► cached answer / references
//!                 └──────────────────┘
//!                        ▲    │ access + rating thresholds
//!            learn/save ─┘    └──────────► promote into PermanentTier
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod feedback;
pub mod manager;
pub mod persistence;
pub mod router;
pub mod text;
pub mod tiers;

// Re-export commonly used types
pub use cache::{BoundedCache, CacheStats, EvictionCause, EvictionHook, TtlLruCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{
    BackpressurePolicy, ConfigValidationError, HopeConfig, MonitorConfig, OrdinaryConfig,
    PermanentConfig, RouterConfig, SessionCacheConfig, StreamingConfig,
};
pub use error::{Error, Result};
pub use feedback::{AccuracyLevel, ActivityLevel, FeedbackWeigher, UserContext, UserRole};
pub use manager::{
    AnswerSource, KnowledgeManager, KnowledgeStats, MaintenanceReport, PlainPrompt, PromptSource,
    ReferenceAnswer, ResponseStrategy, SmartQueryResult,
};
pub use router::{DisabledRouter, FastAnswer, FastPath, FastSource, TierRouter};
pub use tiers::{
    CachedQA, ConversationContext, FactualEntry, OrdinaryTier, PermanentTier, SessionCache,
    SkillTemplate,
};
