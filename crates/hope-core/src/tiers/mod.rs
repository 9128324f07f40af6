//! The three knowledge tiers, from most to least durable.

pub mod ordinary;
pub mod permanent;
pub mod session;

pub use ordinary::{CachedQA, OrdinaryQueryResult, OrdinaryStats, OrdinaryTier, SaveOutcome, SimilarMatch};
pub use permanent::{
    FactualEntry, NewFact, NewSkillTemplate, PermanentQueryResult, PermanentStats, PermanentTier,
    SkillTemplate,
};
pub use session::{
    ConversationContext, SessionCache, SessionCacheStats, SessionQueryResult, Speaker, TempDefinition,
    Turn,
};
