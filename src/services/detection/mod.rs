// Detection Module
// Risk assessment and guard decisions, organized into specialized submodules:
// - lexicon: Categorized word sources and the fallback lists
// - pattern_compiler: Noise-tolerant literal / skeleton matchers, compiled once
// - list_override: User whitelist / blacklist matching and validation
// - risk_scorer: Weighted lexicon hits plus contextual heuristics
// - result_cache: Short-TTL verdict memo
// - guard_engine: Synchronous prefilter + asynchronous enhanced verdict

pub mod lexicon;
pub mod pattern_compiler;
pub mod list_override;
pub mod risk_scorer;
pub mod result_cache;
pub mod guard_engine;

// Re-export commonly used items
pub use lexicon::{BuiltinLexicon, JsonLexiconSource, LegacyWordList, LexiconLoadError, LexiconSource};
pub use pattern_compiler::{CompiledLexicon, CompiledPattern, LexiconOrigin, PatternCompiler};
pub use list_override::{BlacklistHit, ListOverride, ValidationError};
pub use risk_scorer::{contextual_risk, RiskScorer};
pub use result_cache::ResultCache;
pub use guard_engine::{
    verdict_for,
    AllowReason,
    EnhancedScorer,
    GuardAction,
    GuardEngine,
    GuardEngineBuilder,
    HoldReason,
    LocalEnhancedScorer,
    PendingGuard,
    QuickVerdict,
    Submission,
};
