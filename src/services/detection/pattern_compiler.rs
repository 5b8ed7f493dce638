// Pattern Compiler
// Turns lexicon entries into noise-tolerant matchers (literal + consonant skeleton).
// Compilation happens once per compiler and is shared by every caller; the
// lexicon is loaded through a fallback chain: primary -> legacy -> emergency.

use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{Category, LexiconEntry, Locale, MatchKind};
use crate::services::config_store::GuardConfig;
use crate::services::text_processor::{normalize, skeleton, PreparedText, NOISE_CLASS};

use super::lexicon::{
    emergency_lexicon, BuiltinLexicon, JsonLexiconSource, LegacyWordList, LexiconSource,
};

/// Shorter skeletons collide with too many ordinary words
const MIN_SKELETON_LEN: usize = 3;

/// Build a case-insensitive regex that tolerates any run of noise
/// characters between the characters of `word`.
pub fn noise_tolerant_pattern(word: &str) -> String {
    let gap = format!("{}*", NOISE_CLASS);
    let parts: Vec<String> = word.chars().map(|c| regex::escape(&c.to_string())).collect();
    format!("(?i){}", parts.join(&gap))
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub word: String,
    pub category: Category,
    pub locale: Locale,
    pub normalized: String,
    pub skeleton: String,
    literal: Regex,
    skeleton_matcher: Option<Regex>,
}

impl CompiledPattern {
    /// None when the word normalizes to nothing or its regex fails to build
    pub fn compile(entry: &LexiconEntry) -> Option<Self> {
        let normalized = normalize(&entry.word);
        if normalized.is_empty() {
            return None;
        }
        let skel = skeleton(&normalized);

        let literal = Regex::new(&noise_tolerant_pattern(&normalized)).ok()?;
        let skeleton_matcher = if skel != normalized && skel.chars().count() >= MIN_SKELETON_LEN {
            Regex::new(&noise_tolerant_pattern(&skel)).ok()
        } else {
            None
        };

        Some(Self {
            word: entry.word.clone(),
            category: entry.category,
            locale: entry.locale,
            normalized,
            skeleton: skel,
            literal,
            skeleton_matcher,
        })
    }

    /// Literal first; the skeleton matcher is only a fallback detector
    pub fn match_kind(&self, text: &PreparedText<'_>) -> Option<MatchKind> {
        if self.literal.is_match(&text.normalized) {
            return Some(MatchKind::Direct);
        }
        match &self.skeleton_matcher {
            Some(re) if re.is_match(&text.skeleton) => Some(MatchKind::Skeleton),
            _ => None,
        }
    }

    pub fn has_skeleton_matcher(&self) -> bool {
        self.skeleton_matcher.is_some()
    }
}

/// Which stage of the fallback chain produced the patterns
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LexiconOrigin {
    Primary,
    Legacy,
    Emergency,
}

#[derive(Debug)]
pub struct CompiledLexicon {
    patterns: Vec<CompiledPattern>,
    origin: LexiconOrigin,
    source: String,
}

impl CompiledLexicon {
    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    pub fn origin(&self) -> LexiconOrigin {
        self.origin
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Detection runs on the emergency list only
    pub fn is_degraded(&self) -> bool {
        self.origin == LexiconOrigin::Emergency
    }
}

pub struct PatternCompiler {
    primary: Arc<dyn LexiconSource>,
    legacy: Option<Arc<dyn LexiconSource>>,
    compiled: Mutex<Option<Arc<CompiledLexicon>>>,
    compilations: AtomicUsize,
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinLexicon))
    }
}

impl PatternCompiler {
    pub fn new(primary: Arc<dyn LexiconSource>) -> Self {
        Self {
            primary,
            legacy: None,
            compiled: Mutex::new(None),
            compilations: AtomicUsize::new(0),
        }
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn LexiconSource>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Sources from config: a JSON lexicon file if set, else the builtin list
    pub fn from_config(config: &GuardConfig) -> Self {
        let primary: Arc<dyn LexiconSource> = match &config.lexicon_path {
            Some(path) => Arc::new(JsonLexiconSource::new(path.clone())),
            None => Arc::new(BuiltinLexicon),
        };
        let compiler = Self::new(primary);
        match &config.legacy_word_list_path {
            Some(path) => compiler.with_legacy(Arc::new(LegacyWordList::File(path.clone()))),
            None => compiler,
        }
    }

    /// Compile once; concurrent callers wait for the same compilation
    pub async fn compile(&self) -> Arc<CompiledLexicon> {
        let mut slot = self.compiled.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }

        let started = Instant::now();
        let lexicon = Arc::new(self.compile_with_fallback());
        self.compilations.fetch_add(1, Ordering::SeqCst);
        info!(
            "[pattern_compiler] Compiled {} patterns from {} ({:?}) in {}ms",
            lexicon.len(),
            lexicon.source(),
            lexicon.origin(),
            started.elapsed().as_millis()
        );
        *slot = Some(Arc::clone(&lexicon));
        lexicon
    }

    /// Drop the memoized patterns so the next `compile` reloads the sources
    pub async fn invalidate(&self) {
        *self.compiled.lock().await = None;
    }

    /// Number of compilations performed so far
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    fn compile_with_fallback(&self) -> CompiledLexicon {
        match self.primary.load() {
            Ok(entries) => {
                let patterns = compile_entries(&entries);
                if !patterns.is_empty() {
                    return CompiledLexicon {
                        patterns,
                        origin: LexiconOrigin::Primary,
                        source: self.primary.name().to_string(),
                    };
                }
                warn!("[pattern_compiler] Primary lexicon {} compiled to nothing", self.primary.name());
            }
            Err(e) => warn!("[pattern_compiler] Primary lexicon failed: {}", e),
        }

        if let Some(legacy) = &self.legacy {
            match legacy.load() {
                Ok(entries) => {
                    let patterns = compile_entries(&entries);
                    if !patterns.is_empty() {
                        return CompiledLexicon {
                            patterns,
                            origin: LexiconOrigin::Legacy,
                            source: legacy.name().to_string(),
                        };
                    }
                    warn!("[pattern_compiler] Legacy list {} compiled to nothing", legacy.name());
                }
                Err(e) => warn!("[pattern_compiler] Legacy word list failed: {}", e),
            }
        }

        warn!("[pattern_compiler] Falling back to emergency lexicon, detection is degraded");
        CompiledLexicon {
            patterns: compile_entries(&emergency_lexicon()),
            origin: LexiconOrigin::Emergency,
            source: "emergency".to_string(),
        }
    }
}

/// Compile entries, skipping unusable ones and duplicate normalized words
fn compile_entries(entries: &[LexiconEntry]) -> Vec<CompiledPattern> {
    let mut patterns: Vec<CompiledPattern> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(pattern) = CompiledPattern::compile(entry) else {
            continue;
        };
        if patterns.iter().any(|p| p.normalized == pattern.normalized) {
            continue;
        }
        patterns.push(pattern);
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detection::lexicon::LexiconLoadError;

    struct FailingSource;

    impl LexiconSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }
        fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError> {
            Err(LexiconLoadError::Empty("failing".to_string()))
        }
    }

    struct BlankSource;

    impl LexiconSource for BlankSource {
        fn name(&self) -> &str {
            "blank"
        }
        fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError> {
            Ok(vec![LexiconEntry::new(" !! ", Category::Strong, Locale::All)])
        }
    }

    fn entry(word: &str) -> LexiconEntry {
        LexiconEntry::new(word, Category::Strong, Locale::All)
    }

    #[test]
    fn test_noise_tolerant_pattern_matches_separated_letters() {
        let re = Regex::new(&noise_tolerant_pattern("sibal")).unwrap();
        assert!(re.is_match("s.i.b.a.l"));
        assert!(re.is_match("S I B A L"));
        assert!(re.is_match("s\u{200B}ibal"));
        assert!(!re.is_match("s1bal"));
    }

    #[test]
    fn test_pattern_literal_and_skeleton_matches() {
        let pattern = CompiledPattern::compile(&entry("씨발")).unwrap();
        assert_eq!(pattern.skeleton, "ㅆㅂㄹ");
        assert!(pattern.has_skeleton_matcher());

        let direct = PreparedText::new("씨.발");
        assert_eq!(pattern.match_kind(&direct), Some(MatchKind::Direct));

        // Vowels swapped: only the skeleton survives
        let vowel_swap = PreparedText::new("쓰 벌");
        assert_eq!(pattern.match_kind(&vowel_swap), Some(MatchKind::Skeleton));
        let unrelated = PreparedText::new("사발");
        assert_eq!(pattern.match_kind(&unrelated), None);

        let jamo_only = PreparedText::new("ㅆ ㅂ ㄹ");
        assert_eq!(pattern.match_kind(&jamo_only), Some(MatchKind::Skeleton));
    }

    #[test]
    fn test_short_skeletons_have_no_skeleton_matcher() {
        let pattern = CompiledPattern::compile(&entry("꺼져")).unwrap();
        assert!(!pattern.has_skeleton_matcher());
        let latin = CompiledPattern::compile(&entry("fuck")).unwrap();
        assert!(!latin.has_skeleton_matcher());
    }

    #[test]
    fn test_compile_entries_skips_blank_and_duplicates() {
        let patterns = compile_entries(&[entry("Fuck"), entry("f.u.c.k"), entry("  "), entry("병신")]);
        assert_eq!(patterns.len(), 2);
    }

    #[tokio::test]
    async fn test_compile_is_memoized_across_concurrent_callers() {
        let compiler = Arc::new(PatternCompiler::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&compiler);
            handles.push(tokio::spawn(async move { c.compile().await.len() }));
        }
        for h in handles {
            assert!(h.await.unwrap() > 0);
        }
        assert_eq!(compiler.compilations(), 1);

        compiler.invalidate().await;
        compiler.compile().await;
        assert_eq!(compiler.compilations(), 2);
    }

    #[tokio::test]
    async fn test_fallback_to_legacy() {
        let compiler = PatternCompiler::new(Arc::new(FailingSource))
            .with_legacy(Arc::new(LegacyWordList::Inline(vec!["씨발놈".to_string()])));
        let lexicon = compiler.compile().await;
        assert_eq!(lexicon.origin(), LexiconOrigin::Legacy);
        assert_eq!(lexicon.patterns()[0].category, Category::Strong);
        assert!(!lexicon.is_degraded());
    }

    #[tokio::test]
    async fn test_fallback_to_emergency_is_never_empty() {
        let compiler = PatternCompiler::new(Arc::new(BlankSource)).with_legacy(Arc::new(FailingSource));
        let lexicon = compiler.compile().await;
        assert_eq!(lexicon.origin(), LexiconOrigin::Emergency);
        assert!(lexicon.is_degraded());
        assert!(!lexicon.is_empty());
    }
}
