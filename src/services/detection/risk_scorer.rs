// Risk Scorer
// Weighted lexicon matching plus structural heuristics over the raw text.
// Produces a capped score in [0, 10], the matches that explain it, and a risk tier.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use crate::models::{CategoryWeights, MatchKind, RiskAssessment, RiskLevel, RiskMatch, MAX_RISK_SCORE};
use crate::services::text_processor::PreparedText;

use super::list_override::ListOverride;
use super::pattern_compiler::CompiledLexicon;

static EXCLAMATION_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[!！]+").expect("static exclamation pattern"));
static QUESTION_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?？]+").expect("static question pattern"));
static MIXED_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?？][!！]|[!！][?？]").expect("static mixed punctuation pattern"));
static UPPERCASE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]{4,}").expect("static uppercase pattern"));
static IMPERATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:해라|하라|마라|가라|와라|꺼져|닥쳐|하지\s*마|해\s*봐라)(?:[\s.!?~]|$)")
        .expect("static imperative pattern")
});
static AGGRESSIVE_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:kill|hate|die|destroy|shut\s+up|moron)\b").expect("static aggressive pattern")
});

const AGGRESSIVE_KO: &[&str] = &["죽여", "죽일", "죽어", "패버", "때려", "가만안둬"];
const URGENCY_WORDS: &[&str] = &["빨리", "당장", "즉시", "asap", "urgent", "immediately", "right now"];

const MULTI_RUN_WEIGHT: f64 = 0.5;
const MIXED_PUNCT_WEIGHT: f64 = 0.5;
const AGGRESSIVE_WEIGHT: f64 = 0.3;
const SHOUTING_RATIO_WEIGHT: f64 = 0.5;
const UPPERCASE_RUN_WEIGHT: f64 = 1.0;
const IMPERATIVE_WEIGHT: f64 = 1.0;
const URGENCY_WEIGHT: f64 = 0.5;

const SHOUTING_MIN_LETTERS: usize = 6;
const SHOUTING_MIN_RATIO: f64 = 0.5;

/// Structural heuristics over the raw text: (score, factor labels)
pub fn contextual_risk(raw: &str) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut factors = Vec::new();

    if EXCLAMATION_RUN_RE.find_iter(raw).count() >= 2 {
        score += MULTI_RUN_WEIGHT;
        factors.push("multiple_exclamations".to_string());
    }
    if QUESTION_RUN_RE.find_iter(raw).count() >= 2 {
        score += MULTI_RUN_WEIGHT;
        factors.push("multiple_questions".to_string());
    }
    if MIXED_PUNCT_RE.is_match(raw) {
        score += MIXED_PUNCT_WEIGHT;
        factors.push("mixed_punctuation".to_string());
    }

    let lower = raw.to_lowercase();
    let mut aggressive: BTreeSet<String> = AGGRESSIVE_KO
        .iter()
        .filter(|w| lower.contains(*w))
        .map(|w| w.to_string())
        .collect();
    for m in AGGRESSIVE_EN_RE.find_iter(raw) {
        let word: Vec<&str> = m.as_str().split_whitespace().collect();
        aggressive.insert(word.join(" ").to_lowercase());
    }
    for word in &aggressive {
        score += AGGRESSIVE_WEIGHT;
        factors.push(format!("aggressive:{}", word));
    }

    let latin: Vec<char> = raw.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if latin.len() >= SHOUTING_MIN_LETTERS {
        let upper = latin.iter().filter(|c| c.is_ascii_uppercase()).count();
        if upper as f64 / latin.len() as f64 >= SHOUTING_MIN_RATIO {
            score += SHOUTING_RATIO_WEIGHT;
            factors.push("shouting_ratio".to_string());
        }
    }
    if UPPERCASE_RUN_RE.is_match(raw) {
        score += UPPERCASE_RUN_WEIGHT;
        factors.push("uppercase_run".to_string());
    }

    if IMPERATIVE_RE.is_match(raw) {
        score += IMPERATIVE_WEIGHT;
        factors.push("imperative_ending".to_string());
    }

    if URGENCY_WORDS.iter().any(|w| lower.contains(w)) {
        score += URGENCY_WEIGHT;
        factors.push("urgency".to_string());
    }

    (score, factors)
}

fn round_score(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}

/// Scores text against one compiled lexicon with one category weight table
#[derive(Debug, Clone)]
pub struct RiskScorer {
    lexicon: Arc<CompiledLexicon>,
    weights: CategoryWeights,
}

impl RiskScorer {
    pub fn new(lexicon: Arc<CompiledLexicon>, weights: CategoryWeights) -> Self {
        Self { lexicon, weights }
    }

    pub fn lexicon(&self) -> &Arc<CompiledLexicon> {
        &self.lexicon
    }

    pub fn weights(&self) -> &CategoryWeights {
        &self.weights
    }

    pub fn score(&self, raw: &str, lists: &ListOverride) -> RiskAssessment {
        self.score_prepared(&PreparedText::new(raw), lists)
    }

    pub fn score_prepared(&self, text: &PreparedText<'_>, lists: &ListOverride) -> RiskAssessment {
        if text.is_blank() {
            return RiskAssessment::clean();
        }
        if lists.is_whitelisted_prepared(text) {
            return RiskAssessment::whitelisted();
        }

        let hits: Vec<_> = self
            .lexicon
            .patterns()
            .iter()
            .filter_map(|pattern| pattern.match_kind(text).map(|kind| (pattern, kind)))
            .collect();

        // Direct hits claim their skeleton first; a skeleton hit only counts for
        // a skeleton no direct hit has claimed
        let mut matches: Vec<RiskMatch> = Vec::new();
        let mut claimed: BTreeSet<&str> = BTreeSet::new();
        let mut lexicon_total = 0.0;

        for pass in [MatchKind::Direct, MatchKind::Skeleton] {
            for &(pattern, kind) in hits.iter().filter(|(_, kind)| *kind == pass) {
                // Past the cap further hits cannot change the final score
                if lexicon_total >= MAX_RISK_SCORE {
                    break;
                }
                if kind == MatchKind::Skeleton && claimed.contains(pattern.skeleton.as_str()) {
                    continue;
                }
                let weight = self.weights.weight(pattern.category);
                lexicon_total += weight;
                claimed.insert(pattern.skeleton.as_str());
                matches.push(RiskMatch {
                    word: pattern.word.clone(),
                    category: pattern.category,
                    locale: pattern.locale,
                    weight,
                    match_type: kind,
                });
            }
        }

        let (context_total, mut factors) = contextual_risk(text.raw);
        let mut score = (lexicon_total + context_total).clamp(0.0, MAX_RISK_SCORE);

        let hits = lists.blacklist_matches_prepared(text);
        if !hits.is_empty() {
            let blacklist_total: f64 = hits.iter().map(|h| h.weight).sum();
            for hit in &hits {
                factors.push(format!("blacklist:{}", hit.item.text));
            }
            score = (score + blacklist_total).clamp(0.0, MAX_RISK_SCORE);
        }

        let score = round_score(score);
        RiskAssessment {
            score,
            matches,
            contextual_factors: factors,
            risk_level: RiskLevel::from_score(score),
            whitelisted: false,
        }
    }
}
