// CleanChat Data Models
// Shared types passed between the scorer, the list matcher and the guard engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound of every risk score
pub const MAX_RISK_SCORE: f64 = 10.0;

// ============ Lexicon ============

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Strong,
    Weak,
    Adult,
    Slur,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Strong => "strong",
            Category::Weak => "weak",
            Category::Adult => "adult",
            Category::Slur => "slur",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Ko,
    En,
    #[default]
    All,
}

impl Locale {
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "ko" => Some(Self::Ko),
            "en" => Some(Self::En),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// An item scoped to `self` applies to text detected as `text_locale`
    pub fn admits(&self, text_locale: Locale) -> bool {
        *self == Locale::All || *self == text_locale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexiconEntry {
    pub word: String,
    pub category: Category,
    #[serde(default)]
    pub locale: Locale,
}

impl LexiconEntry {
    pub fn new(word: &str, category: Category, locale: Locale) -> Self {
        Self {
            word: word.to_string(),
            category,
            locale,
        }
    }
}

/// Category -> weight table. Two independent tables exist: one for the
/// synchronous prefilter, one for the enhanced scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryWeights {
    pub strong: f64,
    pub adult: f64,
    pub slur: f64,
    pub weak: f64,
}

impl CategoryWeights {
    pub fn prefilter() -> Self {
        Self {
            strong: 5.0,
            adult: 4.0,
            slur: 4.0,
            weak: 2.0,
        }
    }

    pub fn enhanced() -> Self {
        Self {
            strong: 4.0,
            adult: 2.0,
            slur: 4.0,
            weak: 1.0,
        }
    }

    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::Strong => self.strong,
            Category::Adult => self.adult,
            Category::Slur => self.slur,
            Category::Weak => self.weak,
        }
    }
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self::prefilter()
    }
}

// ============ User Lists ============

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

impl MatchType {
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub id: Uuid,
    pub text: String,
    #[serde(rename = "match")]
    pub match_type: MatchType,
    pub locale: Locale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl ListItem {
    /// Duplicate detection key: same text, match type and locale
    pub fn same_rule(&self, other: &ListItem) -> bool {
        self.text == other.text && self.match_type == other.match_type && self.locale == other.locale
    }
}

/// Raw, unvalidated list item as received from a settings surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItemDraft {
    pub text: String,
    #[serde(rename = "match", default)]
    pub match_type: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub weight: Option<u8>,
}

impl ListItemDraft {
    pub fn new(text: &str, match_type: &str, locale: &str) -> Self {
        Self {
            text: text.to_string(),
            match_type: match_type.to_string(),
            locale: locale.to_string(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = Some(weight);
        self
    }
}

// ============ Domain Rules ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRule {
    pub domain: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DomainRule {
    pub fn new(domain: &str, now: DateTime<Utc>) -> Self {
        Self {
            domain: domain.to_string(),
            enabled: true,
            pause_until: None,
            updated_at: now,
        }
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.pause_until.map_or(false, |until| until > now)
    }

    /// Disabled, or paused into the future
    pub fn disables_guard(&self, now: DateTime<Utc>) -> bool {
        !self.enabled || self.is_paused(now)
    }
}

// ============ Risk Assessment ============

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Direct,
    Skeleton,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMatch {
    pub word: String,
    pub category: Category,
    pub locale: Locale,
    pub weight: f64,
    pub match_type: MatchKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 2.0 {
            RiskLevel::Low
        } else if score < 4.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: f64,
    pub matches: Vec<RiskMatch>,
    pub contextual_factors: Vec<String>,
    pub risk_level: RiskLevel,
    pub whitelisted: bool,
}

impl RiskAssessment {
    pub fn clean() -> Self {
        Self {
            score: 0.0,
            matches: Vec::new(),
            contextual_factors: Vec::new(),
            risk_level: RiskLevel::Low,
            whitelisted: false,
        }
    }

    pub fn whitelisted() -> Self {
        Self {
            whitelisted: true,
            ..Self::clean()
        }
    }
}

// ============ Cache ============

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheMode {
    Send,
    Convert,
    WarningAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub mode: CacheMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============ Guard Decisions ============

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    Warn,
    #[default]
    Convert,
}

impl GuardMode {
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "warn" => Some(Self::Warn),
            "convert" => Some(Self::Convert),
            _ => None,
        }
    }
}

/// Verdict tier derived from a risk score
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Prompt,
    Convert,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecideAction {
    Send,
    Convert,
}

/// Reply of the remote decision service for ambiguous text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideResponse {
    pub action: DecideAction,
    #[serde(default)]
    pub converted_text: Option<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_risk_level_steps() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(1.9), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(2.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(3.5), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(4.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(10.0), RiskLevel::High);
    }

    #[test]
    fn test_weight_tables_are_independent() {
        let pre = CategoryWeights::prefilter();
        let enh = CategoryWeights::enhanced();
        assert_eq!(pre.weight(Category::Strong), 5.0);
        assert_eq!(enh.weight(Category::Strong), 4.0);
        assert_eq!(pre.weight(Category::Weak), 2.0);
        assert_eq!(enh.weight(Category::Adult), 2.0);
    }

    #[test]
    fn test_domain_rule_disabling() {
        let now = Utc::now();
        let mut rule = DomainRule::new("example.com", now);
        assert!(!rule.disables_guard(now));

        rule.pause_until = Some(now + Duration::minutes(5));
        assert!(rule.disables_guard(now));
        assert!(!rule.disables_guard(now + Duration::minutes(6)));

        rule.pause_until = None;
        rule.enabled = false;
        assert!(rule.disables_guard(now));
    }

    #[test]
    fn test_list_item_serialization_uses_match_key() {
        let item = ListItem {
            id: Uuid::new_v4(),
            text: "시발점".to_string(),
            match_type: MatchType::Contains,
            locale: Locale::Ko,
            weight: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["match"], "contains");
        assert_eq!(json["locale"], "ko");
        assert!(json.get("weight").is_none());
    }
}
