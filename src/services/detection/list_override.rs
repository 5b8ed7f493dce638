// List Override
// User whitelist / blacklist matching (exact, contains, regex) and item validation.
// A whitelist hit forces zero risk; blacklist hits add weighted risk on top of
// the lexicon score.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ListItem, ListItemDraft, ListKind, Locale, MatchType};
use crate::services::text_processor::{normalize, PreparedText};

/// Weights a blacklist item may carry
pub const BLACKLIST_WEIGHTS: &[u8] = &[1, 2, 3, 5];

const USER_REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("list item text is blank")]
    BlankText,
    #[error("unknown match type: {0:?}")]
    InvalidMatchType(String),
    #[error("unknown locale: {0:?}")]
    InvalidLocale(String),
    #[error("blacklist weight must be one of 1, 2, 3, 5; got {0:?}")]
    InvalidWeight(Option<u8>),
    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("duplicate list item: {0}")]
    Duplicate(String),
}

fn build_user_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(USER_REGEX_SIZE_LIMIT)
        .build()
}

/// Check an already-typed item against the rules for its list
pub fn validate_item(kind: ListKind, item: &ListItem) -> Result<(), ValidationError> {
    if item.text.trim().is_empty() {
        return Err(ValidationError::BlankText);
    }
    if kind == ListKind::Blacklist {
        match item.weight {
            Some(w) if BLACKLIST_WEIGHTS.contains(&w) => {}
            other => return Err(ValidationError::InvalidWeight(other)),
        }
        if item.match_type == MatchType::Regex {
            build_user_regex(&item.text).map_err(|e| ValidationError::InvalidRegex {
                pattern: item.text.clone(),
                message: e.to_string(),
            })?;
        }
    }
    Ok(())
}

/// Turn a raw draft into a typed item with a fresh id
pub fn parse_draft(
    kind: ListKind,
    draft: &ListItemDraft,
    now: DateTime<Utc>,
) -> Result<ListItem, ValidationError> {
    let text = draft.text.trim();
    if text.is_empty() {
        return Err(ValidationError::BlankText);
    }
    let match_type = MatchType::parse(&draft.match_type)
        .ok_or_else(|| ValidationError::InvalidMatchType(draft.match_type.clone()))?;
    let locale = Locale::parse(&draft.locale)
        .ok_or_else(|| ValidationError::InvalidLocale(draft.locale.clone()))?;
    let weight = match kind {
        ListKind::Blacklist => draft.weight,
        ListKind::Whitelist => None,
    };

    let item = ListItem {
        id: Uuid::new_v4(),
        text: text.to_string(),
        match_type,
        locale,
        weight,
        created_at: now,
    };
    validate_item(kind, &item)?;
    Ok(item)
}

#[derive(Debug, Clone)]
struct CompiledItem {
    item: ListItem,
    normalized: String,
    regex: Option<Regex>,
}

impl CompiledItem {
    fn new(item: &ListItem) -> Self {
        let regex = match item.match_type {
            // Invalid user patterns never match
            MatchType::Regex => build_user_regex(&item.text).ok(),
            _ => None,
        };
        Self {
            normalized: normalize(&item.text),
            item: item.clone(),
            regex,
        }
    }

    fn matches(&self, text: &PreparedText<'_>, either_direction: bool) -> bool {
        if !self.item.locale.admits(text.locale) {
            return false;
        }
        match self.item.match_type {
            MatchType::Exact => !self.normalized.is_empty() && self.normalized == text.normalized,
            MatchType::Contains => {
                if self.normalized.is_empty() || text.normalized.is_empty() {
                    return false;
                }
                text.normalized.contains(&self.normalized)
                    || (either_direction && self.normalized.contains(&text.normalized))
            }
            MatchType::Regex => self.regex.as_ref().map_or(false, |re| re.is_match(text.raw)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistHit {
    pub item: ListItem,
    pub weight: f64,
}

/// Immutable matcher snapshot over the current whitelist and blacklist
#[derive(Debug, Clone, Default)]
pub struct ListOverride {
    whitelist: Vec<CompiledItem>,
    blacklist: Vec<CompiledItem>,
}

impl ListOverride {
    pub fn new(whitelist: &[ListItem], blacklist: &[ListItem]) -> Self {
        Self {
            whitelist: whitelist.iter().map(CompiledItem::new).collect(),
            blacklist: blacklist.iter().map(CompiledItem::new).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_whitelisted(&self, text: &str, locale: Locale) -> bool {
        let mut prepared = PreparedText::new(text);
        prepared.locale = locale;
        self.is_whitelisted_prepared(&prepared)
    }

    pub fn blacklist_matches(&self, text: &str, locale: Locale) -> Vec<BlacklistHit> {
        let mut prepared = PreparedText::new(text);
        prepared.locale = locale;
        self.blacklist_matches_prepared(&prepared)
    }

    pub(crate) fn is_whitelisted_prepared(&self, text: &PreparedText<'_>) -> bool {
        self.whitelist.iter().any(|c| c.matches(text, true))
    }

    pub(crate) fn blacklist_matches_prepared(&self, text: &PreparedText<'_>) -> Vec<BlacklistHit> {
        self.blacklist
            .iter()
            .filter(|c| c.matches(text, false))
            .map(|c| BlacklistHit {
                weight: f64::from(c.item.weight.unwrap_or(BLACKLIST_WEIGHTS[0])),
                item: c.item.clone(),
            })
            .collect()
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ListKind, text: &str, m: &str, locale: &str, weight: Option<u8>) -> ListItem {
        let mut draft = ListItemDraft::new(text, m, locale);
        draft.weight = weight;
        parse_draft(kind, &draft, Utc::now()).unwrap()
    }

    #[test]
    fn test_parse_draft_rejects_invalid_items() {
        let now = Utc::now();
        let blank = ListItemDraft::new("   ", "exact", "ko");
        assert_eq!(parse_draft(ListKind::Whitelist, &blank, now), Err(ValidationError::BlankText));

        let bad_match = ListItemDraft::new("abc", "fuzzy", "ko");
        assert!(matches!(
            parse_draft(ListKind::Whitelist, &bad_match, now),
            Err(ValidationError::InvalidMatchType(_))
        ));

        let bad_locale = ListItemDraft::new("abc", "exact", "jp");
        assert!(matches!(
            parse_draft(ListKind::Whitelist, &bad_locale, now),
            Err(ValidationError::InvalidLocale(_))
        ));

        let no_weight = ListItemDraft::new("abc", "exact", "en");
        assert_eq!(
            parse_draft(ListKind::Blacklist, &no_weight, now),
            Err(ValidationError::InvalidWeight(None))
        );

        let odd_weight = ListItemDraft::new("abc", "exact", "en").with_weight(4);
        assert_eq!(
            parse_draft(ListKind::Blacklist, &odd_weight, now),
            Err(ValidationError::InvalidWeight(Some(4)))
        );

        let bad_regex = ListItemDraft::new("(unclosed", "regex", "all").with_weight(2);
        assert!(matches!(
            parse_draft(ListKind::Blacklist, &bad_regex, now),
            Err(ValidationError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_whitelist_weight_is_dropped() {
        let w = item(ListKind::Whitelist, "시발점", "contains", "ko", Some(5));
        assert_eq!(w.weight, None);
    }

    #[test]
    fn test_whitelist_contains_is_bidirectional() {
        let lists = ListOverride::new(&[item(ListKind::Whitelist, "시발점", "contains", "ko", None)], &[]);
        assert!(lists.is_whitelisted("시발점에서 만나요", Locale::Ko));
        assert!(lists.is_whitelisted("시발", Locale::Ko));
        assert!(!lists.is_whitelisted("만나요", Locale::Ko));
        assert!(!lists.is_whitelisted("시발점", Locale::En));
    }

    #[test]
    fn test_blacklist_contains_is_one_directional() {
        let lists = ListOverride::new(&[], &[item(ListKind::Blacklist, "상사놈", "contains", "all", Some(3))]);
        assert_eq!(lists.blacklist_matches("우리 상사놈이", Locale::Ko).len(), 1);
        assert!(lists.blacklist_matches("상사", Locale::Ko).is_empty());
    }

    #[test]
    fn test_exact_match_uses_normalized_text() {
        let lists = ListOverride::new(&[item(ListKind::Whitelist, "Good Job", "exact", "en", None)], &[]);
        assert!(lists.is_whitelisted("good-job!", Locale::En));
        assert!(!lists.is_whitelisted("good job buddy", Locale::En));
    }

    #[test]
    fn test_regex_match_is_case_insensitive() {
        let lists = ListOverride::new(&[], &[item(ListKind::Blacklist, r"\bboss\s+sucks\b", "regex", "all", Some(2))]);
        let hits = lists.blacklist_matches("My BOSS   sucks", Locale::En);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].weight, 2.0);
    }

    #[test]
    fn test_invalid_stored_regex_never_matches() {
        let mut bad = item(ListKind::Whitelist, "ok", "exact", "all", None);
        bad.match_type = MatchType::Regex;
        bad.text = "([".to_string();
        let lists = ListOverride::new(&[bad], &[]);
        assert!(!lists.is_whitelisted("([", Locale::En));
    }

    #[test]
    fn test_all_locale_admits_everything() {
        let lists = ListOverride::new(&[item(ListKind::Whitelist, "ok", "exact", "all", None)], &[]);
        assert!(lists.is_whitelisted("OK", Locale::En));
        assert!(lists.is_whitelisted("OK", Locale::Ko));
    }
}
