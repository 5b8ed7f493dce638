// Lexicon Sources
// Categorized word lists feeding the pattern compiler:
// - BuiltinLexicon: curated categorized list shipped with the crate
// - JsonLexiconSource: categorized list loaded from a JSON file
// - LegacyWordList: flat word list, strength guessed from known stems
// - emergency_lexicon: last resort when everything else fails

use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{Category, LexiconEntry, Locale};

#[derive(Error, Debug)]
pub enum LexiconLoadError {
    #[error("failed to read lexicon {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse lexicon {path}: {message}")]
    Parse { path: String, message: String },
    #[error("lexicon source {0} produced no entries")]
    Empty(String),
}

/// A replaceable source of lexicon entries, loaded once per compilation
pub trait LexiconSource: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError>;
}

// (word, category, locale)
const BUILTIN_ENTRIES: &[(&str, Category, Locale)] = &[
    // Korean strong
    ("씨발", Category::Strong, Locale::Ko),
    ("시발", Category::Strong, Locale::Ko),
    ("씨빨", Category::Strong, Locale::Ko),
    ("씨벌", Category::Strong, Locale::Ko),
    ("좆같", Category::Strong, Locale::Ko),
    ("병신", Category::Strong, Locale::Ko),
    ("개새끼", Category::Strong, Locale::Ko),
    ("개자식", Category::Strong, Locale::Ko),
    ("지랄", Category::Strong, Locale::Ko),
    ("엿먹어", Category::Strong, Locale::Ko),
    // Korean weak
    ("존나", Category::Weak, Locale::Ko),
    ("졸라", Category::Weak, Locale::Ko),
    ("미친", Category::Weak, Locale::Ko),
    ("닥쳐", Category::Weak, Locale::Ko),
    ("꺼져", Category::Weak, Locale::Ko),
    ("멍청이", Category::Weak, Locale::Ko),
    ("쓰레기", Category::Weak, Locale::Ko),
    // Korean adult
    ("딸딸이", Category::Adult, Locale::Ko),
    ("야한동영상", Category::Adult, Locale::Ko),
    ("자위행위", Category::Adult, Locale::Ko),
    // Korean slur
    ("한남충", Category::Slur, Locale::Ko),
    ("김치녀", Category::Slur, Locale::Ko),
    ("틀딱", Category::Slur, Locale::Ko),
    ("짱깨", Category::Slur, Locale::Ko),
    // English strong
    ("fuck", Category::Strong, Locale::En),
    ("motherfucker", Category::Strong, Locale::En),
    ("cunt", Category::Strong, Locale::En),
    ("asshole", Category::Strong, Locale::En),
    ("bitch", Category::Strong, Locale::En),
    ("sibal", Category::Strong, Locale::All),
    // English weak
    ("shit", Category::Weak, Locale::En),
    ("damn", Category::Weak, Locale::En),
    ("crap", Category::Weak, Locale::En),
    ("idiot", Category::Weak, Locale::En),
    ("stupid", Category::Weak, Locale::En),
    ("dumbass", Category::Weak, Locale::En),
    // English adult
    ("porn", Category::Adult, Locale::En),
    ("blowjob", Category::Adult, Locale::En),
    ("pussy", Category::Adult, Locale::En),
    // English slur
    ("retard", Category::Slur, Locale::En),
    ("faggot", Category::Slur, Locale::En),
];

/// Stems that mark a legacy word as high-confidence profanity
const STRONG_STEMS: &[&str] = &["씨발", "시발", "병신", "좆", "개새", "fuck"];

const EMERGENCY_ENTRIES: &[(&str, Category, Locale)] = &[
    ("씨발", Category::Strong, Locale::Ko),
    ("시발", Category::Strong, Locale::Ko),
    ("병신", Category::Strong, Locale::Ko),
    ("개새끼", Category::Strong, Locale::Ko),
    ("fuck", Category::Strong, Locale::En),
    ("sibal", Category::Strong, Locale::All),
];

fn to_entries(table: &[(&str, Category, Locale)]) -> Vec<LexiconEntry> {
    table
        .iter()
        .map(|(word, category, locale)| LexiconEntry::new(word, *category, *locale))
        .collect()
}

/// Hardcoded last-resort list; never empty
pub fn emergency_lexicon() -> Vec<LexiconEntry> {
    to_entries(EMERGENCY_ENTRIES)
}

/// Strength of a legacy (uncategorized) word
pub fn classify_legacy_word(word: &str) -> Category {
    let lower = word.to_lowercase();
    if STRONG_STEMS.iter().any(|stem| lower.contains(stem)) {
        Category::Strong
    } else {
        Category::Weak
    }
}

#[derive(Debug, Default)]
pub struct BuiltinLexicon;

impl LexiconSource for BuiltinLexicon {
    fn name(&self) -> &str {
        "builtin"
    }

    fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError> {
        Ok(to_entries(BUILTIN_ENTRIES))
    }
}

/// JSON array of `{word, category, locale}` records
#[derive(Debug, Clone)]
pub struct JsonLexiconSource {
    path: PathBuf,
    label: String,
}

impl JsonLexiconSource {
    pub fn new(path: PathBuf) -> Self {
        let label = path.display().to_string();
        Self { path, label }
    }
}

impl LexiconSource for JsonLexiconSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError> {
        let content = fs::read_to_string(&self.path).map_err(|e| LexiconLoadError::Io {
            path: self.label.clone(),
            message: e.to_string(),
        })?;
        let entries: Vec<LexiconEntry> =
            serde_json::from_str(&content).map_err(|e| LexiconLoadError::Parse {
                path: self.label.clone(),
                message: e.to_string(),
            })?;
        if entries.is_empty() {
            return Err(LexiconLoadError::Empty(self.label.clone()));
        }
        Ok(entries)
    }
}

/// Flat word list (one word per line, `#` comments allowed)
#[derive(Debug, Clone)]
pub enum LegacyWordList {
    File(PathBuf),
    Inline(Vec<String>),
}

impl LegacyWordList {
    fn parse_lines(content: &str) -> Vec<String> {
        content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.to_string())
            .collect()
    }

    fn classify(words: Vec<String>) -> Vec<LexiconEntry> {
        words
            .into_iter()
            .map(|w| {
                let category = classify_legacy_word(&w);
                LexiconEntry {
                    word: w,
                    category,
                    locale: Locale::All,
                }
            })
            .collect()
    }
}

impl LexiconSource for LegacyWordList {
    fn name(&self) -> &str {
        match self {
            LegacyWordList::File(_) => "legacy-file",
            LegacyWordList::Inline(_) => "legacy-inline",
        }
    }

    fn load(&self) -> Result<Vec<LexiconEntry>, LexiconLoadError> {
        let words = match self {
            LegacyWordList::File(path) => {
                let content = fs::read_to_string(path).map_err(|e| LexiconLoadError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Self::parse_lines(&content)
            }
            LegacyWordList::Inline(words) => words.clone(),
        };
        if words.is_empty() {
            return Err(LexiconLoadError::Empty(self.name().to_string()));
        }
        Ok(Self::classify(words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lexicon_covers_every_category() {
        let entries = BuiltinLexicon.load().unwrap();
        for category in [Category::Strong, Category::Weak, Category::Adult, Category::Slur] {
            assert!(entries.iter().any(|e| e.category == category), "missing {:?}", category);
        }
        assert!(entries.iter().any(|e| e.word == "씨발" && e.category == Category::Strong));
    }

    #[test]
    fn test_emergency_lexicon_is_small_and_non_empty() {
        let entries = emergency_lexicon();
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().all(|e| e.category == Category::Strong));
    }

    #[test]
    fn test_legacy_classifier() {
        assert_eq!(classify_legacy_word("씨발놈"), Category::Strong);
        assert_eq!(classify_legacy_word("FUCKING"), Category::Strong);
        assert_eq!(classify_legacy_word("바보"), Category::Weak);
    }

    #[test]
    fn test_legacy_inline_list() {
        let source = LegacyWordList::Inline(vec!["개새야".to_string(), "멍충이".to_string()]);
        let entries = source.load().unwrap();
        assert_eq!(entries[0].category, Category::Strong);
        assert_eq!(entries[1].category, Category::Weak);
        assert_eq!(entries[1].locale, Locale::All);
    }

    #[test]
    fn test_legacy_file_skips_comments_and_blanks() {
        let path = std::env::temp_dir().join(format!("cleanchat_legacy_{}.txt", uuid::Uuid::new_v4()));
        fs::write(&path, "# header\n\nfuckwit\n  바보  \n").unwrap();
        let entries = LegacyWordList::File(path.clone()).load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].word, "바보");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_json_source_errors() {
        let missing = JsonLexiconSource::new(PathBuf::from("/nonexistent/cleanchat/lexicon.json"));
        assert!(matches!(missing.load(), Err(LexiconLoadError::Io { .. })));

        let path = std::env::temp_dir().join(format!("cleanchat_lexicon_{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, "[]").unwrap();
        assert!(matches!(JsonLexiconSource::new(path.clone()).load(), Err(LexiconLoadError::Empty(_))));

        fs::write(&path, r#"[{"word": "x", "category": "nope"}]"#).unwrap();
        assert!(matches!(JsonLexiconSource::new(path.clone()).load(), Err(LexiconLoadError::Parse { .. })));

        fs::write(&path, r#"[{"word": "빡대가리", "category": "weak", "locale": "ko"}]"#).unwrap();
        let entries = JsonLexiconSource::new(path.clone()).load().unwrap();
        assert_eq!(entries[0].locale, Locale::Ko);
        let _ = fs::remove_file(path);
    }
}
